//! WBI request signing.
//!
//! The platform rejects modern API calls unless their query carries `wts` (a
//! Unix timestamp) and `w_rid`, an MD5 over the sorted, percent-encoded query
//! plus a "mixin key". The mixin key is a fixed permutation of two key halves
//! that rotate server-side and are published as the filename stems of two
//! image URLs on the "current user" endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, ShimError};
use crate::fetcher::Fetch;
use crate::query::percent_encode;

pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(10 * 60);

const MIXIN_KEY_TABLE: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];
const MIXIN_KEY_LEN: usize = 32;
const STRIPPED_CHARS: [char; 5] = ['!', '\'', '(', ')', '*'];

/// Ordered query parameters.
pub type Params = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WbiKeyPair {
    pub img_key: String,
    pub sub_key: String,
    pub fetched_at: DateTime<Utc>,
}

impl WbiKeyPair {
    pub fn new(img_key: impl Into<String>, sub_key: impl Into<String>) -> Self {
        Self {
            img_key: img_key.into(),
            sub_key: sub_key.into(),
            fetched_at: Utc::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.fetched_at);
        age.to_std().map(|age| age < ttl).unwrap_or(true)
    }

    pub fn mixin_key(&self) -> String {
        mixin_key(&format!("{}{}", self.img_key, self.sub_key))
    }
}

#[derive(Deserialize)]
struct NavResponse {
    #[serde(default)]
    data: Option<NavData>,
}

#[derive(Deserialize)]
struct NavData {
    #[serde(default)]
    wbi_img: Option<WbiImg>,
}

#[derive(Deserialize)]
struct WbiImg {
    #[serde(default)]
    img_url: String,
    #[serde(default)]
    sub_url: String,
}

pub struct Signer {
    fetcher: Arc<dyn Fetch>,
    nav_url: String,
    ttl: Duration,
    slot: RwLock<Option<WbiKeyPair>>,
}

impl Signer {
    pub fn new(fetcher: Arc<dyn Fetch>, api_base: &str, ttl: Duration) -> Self {
        Self {
            fetcher,
            nav_url: format!("{api_base}/x/web-interface/nav"),
            ttl,
            slot: RwLock::new(None),
        }
    }

    /// Installs a key pair directly, e.g. one restored by the caller.
    pub fn seed(&self, keys: WbiKeyPair) {
        *self.slot.write() = Some(keys);
    }

    /// Signs `params` with the current key pair, fetching a fresh pair first
    /// when the cached one is missing or older than the TTL.
    pub fn sign(&self, params: &[(String, String)]) -> Result<Params> {
        let keys = self.keys()?;
        Ok(sign_at(params, &keys, Utc::now().timestamp()))
    }

    /// Cached key pair, refreshed when stale. The slot lock is not held while
    /// fetching, so concurrent callers may each refresh once.
    pub fn keys(&self) -> Result<WbiKeyPair> {
        let now = Utc::now();
        let cached = self.slot.read().clone();
        if let Some(keys) = cached.filter(|keys| keys.is_fresh(self.ttl, now)) {
            return Ok(keys);
        }

        let keys = self.fetch_keys()?;
        *self.slot.write() = Some(keys.clone());
        Ok(keys)
    }

    fn fetch_keys(&self) -> Result<WbiKeyPair> {
        let headers = [
            ("User-Agent".to_owned(), "Mozilla/5.0".to_owned()),
            ("Referer".to_owned(), "https://www.bilibili.com".to_owned()),
        ];
        debug!(url = %self.nav_url, "fetching signing keys");
        let response = self
            .fetcher
            .get(&self.nav_url, &headers)
            .map_err(ShimError::KeyFetch)?;

        // Logged-out answers carry code -101 but still include `wbi_img`.
        let nav: NavResponse = serde_json::from_str(&response.body)?;
        let img = nav.data.and_then(|data| data.wbi_img);
        let (img_key, sub_key) = match img {
            Some(img) => (filename_stem(&img.img_url), filename_stem(&img.sub_url)),
            None => (String::new(), String::new()),
        };
        if img_key.trim().is_empty() || sub_key.trim().is_empty() {
            return Err(ShimError::MissingSigningKeys);
        }
        info!("refreshed signing keys");
        Ok(WbiKeyPair::new(img_key, sub_key))
    }
}

/// Signs `params` at a fixed timestamp. Output keeps the input order with
/// filtered values, followed by `wts` and `w_rid`.
pub fn sign_at(params: &[(String, String)], keys: &WbiKeyPair, wts: i64) -> Params {
    let mut signed: Params = params
        .iter()
        .filter(|(key, _)| key != "wts" && key != "w_rid")
        .map(|(key, value)| (key.clone(), strip_reserved(value)))
        .collect();
    signed.push(("wts".to_owned(), wts.to_string()));

    let mut sorted: Vec<&(String, String)> = signed.iter().collect();
    sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let w_rid = format!("{:x}", md5::compute(format!("{query}{}", keys.mixin_key())));
    signed.push(("w_rid".to_owned(), w_rid));
    signed
}

/// Applies the fixed permutation to `raw` and keeps the first 32 characters.
pub fn mixin_key(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    MIXIN_KEY_TABLE
        .iter()
        .filter_map(|&idx| chars.get(idx))
        .take(MIXIN_KEY_LEN)
        .collect()
}

fn strip_reserved(value: &str) -> String {
    value.chars().filter(|c| !STRIPPED_CHARS.contains(c)).collect()
}

/// `https://host/bfs/wbi/7cd0...077c.png` → `7cd0...077c`.
fn filename_stem(url: &str) -> String {
    let name = url.rsplit('/').next().unwrap_or_default();
    name.split('.').next().unwrap_or_default().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::StubFetcher;

    const IMG_KEY: &str = "7cd084941338484aae1ad9425b84077c";
    const SUB_KEY: &str = "4932caff0ff746eab6f01bf08b70ac45";
    const NAV_BODY: &str = r#"{"code":-101,"message":"账号未登录","data":{"isLogin":false,"wbi_img":{"img_url":"https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png","sub_url":"https://i0.hdslb.com/bfs/wbi/4932caff0ff746eab6f01bf08b70ac45.png"}}}"#;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn value<'a>(signed: &'a Params, key: &str) -> &'a str {
        signed
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[test]
    fn mixin_key_matches_known_value() {
        let keys = WbiKeyPair::new(IMG_KEY, SUB_KEY);
        assert_eq!(keys.mixin_key(), "ea1db124af3c7062474693fa704f4ff8");
    }

    #[test]
    fn mixin_key_skips_out_of_range_indices() {
        assert_eq!(mixin_key("abc"), "cab");
    }

    #[test]
    fn sign_at_matches_known_vector() {
        let keys = WbiKeyPair::new(IMG_KEY, SUB_KEY);
        let signed = sign_at(
            &params(&[("foo", "114"), ("bar", "514"), ("zab", "1919810")]),
            &keys,
            1702204169,
        );
        assert_eq!(
            signed,
            params(&[
                ("foo", "114"),
                ("bar", "514"),
                ("zab", "1919810"),
                ("wts", "1702204169"),
                ("w_rid", "8f6f2b5b3d485fe1886cec6a0be8c5d4"),
            ])
        );
    }

    #[test]
    fn sign_at_encodes_non_ascii_values() {
        let keys = WbiKeyPair::new(IMG_KEY, SUB_KEY);
        let signed = sign_at(
            &params(&[("foo", "one one four"), ("bar", "五一四"), ("baz", "1919810")]),
            &keys,
            1702204169,
        );
        assert_eq!(value(&signed, "w_rid"), "04e50b58980e3e3cee8cbc0cc4c1c530");
    }

    #[test]
    fn sign_at_strips_reserved_characters_from_values_only() {
        let keys = WbiKeyPair::new(IMG_KEY, SUB_KEY);
        let dirty = sign_at(&params(&[("q*", "it's (fine)!*")]), &keys, 1);
        assert_eq!(dirty[0], ("q*".to_string(), "its fine".to_string()));

        let clean = sign_at(&params(&[("q*", "its fine")]), &keys, 1);
        assert_eq!(value(&dirty, "w_rid"), value(&clean, "w_rid"));
    }

    #[test]
    fn sign_at_replaces_stale_signature_fields() {
        let keys = WbiKeyPair::new(IMG_KEY, SUB_KEY);
        let signed = sign_at(
            &params(&[("wts", "1"), ("foo", "114"), ("w_rid", "old")]),
            &keys,
            1702204169,
        );
        assert_eq!(signed.len(), 3);
        assert_eq!(value(&signed, "wts"), "1702204169");
    }

    #[test]
    fn sign_fetches_keys_once_and_is_stable_within_a_second() {
        let fetcher = Arc::new(StubFetcher::new().route("/x/web-interface/nav", 200, NAV_BODY));
        let signer = Signer::new(fetcher.clone(), "https://api.test", DEFAULT_KEY_TTL);
        let input = params(&[("cid", "777"), ("qn", "4")]);

        // Retry across a second boundary instead of sleeping.
        let (first, second) = loop {
            let first = signer.sign(&input).unwrap();
            let second = signer.sign(&input).unwrap();
            if value(&first, "wts") == value(&second, "wts") {
                break (first, second);
            }
        };
        assert_eq!(value(&first, "w_rid"), value(&second, "w_rid"));
        assert_eq!(fetcher.count("/x/web-interface/nav"), 1);

        let calls = fetcher.calls();
        let (_, headers) = &calls[0];
        assert!(headers.iter().any(|(k, v)| k == "Referer" && v == "https://www.bilibili.com"));
    }

    #[test]
    fn stale_keys_are_refreshed() {
        let fetcher = Arc::new(StubFetcher::new().route("/x/web-interface/nav", 200, NAV_BODY));
        let signer = Signer::new(fetcher.clone(), "https://api.test", DEFAULT_KEY_TTL);
        signer.seed(WbiKeyPair {
            img_key: "old".into(),
            sub_key: "keys".into(),
            fetched_at: Utc::now() - chrono::Duration::minutes(11),
        });

        let keys = signer.keys().unwrap();
        assert_eq!(keys.img_key, IMG_KEY);
        assert_eq!(keys.sub_key, SUB_KEY);
        assert_eq!(fetcher.count("/x/web-interface/nav"), 1);
    }

    #[test]
    fn seeded_keys_skip_the_network() {
        let fetcher = Arc::new(StubFetcher::new());
        let signer = Signer::new(fetcher.clone(), "https://api.test", DEFAULT_KEY_TTL);
        signer.seed(WbiKeyPair::new(IMG_KEY, SUB_KEY));
        assert!(signer.sign(&params(&[("a", "b")])).is_ok());
        assert!(fetcher.calls().is_empty());
    }

    #[test]
    fn missing_keys_are_a_hard_error() {
        let fetcher = Arc::new(StubFetcher::new().route(
            "/x/web-interface/nav",
            200,
            r#"{"data":{"wbi_img":{"img_url":"https://i0.hdslb.com/bfs/wbi/","sub_url":""}}}"#,
        ));
        let signer = Signer::new(fetcher, "https://api.test", DEFAULT_KEY_TTL);
        assert!(matches!(
            signer.sign(&params(&[("a", "b")])),
            Err(ShimError::MissingSigningKeys)
        ));
    }

    #[test]
    fn transport_failure_surfaces_as_key_fetch_error() {
        let signer = Signer::new(Arc::new(StubFetcher::new()), "https://api.test", DEFAULT_KEY_TTL);
        assert!(matches!(signer.keys(), Err(ShimError::KeyFetch(_))));
    }

    #[test]
    fn filename_stem_drops_path_and_extension() {
        assert_eq!(filename_stem("https://a/b/c/key.png"), "key");
        assert_eq!(filename_stem("key.tar.gz"), "key");
        assert_eq!(filename_stem(""), "");
    }
}
