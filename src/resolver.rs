//! Legacy playurl resolution.
//!
//! [`Resolver`] is the surface the instrumentation layer talks to. Each
//! intercepted request gets a session; the first body read resolves the
//! legacy `cid`/`qn` pair into a signed modern playurl request and reshapes
//! the answer into the legacy body, which later reads replay unchanged.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ShimConfig;
use crate::error::ShimError;
use crate::fetcher::{Fetch, Headers, UreqFetcher, header_value};
use crate::identity::{IdentityCache, VideoIdentity};
use crate::legacy::{self, DEFAULT_QUALITY};
use crate::media::{MediaDescriptor, extract_media};
use crate::query::{param, query_pairs, to_query_string};
use crate::session::SessionRegistry;
use crate::signer::{Params, Signer};
use crate::store::{PersistedState, SqliteStore};

const LEGACY_PREFIXES: [&str; 2] = [
    "https://interface.bilibili.com/playurl?",
    "https://app.bilibili.com/playurl?",
];
const FALLBACK_USER_AGENT: &str = "Mozilla/5.0";
const PLAYURL_REFERER: &str = "https://www.bilibili.com/";

/// Whether `url` is one of the deprecated playurl endpoints.
pub fn is_legacy_playurl_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    LEGACY_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Reasons a resolution ends in the "not found" body.
#[derive(Debug, Error)]
enum Unavailable {
    #[error("legacy request carries no cid")]
    MissingCid,
    #[error("no identity known for cid {0}")]
    UnknownIdentity(String),
    #[error("signing failed: {0}")]
    Signing(#[from] ShimError),
    #[error("playurl request failed: {0:#}")]
    Fetch(anyhow::Error),
    #[error("upstream response carries no playable stream")]
    NoStream,
}

struct LegacyRequest {
    cid: Option<String>,
    qn: i32,
}

impl LegacyRequest {
    fn parse(url: &str) -> Self {
        let pairs = query_pairs(url);
        let qn = param(&pairs, "qn")
            .or_else(|| param(&pairs, "quality"))
            .and_then(|raw| raw.parse::<i32>().ok())
            .filter(|qn| *qn > 0)
            .unwrap_or(DEFAULT_QUALITY);
        Self {
            cid: param(&pairs, "cid").map(str::to_owned),
            qn,
        }
    }
}

pub struct Resolver {
    identities: IdentityCache,
    signer: Signer,
    fetcher: Arc<dyn Fetch>,
    sessions: SessionRegistry,
    last_playable_url: RwLock<Option<String>>,
    playurl_endpoint: String,
}

impl Resolver {
    pub fn new(fetcher: Arc<dyn Fetch>, persisted: PersistedState, config: &ShimConfig) -> Self {
        let api_base = config.api_base.trim_end_matches('/');
        Self {
            identities: IdentityCache::new(
                config.cache_capacity,
                persisted,
                Arc::clone(&fetcher),
                api_base,
            ),
            signer: Signer::new(Arc::clone(&fetcher), api_base, config.key_ttl),
            fetcher,
            sessions: SessionRegistry::with_capacity(config.cache_capacity),
            last_playable_url: RwLock::new(None),
            playurl_endpoint: format!("{api_base}/x/player/wbi/playurl"),
        }
    }

    /// Real HTTP client plus the configured state file. A state file that
    /// cannot be opened leaves the resolver on in-memory state.
    pub fn from_config(config: &ShimConfig) -> Self {
        let fetcher: Arc<dyn Fetch> = Arc::new(UreqFetcher::new(
            config.connect_timeout,
            config.read_timeout,
        ));
        let persisted = match &config.state_db {
            Some(path) => match SqliteStore::open(path) {
                Ok(store) => {
                    info!(path = %path.display(), "using persisted state");
                    PersistedState::new(store)
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "state file unavailable, keeping state in memory"
                    );
                    PersistedState::in_memory()
                }
            },
            None => PersistedState::in_memory(),
        };
        Self::new(fetcher, persisted, config)
    }

    pub fn identities(&self) -> &IdentityCache {
        &self.identities
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Announces an intercepted legacy request. Returns `false` when `key`
    /// already tracks the same URL.
    ///
    /// Sessions live until [`Resolver::end_session`]; callers that never end
    /// them are bounded by the cache capacity, least recently used first.
    pub fn mark_intercept(&self, key: &str, legacy_url: &str) -> bool {
        let fresh = self.sessions.mark(key, legacy_url);
        if fresh {
            debug!(key, url = legacy_url, "legacy playurl intercepted");
        }
        fresh
    }

    pub fn should_intercept(&self, key: &str) -> bool {
        self.sessions.contains(key)
    }

    /// Accumulates a request header for `key`. Unknown keys and headers that
    /// arrive after resolution started are dropped.
    pub fn on_request_header(&self, key: &str, name: &str, value: &str) {
        if let Some(session) = self.sessions.get(key) {
            session.lock().add_header(name, value);
        }
    }

    pub fn end_session(&self, key: &str) -> bool {
        self.sessions.end(key)
    }

    /// The legacy body for `key`, resolved on the first call and replayed
    /// afterwards. Unknown keys get an empty body.
    pub fn build_response_bytes(&self, key: &str) -> Vec<u8> {
        let Some(session) = self.sessions.get(key) else {
            debug!(key, "body requested for unknown session");
            return Vec::new();
        };
        let mut session = session.lock();
        if let Some(bytes) = session.memoized() {
            return bytes.to_vec();
        }
        session.begin_resolving();
        let bytes = self.resolve(session.legacy_url(), session.headers());
        session.finish(bytes.clone());
        bytes
    }

    /// Playable URL of the latest successful resolution.
    pub fn last_playable_url(&self) -> Option<String> {
        self.last_playable_url.read().clone()
    }

    pub fn ingest_view_request(&self, url: &str) {
        self.identities.ingest_view_request(url);
    }

    pub fn ingest_view_response(&self, url: &str, body: &str) {
        self.identities.ingest_view_response(url, body);
    }

    pub fn ingest_oversized_aid(&self, aid: &str) {
        self.identities.ingest_oversized_aid(aid);
    }

    pub fn persisted_identity(&self) -> Option<VideoIdentity> {
        self.identities.persisted_identity()
    }

    pub fn resolve_cid_override(&self, cid: &str) -> Option<String> {
        self.identities.resolve_cid_override(cid)
    }

    pub fn sign(&self, params: &[(String, String)]) -> crate::error::Result<Params> {
        self.signer.sign(params)
    }

    fn resolve(&self, legacy_url: &str, headers: &[(String, String)]) -> Vec<u8> {
        let request = LegacyRequest::parse(legacy_url);
        match self.try_resolve(&request, headers) {
            Ok(media) => {
                info!(url = %media.url, qn = request.qn, "legacy playurl resolved");
                *self.last_playable_url.write() = Some(media.url.clone());
                legacy::build(Some(&media), request.qn)
            }
            Err(reason) => {
                warn!(url = legacy_url, reason = %reason, "legacy playurl unavailable");
                legacy::build(None, request.qn)
            }
        }
    }

    fn try_resolve(
        &self,
        request: &LegacyRequest,
        headers: &[(String, String)],
    ) -> Result<MediaDescriptor, Unavailable> {
        let legacy_cid = request.cid.as_deref().ok_or(Unavailable::MissingCid)?;
        let headers = passthrough_headers(headers);
        let (cid, identity) = self
            .resolve_target(legacy_cid, &headers)
            .ok_or_else(|| Unavailable::UnknownIdentity(legacy_cid.to_owned()))?;

        let url = self.playurl_url(&cid, &identity, request.qn)?;
        debug!(cid = %cid, "requesting modern playurl");
        let response = self
            .fetcher
            .get(&url, &headers)
            .map_err(Unavailable::Fetch)?;
        if !response.is_success() {
            let err = ShimError::Upstream {
                status: response.status,
                url: self.playurl_endpoint.clone(),
            };
            warn!(error = %err, "parsing error body anyway");
        }
        extract_media(&response.body).ok_or(Unavailable::NoStream)
    }

    /// The cid to request and the identity to pair it with.
    ///
    /// A recorded override replaces the legacy cid first. cid-keyed mappings
    /// win; otherwise the most recently known video seeds a page list
    /// rebuild. That video is never paired with the cid on its own: a failed
    /// rebuild leaves the cid unresolved.
    fn resolve_target(
        &self,
        legacy_cid: &str,
        headers: &[(String, String)],
    ) -> Option<(String, VideoIdentity)> {
        let cid = match self.identities.resolve_cid_override(legacy_cid) {
            Some(real) if real != legacy_cid => {
                debug!(legacy_cid, real_cid = %real, "applying cid override");
                real
            }
            _ => legacy_cid.to_owned(),
        };

        if let Some(identity) = self.identities.lookup_exact(&cid) {
            return Some((cid, identity));
        }
        let coarse = self.identities.lookup(&cid)?;
        debug!(cid = %cid, tier = ?coarse.tier, "no exact mapping, rebuilding");
        let rebuilt = self.identities.rebuild(&cid, &coarse.identity, headers)?;
        Some((rebuilt.cid, rebuilt.identity))
    }

    fn playurl_url(
        &self,
        cid: &str,
        identity: &VideoIdentity,
        qn: i32,
    ) -> Result<String, ShimError> {
        let mut params: Params = [
            ("cid", cid),
            ("fnval", "0"),
            ("fnver", "0"),
            ("fourk", "0"),
            ("otype", "json"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        match (identity.public_id(), identity.aid()) {
            (Some(bvid), _) => params.push(("bvid".to_owned(), bvid)),
            (None, Some(aid)) => params.push(("avid".to_owned(), aid.to_owned())),
            (None, None) => {}
        }
        params.push(("qn".to_owned(), qn.to_string()));

        let signed = self.signer.sign(&params)?;
        Ok(format!(
            "{}?{}",
            self.playurl_endpoint,
            to_query_string(&signed)
        ))
    }
}

/// Only `User-Agent` and `Cookie` survive from the legacy request; the
/// referer is fixed.
fn passthrough_headers(headers: &[(String, String)]) -> Headers {
    let user_agent = header_value(headers, "User-Agent")
        .filter(|ua| !ua.trim().is_empty())
        .unwrap_or(FALLBACK_USER_AGENT);
    let mut out = vec![
        ("User-Agent".to_owned(), user_agent.to_owned()),
        ("Referer".to_owned(), PLAYURL_REFERER.to_owned()),
    ];
    if let Some(cookie) = header_value(headers, "Cookie").filter(|c| !c.trim().is_empty()) {
        out.push(("Cookie".to_owned(), cookie.to_owned()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::StubFetcher;
    use crate::signer::WbiKeyPair;
    use serde_json::Value;

    const TEST_API: &str = "https://api.test";
    const PLAYURL: &str = "/x/player/wbi/playurl";
    const PAGELIST: &str = "/x/player/pagelist";
    const DURL_BODY: &str =
        r#"{"code":0,"data":{"durl":[{"url":"http://cdn/x.mp4","length":10,"size":20}]}}"#;

    fn identity(aid: &str, bvid: &str) -> VideoIdentity {
        VideoIdentity::new(Some(aid.into()), Some(bvid.into())).unwrap()
    }

    fn resolver_with(fetcher: StubFetcher) -> (Resolver, Arc<StubFetcher>) {
        let fetcher = Arc::new(fetcher);
        let config = ShimConfig {
            api_base: TEST_API.into(),
            ..ShimConfig::default()
        };
        let resolver = Resolver::new(fetcher.clone(), PersistedState::in_memory(), &config);
        resolver.signer().seed(WbiKeyPair::new(
            "7cd084941338484aae1ad9425b84077c",
            "4932caff0ff746eab6f01bf08b70ac45",
        ));
        (resolver, fetcher)
    }

    fn parse(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn resolves_seeded_cid_into_legacy_body() {
        let (resolver, fetcher) = resolver_with(StubFetcher::new().route(PLAYURL, 200, DURL_BODY));
        resolver
            .identities()
            .ingest("777", &identity("170001", "BV17x411w7KC"));

        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=777&qn=4");
        let body = parse(&resolver.build_response_bytes("s1"));

        assert_eq!(body["data"]["durl"][0]["url"], "http://cdn/x.mp4");
        assert_eq!(body["data"]["quality"], 4);
        assert_eq!(body["durl"][0]["length"], 10);
        assert_eq!(body["code"], 0);
        assert_eq!(
            resolver.last_playable_url().as_deref(),
            Some("http://cdn/x.mp4")
        );

        let calls = fetcher.calls();
        let (url, _) = &calls[0];
        assert!(url.starts_with("https://api.test/x/player/wbi/playurl?cid=777&fnval=0"));
        assert!(url.contains("&bvid=BV17x411w7KC&qn=4&wts="));
        assert!(url.contains("&w_rid="));
    }

    #[test]
    fn repeated_reads_replay_memoized_bytes() {
        let (resolver, fetcher) = resolver_with(StubFetcher::new().route(PLAYURL, 200, DURL_BODY));
        resolver
            .identities()
            .ingest("777", &identity("170001", "BV17x411w7KC"));
        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=777&qn=4");

        let first = resolver.build_response_bytes("s1");
        let second = resolver.build_response_bytes("s1");
        assert_eq!(first, second);
        assert_eq!(fetcher.count(PLAYURL), 1);
    }

    #[test]
    fn missing_cid_makes_no_network_call() {
        let (resolver, fetcher) = resolver_with(StubFetcher::new());
        resolver.mark_intercept("s1", "https://interface.bilibili.com/playurl?qn=4");
        let body = parse(&resolver.build_response_bytes("s1"));
        assert_eq!(body["code"], -404);
        assert_eq!(body["quality"], 4);
        assert!(fetcher.calls().is_empty());
    }

    #[test]
    fn unknown_identity_is_unavailable() {
        let (resolver, fetcher) = resolver_with(StubFetcher::new());
        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=5&quality=0");
        let body = parse(&resolver.build_response_bytes("s1"));
        assert_eq!(body["code"], -404);
        assert_eq!(body["data"]["quality"], DEFAULT_QUALITY);
        assert!(fetcher.calls().is_empty());
    }

    #[test]
    fn stale_cid_is_rebuilt_and_overridden() {
        let (resolver, fetcher) = resolver_with(
            StubFetcher::new()
                .route(PAGELIST, 200, r#"{"code":0,"data":[{"cid":9001},{"cid":9002}]}"#)
                .route(PLAYURL, 200, DURL_BODY),
        );
        resolver
            .identities()
            .observe(&identity("170001", "BV17x411w7KC"));

        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=555");
        let body = parse(&resolver.build_response_bytes("s1"));
        assert_eq!(body["code"], 0);
        assert_eq!(resolver.resolve_cid_override("555").as_deref(), Some("9001"));

        let playurl_calls: Vec<String> = fetcher
            .calls()
            .into_iter()
            .map(|(url, _)| url)
            .filter(|url| url.contains(PLAYURL))
            .collect();
        assert!(playurl_calls[0].contains("cid=9001&"));

        resolver.mark_intercept("s2", "https://app.bilibili.com/playurl?cid=555");
        resolver.build_response_bytes("s2");
        assert_eq!(fetcher.count(PAGELIST), 1);
        assert_eq!(fetcher.count(PLAYURL), 2);
    }

    #[test]
    fn failed_rebuild_is_unavailable() {
        let (resolver, fetcher) = resolver_with(
            StubFetcher::new()
                .route(PAGELIST, 500, "")
                .route(PLAYURL, 200, DURL_BODY),
        );
        resolver.identities().observe(&identity("1", "BV1xx411c7mQ"));
        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=42");
        let body = parse(&resolver.build_response_bytes("s1"));
        assert_eq!(body["code"], -404);
        assert_eq!(body["data"]["code"], -404);
        assert_eq!(fetcher.count(PAGELIST), 1);
        assert_eq!(fetcher.count(PLAYURL), 0);
        assert!(resolver.resolve_cid_override("42").is_none());
        assert!(resolver.last_playable_url().is_none());
    }

    #[test]
    fn empty_page_list_is_unavailable() {
        let (resolver, fetcher) = resolver_with(
            StubFetcher::new()
                .route(PAGELIST, 200, r#"{"code":0,"data":[]}"#)
                .route(PLAYURL, 200, DURL_BODY),
        );
        resolver.identities().observe(&identity("1", "BV1xx411c7mQ"));
        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=42");
        assert_eq!(parse(&resolver.build_response_bytes("s1"))["code"], -404);
        assert_eq!(fetcher.count(PLAYURL), 0);
    }

    #[test]
    fn signing_failure_degrades_to_unavailable() {
        let fetcher = Arc::new(StubFetcher::new().route(
            "/x/web-interface/nav",
            200,
            r#"{"code":-101,"data":{"wbi_img":{"img_url":"","sub_url":""}}}"#,
        ));
        let config = ShimConfig {
            api_base: TEST_API.into(),
            ..ShimConfig::default()
        };
        let resolver = Resolver::new(fetcher.clone(), PersistedState::in_memory(), &config);
        resolver
            .identities()
            .ingest("777", &identity("170001", "BV17x411w7KC"));

        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=777");
        let body = parse(&resolver.build_response_bytes("s1"));
        assert_eq!(body["code"], -404);
        assert_eq!(fetcher.count(PLAYURL), 0);
    }

    #[test]
    fn error_status_body_is_still_parsed() {
        let (resolver, _) = resolver_with(StubFetcher::new().route(PLAYURL, 412, r#"{"code":-412}"#));
        resolver
            .identities()
            .ingest("777", &identity("170001", "BV17x411w7KC"));
        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=777");
        assert_eq!(parse(&resolver.build_response_bytes("s1"))["code"], -404);
        assert!(resolver.last_playable_url().is_none());
    }

    #[test]
    fn only_user_agent_and_cookie_are_forwarded() {
        let (resolver, fetcher) = resolver_with(StubFetcher::new().route(PLAYURL, 200, DURL_BODY));
        resolver
            .identities()
            .ingest("777", &identity("170001", "BV17x411w7KC"));
        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=777");
        resolver.on_request_header("s1", "X-Device", "phone");
        resolver.on_request_header("s1", "cookie", "SESSDATA=abc");
        resolver.on_request_header("s1", "user-agent", "LegacyClient/1.0");
        resolver.build_response_bytes("s1");

        let calls = fetcher.calls();
        let (_, headers) = &calls[0];
        assert_eq!(
            headers,
            &vec![
                ("User-Agent".to_string(), "LegacyClient/1.0".to_string()),
                ("Referer".to_string(), PLAYURL_REFERER.to_string()),
                ("Cookie".to_string(), "SESSDATA=abc".to_string()),
            ]
        );
    }

    #[test]
    fn user_agent_defaults_when_absent() {
        let headers = passthrough_headers(&[]);
        assert_eq!(
            headers,
            vec![
                ("User-Agent".to_string(), FALLBACK_USER_AGENT.to_string()),
                ("Referer".to_string(), PLAYURL_REFERER.to_string()),
            ]
        );
    }

    #[test]
    fn remarking_with_new_url_resolves_again() {
        let (resolver, fetcher) = resolver_with(StubFetcher::new().route(PLAYURL, 200, DURL_BODY));
        resolver
            .identities()
            .ingest("777", &identity("170001", "BV17x411w7KC"));
        resolver
            .identities()
            .ingest("778", &identity("170001", "BV17x411w7KC"));

        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=777");
        resolver.build_response_bytes("s1");
        assert!(!resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=777"));
        resolver.build_response_bytes("s1");
        assert!(resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=778"));
        resolver.build_response_bytes("s1");
        assert_eq!(fetcher.count(PLAYURL), 2);
    }

    #[test]
    fn concurrent_sessions_resolve_independently() {
        let (resolver, fetcher) = resolver_with(StubFetcher::new().route(PLAYURL, 200, DURL_BODY));
        for n in 0..16 {
            resolver
                .identities()
                .ingest(&format!("{}", 100 + n), &identity("170001", "BV17x411w7KC"));
        }

        let bodies: Vec<Vec<u8>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|n| {
                    let resolver = &resolver;
                    scope.spawn(move || {
                        let key = format!("s{n}");
                        resolver.mark_intercept(
                            &key,
                            &format!("https://app.bilibili.com/playurl?cid={}", 100 + n),
                        );
                        let first = resolver.build_response_bytes(&key);
                        assert_eq!(first, resolver.build_response_bytes(&key));
                        first
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(bodies.iter().all(|body| parse(body)["code"] == 0));
        assert_eq!(fetcher.count(PLAYURL), 16);
        for n in 0..16 {
            assert_eq!(fetcher.count(&format!("cid={}&", 100 + n)), 1);
        }
    }

    #[test]
    fn session_lifecycle() {
        let (resolver, _) = resolver_with(StubFetcher::new());
        assert!(resolver.build_response_bytes("nobody").is_empty());
        resolver.mark_intercept("s1", "https://app.bilibili.com/playurl?cid=1");
        assert!(resolver.should_intercept("s1"));
        assert!(resolver.end_session("s1"));
        assert!(!resolver.should_intercept("s1"));
    }

    #[test]
    fn legacy_url_detection_ignores_case() {
        assert!(is_legacy_playurl_url("https://app.bilibili.com/playurl?cid=1"));
        assert!(is_legacy_playurl_url("HTTPS://Interface.Bilibili.com/playurl?cid=1"));
        assert!(!is_legacy_playurl_url("https://api.bilibili.com/x/player/wbi/playurl?cid=1"));
        assert!(!is_legacy_playurl_url("https://app.bilibili.com/playurl"));
    }
}
