//! cid → video identity resolution.
//!
//! Two tiers back every lookup: bounded in-memory LRU caches and the persisted
//! key/value state. When both miss, [`IdentityCache::rebuild`] refetches the
//! page list of the most recently known video and repopulates them.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec;
use crate::fetcher::{DESKTOP_USER_AGENT, Fetch};
use crate::query::{self, percent_encode};
use crate::store::PersistedState;

pub const DEFAULT_CACHE_CAPACITY: usize = 500;

/// aid used by legacy clients when the real id overflowed a 32-bit field.
const PLACEHOLDER_AID: &str = "2147483647";

/// Numeric aid and/or public bvid of one video. At least one is populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoIdentity {
    aid: Option<String>,
    bvid: Option<String>,
}

impl VideoIdentity {
    /// Returns `None` when both parts are blank.
    pub fn new(aid: Option<String>, bvid: Option<String>) -> Option<Self> {
        let aid = aid.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        let bvid = bvid.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        if aid.is_none() && bvid.is_none() {
            return None;
        }
        Some(Self { aid, bvid })
    }

    pub fn from_aid(aid: &str) -> Option<Self> {
        Self::new(Some(aid.to_owned()), None)
    }

    pub fn from_bvid(bvid: &str) -> Option<Self> {
        Self::new(None, Some(bvid.to_owned()))
    }

    pub fn aid(&self) -> Option<&str> {
        self.aid.as_deref()
    }

    pub fn bvid(&self) -> Option<&str> {
        self.bvid.as_deref()
    }

    /// The known bvid, or one derived from the aid.
    pub fn public_id(&self) -> Option<String> {
        self.bvid
            .clone()
            .or_else(|| self.aid.as_deref().and_then(codec::encode_str))
    }
}

/// Thread-safe string-keyed LRU with access-order eviction.
pub struct BoundedCache<V> {
    inner: Mutex<LruCache<String, V>>,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Reads and promotes `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Inserts `key`, returning the key evicted to make room, if any.
    pub fn insert(&self, key: &str, value: V) -> Option<String> {
        let mut guard = self.inner.lock();
        match guard.push(key.to_owned(), value) {
            Some((evicted, _)) if evicted != key => Some(evicted),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    LastObserved,
    PersistedCid,
    PersistedLast,
}

impl Tier {
    /// Exact tiers are keyed by the cid itself; the others are the coarse
    /// "currently viewed video" guess.
    pub fn is_exact(self) -> bool {
        matches!(self, Tier::Memory | Tier::PersistedCid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub identity: VideoIdentity,
    pub tier: Tier,
}

/// Result of a successful [`IdentityCache::rebuild`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebuilt {
    /// cid to request upstream; differs from the requested one when an
    /// override was recorded.
    pub cid: String,
    pub identity: VideoIdentity,
}

#[derive(Deserialize)]
struct PageListResponse {
    #[serde(default)]
    data: Option<Vec<Value>>,
}

pub struct IdentityCache {
    by_cid: BoundedCache<VideoIdentity>,
    overrides: BoundedCache<String>,
    last_observed: RwLock<Option<VideoIdentity>>,
    persisted: PersistedState,
    fetcher: Arc<dyn Fetch>,
    api_base: String,
}

impl IdentityCache {
    pub fn new(
        capacity: usize,
        persisted: PersistedState,
        fetcher: Arc<dyn Fetch>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            by_cid: BoundedCache::new(capacity),
            overrides: BoundedCache::new(capacity),
            last_observed: RwLock::new(None),
            persisted,
            fetcher,
            api_base: api_base.into(),
        }
    }

    /// Resolves `cid`, first hit wins: in-memory mapping, most recently
    /// observed identity, persisted mapping, persisted last-viewed identity.
    ///
    /// The second tier ignores the cid entirely and may attribute a stream to
    /// the wrong video when several are browsed at once. Callers that need a
    /// cid-keyed answer check [`Tier::is_exact`].
    pub fn lookup(&self, cid: &str) -> Option<Lookup> {
        if cid.trim().is_empty() {
            return None;
        }
        let hit = |identity, tier| Some(Lookup { identity, tier });

        if let Some(identity) = self.by_cid.get(cid) {
            return hit(identity, Tier::Memory);
        }
        if let Some(identity) = self.last_observed.read().clone() {
            return hit(identity, Tier::LastObserved);
        }
        if let Some(identity) = self.persisted.cid_mapping(cid) {
            debug!(cid, "resolved via persisted mapping");
            return hit(identity, Tier::PersistedCid);
        }
        self.persisted
            .last_identity()
            .and_then(|identity| hit(identity, Tier::PersistedLast))
    }

    /// cid-keyed tiers only.
    pub fn lookup_exact(&self, cid: &str) -> Option<VideoIdentity> {
        if cid.trim().is_empty() {
            return None;
        }
        self.by_cid
            .get(cid)
            .or_else(|| self.persisted.cid_mapping(cid))
    }

    /// Records `cid → identity` in memory and in the persisted state.
    pub fn ingest(&self, cid: &str, identity: &VideoIdentity) {
        if cid.trim().is_empty() {
            return;
        }
        if let Some(evicted) = self.by_cid.insert(cid, identity.clone()) {
            debug!(evicted = %evicted, "identity cache full, evicted least recently used");
        }
        self.persisted.put_cid_mapping(cid, identity);
    }

    /// Records every cid of one video, persisting them in one transaction.
    pub fn ingest_all(&self, cids: &[String], identity: &VideoIdentity) {
        let cids: Vec<String> = cids
            .iter()
            .filter(|cid| !cid.trim().is_empty())
            .cloned()
            .collect();
        for cid in &cids {
            if let Some(evicted) = self.by_cid.insert(cid, identity.clone()) {
                debug!(evicted = %evicted, "identity cache full, evicted least recently used");
            }
        }
        self.persisted.put_cid_mappings(&cids, identity);
    }

    /// Replaces the "most recently observed" identity.
    pub fn observe(&self, identity: &VideoIdentity) {
        *self.last_observed.write() = Some(identity.clone());
        self.persisted.put_last_identity(identity);
    }

    pub fn last_observed(&self) -> Option<VideoIdentity> {
        self.last_observed.read().clone()
    }

    /// Persisted last-viewed identity.
    pub fn persisted_identity(&self) -> Option<VideoIdentity> {
        self.persisted.last_identity()
    }

    /// In-memory slot first, then the persisted one.
    pub fn most_recent(&self) -> Option<VideoIdentity> {
        self.last_observed().or_else(|| self.persisted_identity())
    }

    pub fn resolve_cid_override(&self, cid: &str) -> Option<String> {
        if cid.trim().is_empty() {
            return None;
        }
        self.overrides
            .get(cid)
            .or_else(|| self.persisted.cid_override(cid))
    }

    pub fn record_cid_override(&self, legacy_cid: &str, real_cid: &str) {
        if legacy_cid.trim().is_empty() || real_cid.trim().is_empty() {
            return;
        }
        self.overrides.insert(legacy_cid, real_cid.to_owned());
        self.persisted.put_cid_override(legacy_cid, real_cid);
    }

    /// Refetches the page list of `known` (by bvid, derived from the aid when
    /// needed) and ingests every cid it returns.
    ///
    /// Returns the identity for `requested_cid` when the refetch produced an
    /// exact mapping. Otherwise, if the page list was non-empty, its first cid
    /// is recorded as the override for `requested_cid` and returned instead.
    pub fn rebuild(
        &self,
        requested_cid: &str,
        known: &VideoIdentity,
        headers: &[(String, String)],
    ) -> Option<Rebuilt> {
        let Some(bvid) = known.public_id() else {
            warn!(cid = requested_cid, "known identity has no usable public id");
            return None;
        };
        let page_cids = self.fetch_page_list(&bvid, known.aid(), headers);

        if let Some(identity) = self.lookup_exact(requested_cid) {
            info!(
                cid = requested_cid,
                aid = identity.aid().unwrap_or("<none>"),
                bvid = identity.bvid().unwrap_or("<none>"),
                "cid mapping rebuilt"
            );
            return Some(Rebuilt {
                cid: requested_cid.to_owned(),
                identity,
            });
        }

        let Some(first) = page_cids.first() else {
            warn!(cid = requested_cid, "no mapping after rebuild");
            return None;
        };
        self.record_cid_override(requested_cid, first);
        info!(
            legacy_cid = requested_cid,
            real_cid = %first,
            bvid = %bvid,
            "recorded cid override from page list"
        );
        let identity = VideoIdentity::new(known.aid().map(str::to_owned), Some(bvid))?;
        Some(Rebuilt {
            cid: first.clone(),
            identity,
        })
    }

    /// Fetches `/x/player/pagelist` and ingests its cids; returns them in order.
    fn fetch_page_list(
        &self,
        bvid: &str,
        aid: Option<&str>,
        headers: &[(String, String)],
    ) -> Vec<String> {
        let url = format!(
            "{}/x/player/pagelist?bvid={}",
            self.api_base,
            percent_encode(bvid)
        );
        let headers = with_desktop_agent(headers);
        debug!(url = %url, "fetching page list");

        let response = match self.fetcher.get(&url, &headers) {
            Ok(response) if response.is_success() && !response.body.trim().is_empty() => response,
            Ok(response) => {
                warn!(status = response.status, url = %url, "page list request failed");
                return Vec::new();
            }
            Err(err) => {
                warn!(url = %url, error = %format!("{err:#}"), "page list request failed");
                return Vec::new();
            }
        };

        let pages = match serde_json::from_str::<PageListResponse>(&response.body) {
            Ok(parsed) => parsed.data.unwrap_or_default(),
            Err(err) => {
                warn!(url = %url, error = %err, "page list response is not JSON");
                return Vec::new();
            }
        };

        let Some(identity) = VideoIdentity::new(aid.map(str::to_owned), Some(bvid.to_owned()))
        else {
            return Vec::new();
        };
        let cids: Vec<String> = pages
            .iter()
            .filter_map(|page| positive_id(page.get("cid")))
            .collect();
        self.ingest_all(&cids, &identity);
        debug!(bvid, items = cids.len(), "page list ingested");
        cids
    }

    /// Records the aid/bvid of an observed video-metadata request.
    pub fn ingest_view_request(&self, url: &str) {
        if !is_view_url(url) {
            return;
        }
        let pairs = query::query_pairs(url);
        let aid = query::param(&pairs, "aid");
        let bvid = query::param(&pairs, "bvid");
        if bvid.is_none() && aid == Some(PLACEHOLDER_AID) {
            debug!(url, "ignoring placeholder aid");
            return;
        }
        let Some(identity) = VideoIdentity::new(aid.map(str::to_owned), bvid.map(str::to_owned))
        else {
            debug!(url, "view request carries no aid/bvid");
            return;
        };
        self.observe(&identity);
    }

    /// Ingests every cid of an observed video-metadata response.
    pub fn ingest_view_response(&self, url: &str, body: &str) {
        if !is_view_url(url) {
            return;
        }
        let root: Value = match serde_json::from_str(body) {
            Ok(root) => root,
            Err(err) => {
                warn!(url, error = %err, "view response is not JSON");
                return;
            }
        };
        let Some(data) = root.get("data").filter(|data| data.is_object()) else {
            return;
        };

        let aid = positive_id(data.get("aid"));
        let bvid = data
            .get("bvid")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let Some(identity) = VideoIdentity::new(aid, bvid) else {
            return;
        };

        let mut cids: Vec<String> = data
            .get("pages")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|page| positive_id(page.get("cid")))
                    .collect()
            })
            .unwrap_or_default();
        let pages = cids.len();
        if let Some(main_cid) = positive_id(data.get("cid"))
            && !cids.contains(&main_cid)
        {
            cids.push(main_cid);
        }
        self.ingest_all(&cids, &identity);
        self.observe(&identity);
        debug!(
            aid = identity.aid().unwrap_or("<none>"),
            bvid = identity.bvid().unwrap_or("<none>"),
            pages,
            "ingested view response"
        );
    }

    /// Clients with 32-bit aid fields report the real aid out of band.
    pub fn ingest_oversized_aid(&self, aid: &str) {
        if let Some(identity) = VideoIdentity::from_aid(aid) {
            self.observe(&identity);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.by_cid.len()
    }
}

fn is_view_url(url: &str) -> bool {
    url.to_ascii_lowercase().contains("/x/v2/view")
}

/// Positive integer id from a JSON number or numeric string.
fn positive_id(value: Option<&Value>) -> Option<String> {
    let id = match value? {
        Value::Number(number) => number.as_i64()?,
        Value::String(text) => text.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (id > 0).then(|| id.to_string())
}

/// The caller's headers with the User-Agent replaced by a desktop one; the
/// page list endpoint rejects some mobile agents.
fn with_desktop_agent(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("User-Agent"))
        .cloned()
        .collect();
    out.push(("User-Agent".to_owned(), DESKTOP_USER_AGENT.to_owned()));
    out
}
