//! Per-request intercept sessions.
//!
//! The instrumentation layer announces each legacy request under a key of its
//! choosing, streams the request headers in, then reads the body (possibly
//! more than once). A session resolves on the first read and replays the same
//! bytes afterwards.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

pub const DEFAULT_SESSION_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    New,
    HeadersCollected,
    Resolving,
    Done(Vec<u8>),
}

#[derive(Debug)]
pub struct InterceptSession {
    legacy_url: String,
    headers: Vec<(String, String)>,
    state: SessionState,
}

impl InterceptSession {
    pub fn new(legacy_url: impl Into<String>) -> Self {
        Self {
            legacy_url: legacy_url.into(),
            headers: Vec::new(),
            state: SessionState::New,
        }
    }

    pub fn legacy_url(&self) -> &str {
        &self.legacy_url
    }

    /// Headers in first-insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Records a header; a repeated name keeps its position and takes the new
    /// value. Ignored once resolution has started.
    pub fn add_header(&mut self, name: &str, value: &str) -> bool {
        if !matches!(
            self.state,
            SessionState::New | SessionState::HeadersCollected
        ) {
            return false;
        }
        match self.headers.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value.to_owned(),
            None => self.headers.push((name.to_owned(), value.to_owned())),
        }
        self.state = SessionState::HeadersCollected;
        true
    }

    pub fn memoized(&self) -> Option<&[u8]> {
        match &self.state {
            SessionState::Done(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn begin_resolving(&mut self) {
        self.state = SessionState::Resolving;
    }

    pub fn finish(&mut self, bytes: Vec<u8>) {
        self.state = SessionState::Done(bytes);
    }
}

pub type SharedSession = Arc<Mutex<InterceptSession>>;

struct Entry {
    legacy_url: String,
    session: SharedSession,
}

/// Live sessions by caller-supplied key, bounded with least-recently-used
/// eviction for callers that never end their sessions. The registry lock is
/// never held while a session lock is taken, so a session busy resolving
/// does not stall the others. An evicted session that is mid-resolution
/// still finishes for its current reader.
pub struct SessionRegistry {
    sessions: Mutex<LruCache<String, Entry>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SESSION_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Starts a session for `key`. Re-marking with the same URL keeps the
    /// existing session; a different URL replaces it.
    pub fn mark(&self, key: &str, legacy_url: &str) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(key)
            .is_some_and(|entry| entry.legacy_url == legacy_url)
        {
            return false;
        }
        let entry = Entry {
            legacy_url: legacy_url.to_owned(),
            session: Arc::new(Mutex::new(InterceptSession::new(legacy_url))),
        };
        if let Some((evicted, _)) = sessions.push(key.to_owned(), entry)
            && evicted != key
        {
            debug!(evicted = %evicted, "session registry full, dropped least recently used");
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<SharedSession> {
        self.sessions
            .lock()
            .get(key)
            .map(|entry| Arc::clone(&entry.session))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.lock().contains(key)
    }

    pub fn end(&self, key: &str) -> bool {
        self.sessions.lock().pop(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
