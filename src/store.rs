//! Persistence layer for identity mappings.
//!
//! Everything the shim remembers across restarts lives in one flat key/value
//! table. Keys follow a fixed layout so an existing state file keeps working
//! between releases:
//!
//! * `last_aid` / `last_bvid`: identity of the most recently viewed video.
//! * `cid2_<cid>`: `"<aid>|<bvid>"` for a stream id, either half may be empty.
//! * `cidOverride_<legacyCid>`: the real cid a stale legacy cid maps to.
//!
//! The persisted tier is a stale-tolerant fallback. [`PersistedState`] never
//! lets a storage failure reach its caller: errors are logged and the read
//! degrades to "not found".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::warn;

use crate::identity::VideoIdentity;

const LAST_AID_KEY: &str = "last_aid";
const LAST_BVID_KEY: &str = "last_bvid";
const CID_MAPPING_PREFIX: &str = "cid2_";
const CID_OVERRIDE_PREFIX: &str = "cidOverride_";

/// Writers give up quickly instead of queueing behind another process.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Flat string key/value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes every pair atomically.
    fn put_all(&self, entries: &[(&str, &str)]) -> Result<()>;

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.put_all(&[(key, value)])
    }
}

/// SQLite-backed store. A short-lived connection is opened per call so slow
/// disks never hold a lock shared with other threads.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (and if necessary creates) the DB and ensures the table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }

        let store = Self { db_path };
        store.with_connection(|conn| {
            conn.pragma_update(None, "journal_mode", &"WAL")
                .context("enabling WAL mode for state DB")?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                "#,
            )
            .context("creating kv table")?;
            Ok(())
        })?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening state DB {}", self.db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        f(&mut conn)
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()
                .with_context(|| format!("reading {key}"))?;
            Ok(value)
        })
    }

    fn put_all(&self, entries: &[(&str, &str)]) -> Result<()> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            for (key, value) in entries {
                tx.execute(
                    r#"
                    INSERT INTO kv (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value
                    "#,
                    params![key, value],
                )
                .with_context(|| format!("writing {key}"))?;
            }
            tx.commit()?;
            Ok(())
        })
    }
}

/// Process-local store, used in tests and when no state file is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put_all(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut guard = self.entries.write();
        for (key, value) in entries {
            guard.insert((*key).to_owned(), (*value).to_owned());
        }
        Ok(())
    }
}

/// Typed, failure-swallowing view over a [`KvStore`] using the persisted key
/// layout.
pub struct PersistedState {
    store: Box<dyn KvStore>,
}

impl PersistedState {
    pub fn new(store: impl KvStore + 'static) -> Self {
        Self {
            store: Box::new(store),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    pub fn last_identity(&self) -> Option<VideoIdentity> {
        let aid = self.read(LAST_AID_KEY);
        let bvid = self.read(LAST_BVID_KEY);
        VideoIdentity::new(aid, bvid)
    }

    pub fn put_last_identity(&self, identity: &VideoIdentity) {
        let aid = identity.aid().unwrap_or_default();
        let bvid = identity.bvid().unwrap_or_default();
        self.write(&[(LAST_AID_KEY, aid), (LAST_BVID_KEY, bvid)]);
    }

    pub fn cid_mapping(&self, cid: &str) -> Option<VideoIdentity> {
        if cid.trim().is_empty() {
            return None;
        }
        let raw = self.read(&format!("{CID_MAPPING_PREFIX}{cid}"))?;
        let (aid, bvid) = raw.split_once('|').unwrap_or((raw.as_str(), ""));
        VideoIdentity::new(Some(aid.to_owned()), Some(bvid.to_owned()))
    }

    pub fn put_cid_mapping(&self, cid: &str, identity: &VideoIdentity) {
        if cid.trim().is_empty() {
            return;
        }
        let value = format!(
            "{}|{}",
            identity.aid().unwrap_or_default(),
            identity.bvid().unwrap_or_default()
        );
        let key = format!("{CID_MAPPING_PREFIX}{cid}");
        self.write(&[(key.as_str(), value.as_str())]);
    }

    /// Maps every cid to `identity` in a single write.
    pub fn put_cid_mappings(&self, cids: &[String], identity: &VideoIdentity) {
        let value = format!(
            "{}|{}",
            identity.aid().unwrap_or_default(),
            identity.bvid().unwrap_or_default()
        );
        let keys: Vec<String> = cids
            .iter()
            .filter(|cid| !cid.trim().is_empty())
            .map(|cid| format!("{CID_MAPPING_PREFIX}{cid}"))
            .collect();
        if keys.is_empty() {
            return;
        }
        let entries: Vec<(&str, &str)> = keys
            .iter()
            .map(|key| (key.as_str(), value.as_str()))
            .collect();
        self.write(&entries);
    }

    pub fn cid_override(&self, legacy_cid: &str) -> Option<String> {
        if legacy_cid.trim().is_empty() {
            return None;
        }
        self.read(&format!("{CID_OVERRIDE_PREFIX}{legacy_cid}"))
    }

    pub fn put_cid_override(&self, legacy_cid: &str, real_cid: &str) {
        if legacy_cid.trim().is_empty() || real_cid.trim().is_empty() {
            return;
        }
        let key = format!("{CID_OVERRIDE_PREFIX}{legacy_cid}");
        self.write(&[(key.as_str(), real_cid)]);
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(err) => {
                warn!(key, error = %format!("{err:#}"), "persisted read failed");
                None
            }
        }
    }

    fn write(&self, entries: &[(&str, &str)]) {
        if let Err(err) = self.store.put_all(entries) {
            warn!(
                keys = entries.len(),
                error = %format!("{err:#}"),
                "persisted write failed"
            );
        }
    }
}
