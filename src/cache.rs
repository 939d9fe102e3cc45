//! Content-addressed dataset cache.
//!
//! A dataset's identity is the SHA-256 of its source bytes, so ingesting the same bytes twice is
//! a no-op while the entry is fresh. URL sources get an extra alias record
//! (`aliases/<sha256(url)>.json`) that lets a repeated fetch of the same URL skip the download.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::ingestion::SourceKind;
use crate::storage::{TableMeta, TableStore, read_json, write_json_atomic};
use crate::types::Table;

const ALIAS_DIR: &str = "aliases";

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_identity(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Key of the alias record for `url`.
pub fn url_key(url: &str) -> String {
    content_identity(url.as_bytes())
}

/// Pointer to a persisted dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub identity: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub source_kind: SourceKind,
    pub row_count: usize,
    pub column_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AliasRecord {
    url: String,
    identity: String,
    fetched_at: DateTime<Utc>,
}

/// Cache behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// When `false`, [`ContentStore::exists`] always answers `false` and every ingestion re-parses.
    pub enabled: bool,
    /// Entries older than this count as missing for ingestion purposes.
    pub max_age: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age: None,
        }
    }
}

/// Identity to dataset mapping on top of a [`TableStore`].
#[derive(Debug)]
pub struct ContentStore {
    store: TableStore,
    options: CacheOptions,
    in_flight: Mutex<HashSet<String>>,
    released: Condvar,
}

impl ContentStore {
    pub fn new(store: TableStore, options: CacheOptions) -> Result<Self> {
        std::fs::create_dir_all(store.root().join(ALIAS_DIR))?;
        Ok(Self {
            store,
            options,
            in_flight: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        })
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    /// Whether ingestion may reuse the entry for `identity`.
    ///
    /// Always `false` with the cache disabled, and `false` for entries older than `max_age`.
    pub fn exists(&self, identity: &str) -> bool {
        if !self.options.enabled {
            return false;
        }
        match self.store.age(identity) {
            Ok(Some(age)) => match self.options.max_age {
                Some(max_age) if age > max_age => {
                    tracing::debug!(target: "cache", %identity, ?age, "entry expired");
                    false
                }
                _ => true,
            },
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(target: "cache", %identity, error = %e, "cannot stat entry");
                false
            }
        }
    }

    /// The persisted dataset for `identity`, fresh or not.
    pub fn get(&self, identity: &str) -> Result<DatasetRef> {
        let handle = self.store.read(identity)?;
        self.dataset_ref(handle.meta())
    }

    /// Persist `table` under `meta.identity`, replacing any previous version.
    pub fn put(&self, table: &Table, meta: &TableMeta) -> Result<DatasetRef> {
        self.store.write(table, meta)?;
        tracing::info!(
            target: "cache",
            identity = %meta.identity,
            rows = meta.row_count,
            "dataset stored"
        );
        self.dataset_ref(meta)
    }

    fn dataset_ref(&self, meta: &TableMeta) -> Result<DatasetRef> {
        Ok(DatasetRef {
            identity: meta.identity.clone(),
            path: self.store.data_path(&meta.identity)?,
            created_at: meta.created_at,
            source_kind: meta.source_kind,
            row_count: meta.row_count,
            column_count: meta.schema.len(),
        })
    }

    /// Serialize work on `identity`: blocks while another guard for it is alive.
    ///
    /// Callers should re-check [`Self::exists`] after acquiring.
    pub fn lock(&self, identity: &str) -> InFlightGuard<'_> {
        let mut set = lock_set(&self.in_flight);
        let mut waited = false;
        while set.contains(identity) {
            waited = true;
            set = self
                .released
                .wait(set)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        set.insert(identity.to_string());
        if waited {
            tracing::debug!(target: "cache", %identity, "waited for concurrent ingestion");
        }
        InFlightGuard {
            owner: self,
            identity: identity.to_string(),
        }
    }

    fn unlock(&self, identity: &str) {
        lock_set(&self.in_flight).remove(identity);
        self.released.notify_all();
    }

    fn alias_path(&self, url: &str) -> PathBuf {
        self.store
            .root()
            .join(ALIAS_DIR)
            .join(format!("{}.json", url_key(url)))
    }

    /// Content identity last fetched from `url`, if recorded, fresh, and still persisted.
    pub fn resolve_alias(&self, url: &str) -> Result<Option<String>> {
        if !self.options.enabled {
            return Ok(None);
        }
        let Some(record) = read_json::<AliasRecord>(&self.alias_path(url))? else {
            return Ok(None);
        };
        if record.url != url {
            return Ok(None);
        }
        if let Some(max_age) = self.options.max_age {
            let age = (Utc::now() - record.fetched_at).to_std().unwrap_or_default();
            if age > max_age {
                tracing::debug!(target: "cache", %url, "alias expired");
                return Ok(None);
            }
        }
        if !self.exists(&record.identity) {
            return Ok(None);
        }
        Ok(Some(record.identity))
    }

    /// Remember that `url` currently serves the content `identity`.
    pub fn record_alias(&self, url: &str, identity: &str) -> Result<()> {
        let record = AliasRecord {
            url: url.to_string(),
            identity: identity.to_string(),
            fetched_at: Utc::now(),
        };
        write_json_atomic(&self.store.root().join(ALIAS_DIR), &self.alias_path(url), &record)
    }

    /// Identities of all persisted datasets.
    pub fn list(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    /// Delete entries older than `max_age`. Returns how many were removed.
    ///
    /// Does nothing without a `max_age`. Entries currently being ingested are skipped.
    pub fn purge_expired(&self) -> Result<usize> {
        let Some(max_age) = self.options.max_age else {
            return Ok(0);
        };
        let mut removed = 0;
        for identity in self.store.list()? {
            // Held until the file is gone, so no ingestion of `identity` can start meanwhile.
            let in_flight = lock_set(&self.in_flight);
            if in_flight.contains(&identity) {
                continue;
            }
            match self.store.age(&identity)? {
                Some(age) if age > max_age => {
                    self.store.remove(&identity)?;
                    removed += 1;
                }
                _ => {}
            }
            drop(in_flight);
        }
        if removed > 0 {
            tracing::info!(target: "cache", removed, "purged expired datasets");
        }
        Ok(removed)
    }
}

fn lock_set(m: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held while an identity is being ingested; released on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    owner: &'a ContentStore,
    identity: String,
}

impl InFlightGuard<'_> {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.unlock(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{ColumnType, Field, Schema, Value};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table() -> (Table, TableMeta) {
        let schema = Schema::new(vec![Field::new("n", ColumnType::Number)]);
        let table = Table::new(schema.clone(), vec![vec![Value::Number(1.0)]]);
        let meta = TableMeta {
            identity: content_identity(b"n\n1\n"),
            source_kind: SourceKind::Csv,
            encoding: Some("UTF-8".into()),
            delimiter: Some(','),
            created_at: Utc::now(),
            row_count: 1,
            schema,
        };
        (table, meta)
    }

    #[test]
    fn identity_is_sha256_hex() {
        assert_eq!(
            content_identity(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn disabled_cache_never_exists_but_serves() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::open(dir.path()).unwrap();
        let cache = ContentStore::new(
            store,
            CacheOptions {
                enabled: false,
                max_age: None,
            },
        )
        .unwrap();
        let (t, meta) = table();
        cache.put(&t, &meta).unwrap();
        assert!(!cache.exists(&meta.identity));
        assert_eq!(cache.get(&meta.identity).unwrap().row_count, 1);
    }

    #[test]
    fn stale_entries_do_not_exist_but_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::open(dir.path()).unwrap();
        let cache = ContentStore::new(
            store,
            CacheOptions {
                enabled: true,
                max_age: Some(Duration::ZERO),
            },
        )
        .unwrap();
        let (t, meta) = table();
        cache.put(&t, &meta).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.exists(&meta.identity));
        assert!(cache.get(&meta.identity).is_ok());
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(matches!(cache.get(&meta.identity), Err(Error::NotFound(_))));
    }

    #[test]
    fn purge_leaves_identities_being_ingested() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::open(dir.path()).unwrap();
        let cache = Arc::new(
            ContentStore::new(
                store,
                CacheOptions {
                    enabled: true,
                    max_age: Some(Duration::ZERO),
                },
            )
            .unwrap(),
        );
        let (t, meta) = table();
        cache.put(&t, &meta).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let guard = cache.lock(&meta.identity);
        assert_eq!(cache.purge_expired().unwrap(), 0);
        assert!(cache.get(&meta.identity).is_ok());

        // Same from another thread.
        let purger = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.purge_expired().unwrap())
        };
        assert_eq!(purger.join().unwrap(), 0);
        drop(guard);

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(matches!(cache.get(&meta.identity), Err(Error::NotFound(_))));
    }

    #[test]
    fn aliases_resolve_to_existing_identities() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentStore::new(TableStore::open(dir.path()).unwrap(), CacheOptions::default())
            .unwrap();
        let (t, meta) = table();
        let url = "https://example.com/a.csv";
        assert_eq!(cache.resolve_alias(url).unwrap(), None);

        cache.record_alias(url, &meta.identity).unwrap();
        // Recorded but not persisted yet.
        assert_eq!(cache.resolve_alias(url).unwrap(), None);

        cache.put(&t, &meta).unwrap();
        assert_eq!(cache.resolve_alias(url).unwrap(), Some(meta.identity.clone()));
    }

    #[test]
    fn lock_serializes_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            ContentStore::new(TableStore::open(dir.path()).unwrap(), CacheOptions::default())
                .unwrap(),
        );
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    let _guard = cache.lock("abc");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);

        // Different identities do not block each other.
        let _a = cache.lock("abc");
        let _b = cache.lock("def");
    }
}
