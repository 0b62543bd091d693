//! Embedding cache with durable per-identity records.
//!
//! The in-memory gallery is authoritative for matching. Durable storage is
//! behind [`RecordStore`]; [`SqliteRecordStore`] keeps one row per identity
//! with the vector as little-endian `f32` bytes and the metadata as JSON.

use crate::distance::DistanceMetric;
use crate::types::{Embedding, EmbeddingMetadata, EmbeddingRecord, Gallery};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("malformed record for {identity}: {reason}")]
    Malformed { identity: String, reason: String },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("metadata encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for errors raised by the durable medium rather than by validation.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(_) | StoreError::Json(_) | StoreError::Io(_)
        )
    }
}

/// Result of scanning durable storage: the outer error means the medium
/// itself is unreadable, inner errors are individual bad records.
pub type LoadedRecords = Vec<Result<EmbeddingRecord, StoreError>>;

/// Durable medium for embedding records.
pub trait RecordStore: Send + Sync {
    fn write(&self, record: &EmbeddingRecord) -> Result<(), StoreError>;
    fn read_all(&self) -> Result<LoadedRecords, StoreError>;
    /// Deleting an absent identity is not an error.
    fn delete(&self, identity: &str) -> Result<(), StoreError>;
}

/// SQLite-backed record store.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS embeddings (
                identity TEXT PRIMARY KEY NOT NULL,
                vector   BLOB NOT NULL,
                metadata TEXT
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStore for SqliteRecordStore {
    fn write(&self, record: &EmbeddingRecord) -> Result<(), StoreError> {
        let metadata = record
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m))
            .transpose()?;

        self.conn().execute(
            "INSERT INTO embeddings (identity, vector, metadata) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET vector = excluded.vector, metadata = excluded.metadata",
            params![record.identity, encode_vector(&record.embedding.values), metadata],
        )?;
        Ok(())
    }

    fn read_all(&self) -> Result<LoadedRecords, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT identity, vector, metadata FROM embeddings ORDER BY identity")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (identity, blob, metadata) = row?;
            records.push(decode_record(identity, &blob, metadata.as_deref()));
        }
        Ok(records)
    }

    fn delete(&self, identity: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM embeddings WHERE identity = ?1", params![identity])?;
        Ok(())
    }
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn decode_record(
    identity: String,
    blob: &[u8],
    metadata: Option<&str>,
) -> Result<EmbeddingRecord, StoreError> {
    let values = decode_vector(blob).ok_or_else(|| StoreError::Malformed {
        identity: identity.clone(),
        reason: format!("vector blob of {} bytes is not a whole number of f32", blob.len()),
    })?;

    // Metadata is advisory: unreadable metadata does not drop the embedding.
    let metadata = match metadata.map(|m| serde_json::from_str::<EmbeddingMetadata>(m)) {
        Some(Ok(m)) => Some(m),
        Some(Err(e)) => {
            tracing::warn!(identity = %identity, error = %e, "ignoring unreadable embedding metadata");
            None
        }
        None => None,
    };

    Ok(EmbeddingRecord {
        identity,
        embedding: Embedding::new(values),
        metadata,
    })
}

/// Settings shared by every entry in the cache.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Dimensionality every stored embedding must have.
    pub dimension: usize,
    pub model_name: String,
    pub metric: DistanceMetric,
}

/// Snapshot of cache contents for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub count: usize,
    pub identities: Vec<String>,
    pub model: String,
    pub distance_metric: DistanceMetric,
}

#[derive(Default)]
struct CacheState {
    gallery: Gallery,
    metadata: HashMap<String, EmbeddingMetadata>,
}

/// In-memory embedding cache backed by a [`RecordStore`].
///
/// A single reader-writer lock guards the whole gallery: matching sees a
/// consistent snapshot and upserts never expose a partially written vector.
/// Mutations also take `writer`, held across both the cache change and the
/// durable write, so memory and storage see writers in the same order.
/// Durable I/O never runs under the gallery lock.
pub struct EmbeddingStore {
    records: Box<dyn RecordStore>,
    settings: StoreSettings,
    state: RwLock<CacheState>,
    writer: Mutex<()>,
}

impl EmbeddingStore {
    pub fn new(records: Box<dyn RecordStore>, settings: StoreSettings) -> Self {
        Self {
            records,
            settings,
            state: RwLock::new(CacheState::default()),
            writer: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Populate the cache from durable storage.
    ///
    /// Stored records are merged into the cache, replacing cached entries for
    /// the same identity; identities held only in memory are kept. Individual
    /// malformed records are skipped with a warning. Fails only if the medium
    /// itself cannot be read. Returns the number of entries loaded.
    pub fn load_all(&self) -> Result<usize, StoreError> {
        let _writer = self.lock_writer();
        let records = self.records.read_all()?;

        let mut loaded = CacheState::default();
        for record in records {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed embedding record");
                    continue;
                }
            };
            if record.embedding.dim() != self.settings.dimension {
                tracing::warn!(
                    identity = %record.identity,
                    dim = record.embedding.dim(),
                    expected = self.settings.dimension,
                    "skipping embedding record with wrong dimension"
                );
                continue;
            }
            if let Some(meta) = record.metadata {
                loaded.metadata.insert(record.identity.clone(), meta);
            }
            loaded.gallery.insert(record.identity, record.embedding);
        }

        let count = loaded.gallery.len();
        let mut state = self.write_state();
        state.gallery.extend(loaded.gallery);
        state.metadata.extend(loaded.metadata);

        tracing::info!(count, model = %self.settings.model_name, "preloaded embeddings");
        Ok(count)
    }

    pub fn get(&self, identity: &str) -> Option<Embedding> {
        self.read_state().gallery.get(identity).cloned()
    }

    pub fn metadata(&self, identity: &str) -> Option<EmbeddingMetadata> {
        self.read_state().metadata.get(identity).cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.read_state().gallery.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.read_state().gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace the embedding for `identity`.
    ///
    /// Validation errors leave the cache untouched. When `persist` is set and
    /// the durable write fails, the in-memory entry is kept and the
    /// persistence error is returned.
    pub fn set(
        &self,
        identity: &str,
        embedding: Embedding,
        metadata: EmbeddingMetadata,
        persist: bool,
    ) -> Result<(), StoreError> {
        if identity.trim().is_empty() {
            return Err(StoreError::EmptyIdentity);
        }
        if embedding.dim() != self.settings.dimension {
            tracing::error!(
                identity,
                dim = embedding.dim(),
                expected = self.settings.dimension,
                "rejecting embedding with wrong dimension"
            );
            return Err(StoreError::DimensionMismatch {
                expected: self.settings.dimension,
                actual: embedding.dim(),
            });
        }

        let record = persist.then(|| EmbeddingRecord {
            identity: identity.to_string(),
            embedding: embedding.clone(),
            metadata: Some(metadata.clone()),
        });

        let _writer = self.lock_writer();
        {
            let mut state = self.write_state();
            state.gallery.insert(identity.to_string(), embedding);
            state.metadata.insert(identity.to_string(), metadata);
        }

        if let Some(record) = record {
            if let Err(e) = self.records.write(&record) {
                tracing::error!(identity, error = %e, "embedding cached in memory only");
                return Err(e);
            }
            tracing::debug!(identity, "embedding persisted");
        }
        Ok(())
    }

    /// Remove `identity` from the cache and, with `persist`, from durable
    /// storage. Removing an unknown identity succeeds. Returns whether the
    /// identity was cached.
    pub fn delete(&self, identity: &str, persist: bool) -> Result<bool, StoreError> {
        let _writer = self.lock_writer();
        let existed = {
            let mut state = self.write_state();
            state.metadata.remove(identity);
            state.gallery.remove(identity).is_some()
        };

        if persist {
            self.records.delete(identity)?;
            tracing::info!(identity, existed, "deleted embedding");
        }
        Ok(existed)
    }

    /// Drop one identity (or everything) from memory. Durable records stay.
    pub fn clear(&self, identity: Option<&str>) {
        let _writer = self.lock_writer();
        let mut state = self.write_state();
        match identity {
            Some(id) => {
                if state.gallery.remove(id).is_some() {
                    tracing::info!(identity = id, "cleared cached embedding");
                }
                state.metadata.remove(id);
            }
            None => {
                state.gallery.clear();
                state.metadata.clear();
                tracing::info!("cleared entire embedding cache");
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.read_state();
        StoreStats {
            count: state.gallery.len(),
            identities: state.gallery.keys().cloned().collect(),
            model: self.settings.model_name.clone(),
            distance_metric: self.settings.metric,
        }
    }

    /// Run `f` against a consistent view of the gallery.
    ///
    /// Holds the read lock for the duration of `f`; keep it to pure compute.
    pub fn with_gallery<R>(&self, f: impl FnOnce(&Gallery) -> R) -> R {
        f(&self.read_state().gallery)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const DIM: usize = 4;

    fn settings() -> StoreSettings {
        StoreSettings {
            dimension: DIM,
            model_name: "test-model".into(),
            metric: DistanceMetric::Cosine,
        }
    }

    fn meta() -> EmbeddingMetadata {
        EmbeddingMetadata::new("test-model", Some(0.97)).with_extra("source", "unit-test")
    }

    fn sqlite_store(path: &Path) -> EmbeddingStore {
        EmbeddingStore::new(Box::new(SqliteRecordStore::open(path).unwrap()), settings())
    }

    /// Record store whose writes and deletes always fail.
    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn write(&self, _: &EmbeddingRecord) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
        fn read_all(&self) -> Result<LoadedRecords, StoreError> {
            Err(StoreError::Io(std::io::Error::other("unreadable")))
        }
        fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("read-only")))
        }
    }

    /// SQLite store that stalls writes of vectors starting with 1.0 and every
    /// full scan, widening the window between cache and disk updates.
    struct SlowStore {
        inner: SqliteRecordStore,
        delay: Duration,
    }

    impl SlowStore {
        fn new() -> Self {
            Self {
                inner: SqliteRecordStore::open_in_memory().unwrap(),
                delay: Duration::from_millis(300),
            }
        }
    }

    impl RecordStore for SlowStore {
        fn write(&self, record: &EmbeddingRecord) -> Result<(), StoreError> {
            if record.embedding.values.first() == Some(&1.0) {
                std::thread::sleep(self.delay);
            }
            self.inner.write(record)
        }
        fn read_all(&self) -> Result<LoadedRecords, StoreError> {
            std::thread::sleep(self.delay);
            self.inner.read_all()
        }
        fn delete(&self, identity: &str) -> Result<(), StoreError> {
            self.inner.delete(identity)
        }
    }

    fn stored_values(store: &EmbeddingStore, identity: &str) -> Option<Vec<f32>> {
        store
            .records
            .read_all()
            .unwrap()
            .into_iter()
            .filter_map(Result::ok)
            .find(|r| r.identity == identity)
            .map(|r| r.embedding.values)
    }

    #[test]
    fn test_concurrent_overwrites_keep_cache_and_disk_in_step() {
        let store = Arc::new(EmbeddingStore::new(Box::new(SlowStore::new()), settings()));

        let slow = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store.set("S1", Embedding::new(vec![1.0; DIM]), meta(), true).unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        store.set("S1", Embedding::new(vec![2.0; DIM]), meta(), true).unwrap();
        slow.join().unwrap();

        let cached = store.get("S1").unwrap().values;
        assert_eq!(cached, vec![2.0; DIM]);
        assert_eq!(stored_values(&store, "S1"), Some(cached));
    }

    #[test]
    fn test_delete_racing_set_does_not_resurrect() {
        let store = Arc::new(EmbeddingStore::new(Box::new(SlowStore::new()), settings()));

        let slow = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store.set("S2", Embedding::new(vec![1.0; DIM]), meta(), true).unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(store.delete("S2", true).unwrap());
        slow.join().unwrap();

        assert!(!store.contains("S2"));
        assert_eq!(stored_values(&store, "S2"), None);
    }

    #[test]
    fn test_set_during_load_is_not_overwritten_by_stale_row() {
        let store = Arc::new(EmbeddingStore::new(Box::new(SlowStore::new()), settings()));
        store.set("S1", Embedding::new(vec![1.0; DIM]), meta(), true).unwrap();
        store.clear(None);

        let loader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.load_all().unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        store.set("S1", Embedding::new(vec![2.0; DIM]), meta(), true).unwrap();
        assert_eq!(loader.join().unwrap(), 1);

        assert_eq!(store.get("S1").unwrap().values, vec![2.0; DIM]);
        assert_eq!(stored_values(&store, "S1"), Some(vec![2.0; DIM]));
    }

    #[test]
    fn test_roundtrip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.db");
        let values = vec![0.1f32, -3.4028235e38, f32::MIN_POSITIVE, 1.0 / 3.0];

        sqlite_store(&path)
            .set("S1", Embedding::new(values.clone()), meta(), true)
            .unwrap();

        let reloaded = sqlite_store(&path);
        assert_eq!(reloaded.load_all().unwrap(), 1);
        let got = reloaded.get("S1").unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&got.values), bits(&values));

        let m = reloaded.metadata("S1").unwrap();
        assert_eq!(m.model, "test-model");
        assert_eq!(m.extra.get("source").and_then(|v| v.as_str()), Some("unit-test"));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.db");
        let store = sqlite_store(&path);
        store.set("S1", Embedding::new(vec![1.0; DIM]), meta(), true).unwrap();
        store.set("S1", Embedding::new(vec![2.0; DIM]), meta(), true).unwrap();

        let reloaded = sqlite_store(&path);
        reloaded.load_all().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("S1").unwrap().values, vec![2.0; DIM]);
    }

    #[test]
    fn test_wrong_dimension_rejected_without_state_change() {
        let store = EmbeddingStore::new(Box::new(SqliteRecordStore::open_in_memory().unwrap()), settings());
        let err = store
            .set("S1", Embedding::new(vec![1.0; DIM + 1]), meta(), true)
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 4, actual: 5 }));
        assert!(store.get("S1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_identity_rejected() {
        let store = EmbeddingStore::new(Box::new(SqliteRecordStore::open_in_memory().unwrap()), settings());
        let err = store.set("  ", Embedding::new(vec![1.0; DIM]), meta(), false).unwrap_err();
        assert!(matches!(err, StoreError::EmptyIdentity));
    }

    #[test]
    fn test_persistence_failure_keeps_memory_entry() {
        let store = EmbeddingStore::new(Box::new(BrokenStore), settings());
        let err = store
            .set("S1", Embedding::new(vec![1.0; DIM]), meta(), true)
            .unwrap_err();
        assert!(err.is_persistence());
        assert_eq!(store.get("S1").unwrap().values, vec![1.0; DIM]);

        // Without persistence nothing touches the broken medium.
        store.set("S2", Embedding::new(vec![0.5; DIM]), meta(), false).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_unreadable_medium_fails_load() {
        let store = EmbeddingStore::new(Box::new(BrokenStore), settings());
        assert!(store.load_all().is_err());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.db");
        let store = sqlite_store(&path);
        store.set("S1", Embedding::new(vec![1.0; DIM]), meta(), true).unwrap();

        assert!(store.delete("S1", true).unwrap());
        assert!(!store.delete("S1", true).unwrap());
        assert!(store.get("S1").is_none());

        let reloaded = sqlite_store(&path);
        assert_eq!(reloaded.load_all().unwrap(), 0);
    }

    #[test]
    fn test_malformed_records_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.db");
        let store = sqlite_store(&path);
        store.set("good", Embedding::new(vec![1.0; DIM]), meta(), true).unwrap();

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO embeddings (identity, vector, metadata) VALUES ('torn', x'0102030405', NULL)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO embeddings (identity, vector, metadata) VALUES ('short', ?1, NULL)",
                params![encode_vector(&[1.0, 2.0])],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO embeddings (identity, vector, metadata) VALUES ('badmeta', ?1, '{not json')",
                params![encode_vector(&[0.5; DIM])],
            )
            .unwrap();
        }

        let reloaded = sqlite_store(&path);
        assert_eq!(reloaded.load_all().unwrap(), 2);
        assert!(reloaded.contains("good"));
        assert!(reloaded.contains("badmeta"));
        assert!(reloaded.metadata("badmeta").is_none());
        assert!(!reloaded.contains("torn"));
        assert!(!reloaded.contains("short"));
    }

    #[test]
    fn test_clear_is_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.db");
        let store = sqlite_store(&path);
        store.set("S1", Embedding::new(vec![1.0; DIM]), meta(), true).unwrap();
        store.set("S2", Embedding::new(vec![2.0; DIM]), meta(), true).unwrap();

        store.clear(Some("S1"));
        assert!(!store.contains("S1"));
        assert!(store.contains("S2"));

        store.clear(None);
        assert!(store.is_empty());

        store.load_all().unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_stats() {
        let store = EmbeddingStore::new(Box::new(SqliteRecordStore::open_in_memory().unwrap()), settings());
        store.set("b", Embedding::new(vec![1.0; DIM]), meta(), false).unwrap();
        store.set("a", Embedding::new(vec![1.0; DIM]), meta(), false).unwrap();

        let stats = store.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.identities, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stats.model, "test-model");
        assert_eq!(stats.distance_metric, DistanceMetric::Cosine);
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_vectors() {
        let store = Arc::new(EmbeddingStore::new(
            Box::new(SqliteRecordStore::open_in_memory().unwrap()),
            settings(),
        ));
        store.set("S1", Embedding::new(vec![0.0; DIM]), meta(), false).unwrap();

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..500 {
                    let v = vec![i as f32; DIM];
                    store.set("S1", Embedding::new(v), meta(), false).unwrap();
                }
            })
        };

        for _ in 0..500 {
            let v = store.get("S1").unwrap().values;
            assert!(v.iter().all(|x| *x == v[0]), "torn read: {v:?}");
        }
        writer.join().unwrap();
    }
}
