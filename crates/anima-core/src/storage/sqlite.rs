//! SQLite Storage Implementation
//!
//! Owns the reader/writer connection pair, migrations, the embedding cache,
//! and the transaction discipline every other module builds on.

use chrono::Utc;
use directories::ProjectDirs;
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::embeddings::{
    content_hash, Embedding, EmbeddingError, EmbeddingProvider, EMBEDDING_DIMENSIONS,
};
use crate::ingest::CancellationRegistry;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Substrate error taxonomy
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
    /// Caller handed us something unusable
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Embedding provider failed after bounded retries
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    /// Invariant breach; fatal to the current operation, not the worker
    #[error("State violation: {0}")]
    StateViolation(String),
    /// Heartbeats refused before recorded consent
    #[error("Consent required: {0}")]
    ConsentRequired(String),
    /// Stored state no longer parses or satisfies invariants
    #[error("Corrupt state: {0}")]
    Corruption(String),
    /// Persisted JSON failed to (de)serialize
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Substrate result type
pub type Result<T> = std::result::Result<T, CoreError>;

// ============================================================================
// STORAGE
// ============================================================================

/// Main storage handle.
///
/// Uses separate reader/writer connections for interior mutability. All
/// methods take `&self`, making `Storage` `Send + Sync` so the workers can
/// share an `Arc<Storage>` without an outer mutex.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    embedder: Arc<dyn EmbeddingProvider>,
    /// LRU cache for query embeddings to avoid re-embedding repeated queries
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    /// Cancellation tokens for in-flight ingestion sessions
    cancellations: CancellationRegistry,
}

impl Storage {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the database and apply pending migrations
    pub fn new(db_path: Option<PathBuf>, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("sh", "anima", "anima").ok_or_else(|| {
                    CoreError::Init("Could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("anima.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        // SAFETY: 128 is non-zero
        let query_cache = Mutex::new(LruCache::new(NonZeroUsize::new(128).expect("non-zero")));

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            embedder,
            query_cache,
            cancellations: CancellationRegistry::default(),
        })
    }

    /// Registry of ingestion cancellation tokens
    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub(crate) fn lock_writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| CoreError::Init("Writer lock poisoned".into()))
    }

    pub(crate) fn lock_reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| CoreError::Init("Reader lock poisoned".into()))
    }

    /// Run `f` against the writer connection without an explicit transaction.
    /// Single-statement mutations rely on SQLite's per-statement atomicity.
    pub(crate) fn with_writer<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock_writer()?;
        f(&guard)
    }

    /// Run `f` against the reader connection
    pub(crate) fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock_reader()?;
        f(&guard)
    }

    /// Run `f` inside a single writer transaction. The closure either commits
    /// in full or everything it did is rolled back.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.lock_writer()?;
        let tx = guard.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ========================================================================
    // EMBEDDINGS
    // ========================================================================

    /// Obtain an embedding for `text`, consulting the in-process LRU and the
    /// persistent content-hash cache before the provider. Provider failures
    /// are retried per `embedding.retry_seconds` / `embedding.retry_interval_seconds`.
    pub fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()).into());
        }

        let hash = content_hash(text);

        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(v) = cache.get(&hash) {
                return Ok(v.clone());
            }
        }

        if let Some(vector) = self.cached_embedding(&hash)? {
            if let Ok(mut cache) = self.query_cache.lock() {
                cache.put(hash, vector.clone());
            }
            return Ok(vector);
        }

        let (retry_seconds, retry_interval) = self.embedding_retry_policy()?;
        let attempts = (retry_seconds / retry_interval).max(1);

        let mut last_err = EmbeddingError::ProviderUnavailable("no attempts made".into());
        for attempt in 0..attempts {
            match self.embedder.embed(text) {
                Ok(embedding) => {
                    if embedding.dimensions != EMBEDDING_DIMENSIONS {
                        return Err(EmbeddingError::InvalidDimensions(
                            EMBEDDING_DIMENSIONS,
                            embedding.dimensions,
                        )
                        .into());
                    }
                    self.store_cached_embedding(&hash, &embedding)?;
                    if let Ok(mut cache) = self.query_cache.lock() {
                        cache.put(hash, embedding.vector.clone());
                    }
                    return Ok(embedding.vector);
                }
                Err(e) => {
                    tracing::warn!("Embedding attempt {} failed: {}", attempt + 1, e);
                    last_err = e;
                    if attempt + 1 < attempts {
                        std::thread::sleep(std::time::Duration::from_secs(retry_interval));
                    }
                }
            }
        }
        Err(last_err.into())
    }

    /// Provider health probe, used by the worker before long runs
    pub fn check_embedding_health(&self) -> bool {
        self.embedder.check_health()
    }

    fn embedding_retry_policy(&self) -> Result<(u64, u64)> {
        let retry_seconds = self
            .get_config_u64("embedding.retry_seconds")?
            .unwrap_or(30)
            .max(1);
        let retry_interval = self
            .get_config_u64("embedding.retry_interval_seconds")?
            .unwrap_or(5)
            .max(1);
        Ok((retry_seconds, retry_interval))
    }

    fn cached_embedding(&self, hash: &str) -> Result<Option<Vec<f32>>> {
        let now = Utc::now();
        self.with_writer(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT embedding FROM embedding_cache WHERE content_hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(bytes) = bytes else { return Ok(None) };
            conn.execute(
                "UPDATE embedding_cache SET last_used = ?1 WHERE content_hash = ?2",
                params![now, hash],
            )?;
            Ok(Embedding::from_bytes(&bytes).map(|e| e.vector))
        })
    }

    fn store_cached_embedding(&self, hash: &str, embedding: &Embedding) -> Result<()> {
        let now = Utc::now();
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO embedding_cache (content_hash, embedding, created_at, last_used)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(content_hash) DO UPDATE SET last_used = ?3",
                params![hash, embedding.to_bytes(), now],
            )?;
            Ok(())
        })
    }

    /// Delete cache entries not used for `max_age_days`. Returns rows removed.
    pub fn cleanup_embedding_cache(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        self.with_writer(|conn| {
            let n = conn.execute(
                "DELETE FROM embedding_cache WHERE last_used < ?1",
                params![cutoff],
            )?;
            Ok(n)
        })
    }

    // ========================================================================
    // HEALTH
    // ========================================================================

    /// Aggregate counts for operator visibility
    pub fn memory_stats(&self) -> Result<MemoryStats> {
        self.with_reader(|conn| {
            let mut by_kind = Vec::new();
            {
                let mut stmt = conn
                    .prepare("SELECT kind, COUNT(*) FROM memories GROUP BY kind ORDER BY kind")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    by_kind.push(row?);
                }
            }

            let active: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?;
            let archived: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE status = 'archived'",
                [],
                |row| row.get(0),
            )?;
            let (avg_importance, avg_trust): (f64, f64) = conn.query_row(
                "SELECT COALESCE(AVG(importance), 0.0), COALESCE(AVG(trust_level), 0.0) FROM memories",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let working: i64 =
                conn.query_row("SELECT COUNT(*) FROM working_memory", [], |row| row.get(0))?;
            let clusters: i64 =
                conn.query_row("SELECT COUNT(*) FROM clusters", [], |row| row.get(0))?;
            let graph_nodes: i64 =
                conn.query_row("SELECT COUNT(*) FROM graph_nodes", [], |row| row.get(0))?;
            let graph_edges: i64 =
                conn.query_row("SELECT COUNT(*) FROM graph_edges", [], |row| row.get(0))?;
            let heartbeats: i64 = conn.query_row(
                "SELECT heartbeat_count FROM heartbeat_state WHERE id = 1",
                [],
                |row| row.get(0),
            )?;

            Ok(MemoryStats {
                by_kind,
                active,
                archived,
                avg_importance,
                avg_trust,
                working,
                clusters,
                graph_nodes,
                graph_edges,
                heartbeats,
            })
        })
    }
}

/// Aggregate store statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryStats {
    /// (kind, count) pairs in kind order
    pub by_kind: Vec<(String, i64)>,
    /// Memories with status 'active'
    pub active: i64,
    /// Memories with status 'archived'
    pub archived: i64,
    /// Mean importance across all memories
    pub avg_importance: f64,
    /// Mean trust across all memories
    pub avg_trust: f64,
    /// Working-memory rows
    pub working: i64,
    /// Cluster rows
    pub clusters: i64,
    /// Graph node count
    pub graph_nodes: i64,
    /// Graph edge count
    pub graph_edges: i64,
    /// Finalized heartbeat count
    pub heartbeats: i64,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{open_test_storage, StubEmbedder};

    #[test]
    fn test_open_applies_migrations() {
        let (storage, _dir) = open_test_storage();
        let stats = storage.memory_stats().unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.heartbeats, 0);
    }

    #[test]
    fn test_embedding_cache_roundtrip() {
        let (storage, _dir) = open_test_storage();
        let a = storage.get_embedding("hello world").unwrap();
        let b = storage.get_embedding("hello world").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIMENSIONS);
    }

    #[test]
    fn test_embedding_cache_survives_query_cache() {
        let (storage, _dir) = open_test_storage();
        let first = storage.get_embedding("persistent").unwrap();
        // Clear the in-process LRU; the table copy must still answer.
        storage.query_cache.lock().unwrap().clear();
        let second = storage.get_embedding("persistent").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cleanup_embedding_cache() {
        let (storage, _dir) = open_test_storage();
        storage.get_embedding("ephemeral").unwrap();
        // Nothing is older than a day yet
        assert_eq!(storage.cleanup_embedding_cache(1).unwrap(), 0);
        // Everything is older than -1 days
        assert_eq!(storage.cleanup_embedding_cache(-1).unwrap(), 1);
    }

    #[test]
    fn test_stub_embedder_is_deterministic() {
        let stub = StubEmbedder::default();
        let a = stub.embed("same text").unwrap();
        let b = stub.embed("same text").unwrap();
        assert_eq!(a.vector, b.vector);
    }
}
