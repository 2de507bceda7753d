//! Ingestion Support
//!
//! The document ingestion pipeline lives outside the core; what the core
//! provides is (a) idempotent receipts so re-ingesting a source inserts
//! nothing twice, and (b) a registry of cancellation tokens that ingestion
//! sessions consult between chunks.

use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::storage::{Result, Storage};

// ============================================================================
// RECEIPTS
// ============================================================================

/// One chunk receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionReceipt {
    /// Source file identifier
    pub source_file: String,
    /// Chunk position within the source
    pub chunk_index: i64,
    /// Content hash of the chunk
    pub content_hash: String,
    /// Memory created from the chunk
    pub memory_id: String,
}

impl Storage {
    /// Insert receipts, ignoring rows whose (source_file, chunk_index,
    /// content_hash) already exists. Returns how many were newly inserted.
    pub fn record_ingestion_receipts(&self, receipts: &[IngestionReceipt]) -> Result<usize> {
        let now = Utc::now();
        self.with_tx(|tx| {
            let mut inserted = 0usize;
            for r in receipts {
                let n = tx.execute(
                    "INSERT OR IGNORE INTO ingestion_receipts
                        (source_file, chunk_index, content_hash, memory_id, inserted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![r.source_file, r.chunk_index, r.content_hash, r.memory_id, now],
                )?;
                inserted += n;
            }
            Ok(inserted)
        })
    }

    /// Whether a chunk has already been ingested
    pub fn has_ingestion_receipt(
        &self,
        source_file: &str,
        chunk_index: i64,
        content_hash: &str,
    ) -> Result<bool> {
        self.with_reader(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM ingestion_receipts
                 WHERE source_file = ?1 AND chunk_index = ?2 AND content_hash = ?3",
                params![source_file, chunk_index, content_hash],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    /// Receipts for one source file, in chunk order
    pub fn list_ingestion_receipts(
        &self,
        source_file: &str,
    ) -> Result<Vec<(IngestionReceipt, DateTime<Utc>)>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_file, chunk_index, content_hash, memory_id, inserted_at
                 FROM ingestion_receipts WHERE source_file = ?1
                 ORDER BY chunk_index ASC",
            )?;
            let rows = stmt.query_map(params![source_file], |row| {
                Ok((
                    IngestionReceipt {
                        source_file: row.get(0)?,
                        chunk_index: row.get(1)?,
                        content_hash: row.get(2)?,
                        memory_id: row.get(3)?,
                    },
                    row.get::<_, DateTime<Utc>>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

// ============================================================================
// CANCELLATION
// ============================================================================

/// Cooperative cancellation token handed to an ingestion session
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Process-wide map of session id -> token. The only legitimately global
/// mutable state in the substrate.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    /// Register (or fetch) the token for a session
    pub fn register(&self, session_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Cancel a session if it is registered
    pub fn cancel(&self, session_id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a finished session's token
    pub fn remove(&self, session_id: &str) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(session_id);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_test_storage;

    #[test]
    fn test_receipts_are_idempotent() {
        let (storage, _dir) = open_test_storage();
        let receipts = vec![
            IngestionReceipt {
                source_file: "notes.md".into(),
                chunk_index: 0,
                content_hash: "abc".into(),
                memory_id: "m1".into(),
            },
            IngestionReceipt {
                source_file: "notes.md".into(),
                chunk_index: 1,
                content_hash: "def".into(),
                memory_id: "m2".into(),
            },
        ];
        assert_eq!(storage.record_ingestion_receipts(&receipts).unwrap(), 2);
        // Second call inserts zero rows
        assert_eq!(storage.record_ingestion_receipts(&receipts).unwrap(), 0);
        assert!(storage.has_ingestion_receipt("notes.md", 0, "abc").unwrap());
        assert!(!storage.has_ingestion_receipt("notes.md", 0, "zzz").unwrap());

        let listed = storage.list_ingestion_receipts("notes.md").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.chunk_index, 0);
    }

    #[test]
    fn test_changed_chunk_gets_new_receipt() {
        let (storage, _dir) = open_test_storage();
        let first = IngestionReceipt {
            source_file: "doc.txt".into(),
            chunk_index: 0,
            content_hash: "v1".into(),
            memory_id: "m1".into(),
        };
        let edited = IngestionReceipt {
            content_hash: "v2".into(),
            memory_id: "m2".into(),
            ..first.clone()
        };
        assert_eq!(storage.record_ingestion_receipts(&[first]).unwrap(), 1);
        assert_eq!(storage.record_ingestion_receipts(&[edited]).unwrap(), 1);
    }

    #[test]
    fn test_cancellation_registry() {
        let registry = CancellationRegistry::default();
        let token = registry.register("session-1");
        assert!(!token.is_cancelled());

        // Same session returns the same token
        let again = registry.register("session-1");
        assert!(registry.cancel("session-1"));
        assert!(token.is_cancelled());
        assert!(again.is_cancelled());

        assert!(!registry.cancel("missing"));
        registry.remove("session-1");
        let fresh = registry.register("session-1");
        assert!(!fresh.is_cancelled());
    }
}
