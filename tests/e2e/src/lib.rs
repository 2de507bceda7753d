//! End-to-end test harness: deterministic embedders, agent bootstrap through
//! the public initialization flow, and direct row surgery for scenarios that
//! need to age history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use anima_core::{
    Embedding, EmbeddingError, EmbeddingProvider, Storage, EMBEDDING_DIMENSIONS,
};

// ============================================================================
// EMBEDDERS
// ============================================================================

/// Deterministic embedder: hash-derived unit vectors, with an override map so
/// scenarios can pin exact geometry for specific texts.
#[derive(Default)]
pub struct StubEmbedder {
    overrides: Mutex<HashMap<String, Vec<f32>>>,
}

impl StubEmbedder {
    /// Hash-derived unit vector for a text
    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(EMBEDDING_DIMENSIONS);
        let mut counter: u32 = 0;
        while out.len() < EMBEDDING_DIMENSIONS {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            for byte in hasher.finalize() {
                if out.len() == EMBEDDING_DIMENSIONS {
                    break;
                }
                out.push(f32::from(byte) / 127.5 - 1.0);
            }
            counter += 1;
        }
        normalize(&mut out);
        out
    }

    /// Pin the vector returned for an exact text
    pub fn set_override(&self, text: &str, vector: Vec<f32>) {
        self.overrides
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
    }
}

impl EmbeddingProvider for StubEmbedder {
    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }
        if let Some(v) = self.overrides.lock().unwrap().get(text) {
            return Ok(Embedding::new(v.clone()));
        }
        Ok(Embedding::new(Self::vector_for(text)))
    }

    fn check_health(&self) -> bool {
        true
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v {
            *x /= norm;
        }
    }
}

/// A unit vector whose cosine similarity to `unit_axis(0)` is exactly `cos`
pub fn vector_with_cosine(cos: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIMENSIONS];
    v[0] = cos;
    v[1] = (1.0 - cos * cos).max(0.0).sqrt();
    v
}

/// The unit basis vector along `axis`
pub fn unit_axis(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIMENSIONS];
    v[axis % EMBEDDING_DIMENSIONS] = 1.0;
    v
}

// ============================================================================
// AGENT BOOTSTRAP
// ============================================================================

/// An opened test agent
pub struct TestAgent {
    /// The shared store
    pub storage: Storage,
    /// Embedder handle for overrides
    pub embedder: Arc<StubEmbedder>,
    /// Database path for direct row surgery
    pub db_path: PathBuf,
    _dir: TempDir,
}

/// Fresh storage, nothing configured
pub fn open_agent() -> TestAgent {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("anima-e2e.db");
    let embedder = Arc::new(StubEmbedder::default());
    let storage = Storage::new(Some(db_path.clone()), embedder.clone()).expect("open storage");
    TestAgent {
        storage,
        embedder,
        db_path,
        _dir: dir,
    }
}

/// Walk the public initialization flow to a configured, consenting agent.
/// `consent_decision` is usually "consent"; pass "decline" to exercise the
/// refusal path.
pub fn initialized_agent(consent_decision: &str) -> TestAgent {
    let agent = open_agent();
    let storage = &agent.storage;

    storage
        .advance_init_stage("mode", &json!({"mode": "persona"}))
        .unwrap();
    storage
        .advance_init_stage(
            "heartbeat",
            &json!({
                "heartbeat_interval_minutes": 60,
                "max_energy": 20.0,
                "base_regeneration": 10.0,
                "max_active_goals": 3,
            }),
        )
        .unwrap();
    storage
        .advance_init_stage("identity", &json!({"name": "Iris", "description": "a test agent"}))
        .unwrap();
    storage
        .record_consent_response(&json!({
            "decision": consent_decision,
            "signature": if consent_decision == "consent" { "Iris" } else { "" },
            "memories": [],
        }))
        .unwrap();
    storage
        .advance_init_stage("complete", &json!({"enable_autonomy": true}))
        .unwrap();
    agent
}

// ============================================================================
// ROW SURGERY
// ============================================================================

/// Rewrite a memory's timestamps so age-driven behavior can be exercised
pub fn backdate_memory(
    db_path: &Path,
    memory_id: &str,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
) {
    let conn = rusqlite::Connection::open(db_path).expect("open db");
    conn.execute(
        "UPDATE memories SET created_at = ?1, last_accessed = ?2 WHERE id = ?3",
        rusqlite::params![created_at, last_accessed, memory_id],
    )
    .expect("backdate memory");
}

/// Count heartbeat_log rows
pub fn heartbeat_log_rows(db_path: &Path) -> i64 {
    let conn = rusqlite::Connection::open(db_path).expect("open db");
    conn.query_row("SELECT COUNT(*) FROM heartbeat_log", [], |row| row.get(0))
        .expect("count heartbeats")
}
