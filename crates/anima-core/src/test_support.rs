//! Shared unit-test fixtures: a deterministic stub embedder and storage
//! constructors over temp directories.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::embeddings::{Embedding, EmbeddingError, EmbeddingProvider, EMBEDDING_DIMENSIONS};
use crate::storage::Storage;

/// Deterministic embedder: same text, same unit vector; different texts land
/// far apart in the space. No network, no model files.
#[derive(Debug, Default, Clone)]
pub struct StubEmbedder;

impl StubEmbedder {
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
        let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut out {
                *x /= norm;
            }
        }
        out
    }
}

impl EmbeddingProvider for StubEmbedder {
    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }
        Ok(Embedding::new(Self::vector_for(text)))
    }

    fn check_health(&self) -> bool {
        true
    }
}

/// Fresh storage over a temp dir, stub-embedded
pub fn open_test_storage() -> (Storage, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let storage = Storage::new(
        Some(dir.path().join("anima-test.db")),
        Arc::new(StubEmbedder),
    )
    .expect("open storage");
    (storage, dir)
}

/// Storage with a fully configured, consented, unpaused agent: the state the
/// heartbeat worker needs before cycles run.
pub fn consented_storage() -> (Storage, TempDir) {
    let (storage, dir) = open_test_storage();
    storage
        .set_config("agent.is_configured", &serde_json::json!(true))
        .unwrap();
    storage
        .record_consent_response(&serde_json::json!({
            "decision": "consent",
            "signature": "test",
            "memories": [],
        }))
        .unwrap();
    storage
        .with_writer(|conn| {
            conn.execute(
                "UPDATE heartbeat_state SET init_stage = 'complete', is_paused = 0 WHERE id = 1",
                [],
            )?;
            Ok(())
        })
        .unwrap();
    (storage, dir)
}
