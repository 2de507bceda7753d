//! Activation & Feeling-of-Knowing
//!
//! Before committing to a full recall, the substrate can run a cheap probe
//! that estimates whether relevant memories exist (`sense_memory_availability`)
//! and queue a deeper scan for later (`request_background_search`). Processed
//! scans leave a small `activation_boost` on matching memories, promoting
//! them toward spontaneous recall until maintenance decays the boost away.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::config;
use crate::embeddings::{cosine_similarity, Embedding};
use crate::storage::{Result, Storage};

/// Similarity above which a memory counts as a probe match
const PROBE_SIMILARITY: f32 = 0.6;

/// Result of a quick availability probe
#[derive(Debug, Clone)]
pub struct ActivationProbe {
    /// Probe row id
    pub id: String,
    /// How many memories looked relevant
    pub estimated_matches: i64,
    /// When the probe row expires
    pub expires_at: DateTime<Utc>,
}

fn count_matches_tx(conn: &Connection, query_embedding: &[f32]) -> Result<i64> {
    let mut stmt = conn.prepare(
        "SELECT embedding FROM memories WHERE status = 'active' AND embedding IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
    let mut matches = 0i64;
    for row in rows {
        let bytes = row?;
        if let Some(embedding) = Embedding::from_bytes(&bytes) {
            let sim = cosine_similarity(&embedding.vector, query_embedding);
            if sim.is_finite() && sim >= PROBE_SIMILARITY {
                matches += 1;
            }
        }
    }
    Ok(matches)
}

impl Storage {
    /// Quick index probe recording a `memory_activation` row with a short TTL
    pub fn sense_memory_availability(&self, query: &str) -> Result<ActivationProbe> {
        let query_embedding = self.get_embedding(query)?;
        let ttl_seconds = self
            .get_config_u64("memory.activation_ttl_seconds")?
            .unwrap_or(300) as i64;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_seconds);
        self.with_writer(|conn| {
            let estimated_matches = count_matches_tx(conn, &query_embedding)?;
            conn.execute(
                "INSERT INTO memory_activations (id, query, estimated_matches, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, query, estimated_matches, now, expires_at],
            )?;
            Ok(ActivationProbe {
                id: id.clone(),
                estimated_matches,
                expires_at,
            })
        })
    }

    /// Queue a deeper scan for the background pass
    pub fn request_background_search(&self, query: &str) -> Result<String> {
        let embedding = self.get_embedding(query)?;
        let id = Uuid::new_v4().to_string();
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO background_searches (id, query, embedding, status, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![id, query, Embedding::new(embedding.clone()).to_bytes(), Utc::now()],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Process queued background searches at least `min_age_seconds` old,
    /// boosting matching memories. Returns how many searches were processed.
    pub fn process_background_searches(
        &self,
        batch: usize,
        min_age_seconds: i64,
    ) -> Result<usize> {
        let boost = self
            .with_reader(|conn| config::get_f64(conn, "memory.activation_boost"))?
            .unwrap_or(0.1);
        let cutoff = Utc::now() - Duration::seconds(min_age_seconds.max(0));
        self.with_tx(|tx| {
            let pending: Vec<(String, Option<Vec<u8>>)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, embedding FROM background_searches
                     WHERE status = 'pending' AND created_at <= ?1
                     ORDER BY created_at ASC, id ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![cutoff, batch as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
                })?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut processed = 0usize;
            for (search_id, embedding_bytes) in pending {
                if let Some(query_vec) =
                    embedding_bytes.and_then(|b| Embedding::from_bytes(&b).map(|e| e.vector))
                {
                    let matching: Vec<String> = {
                        let mut stmt = tx.prepare(
                            "SELECT id, embedding FROM memories
                             WHERE status = 'active' AND embedding IS NOT NULL",
                        )?;
                        let rows = stmt.query_map([], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                        })?;
                        let mut ids = Vec::new();
                        for row in rows {
                            let (memory_id, bytes) = row?;
                            if let Some(embedding) = Embedding::from_bytes(&bytes) {
                                let sim = cosine_similarity(&embedding.vector, &query_vec);
                                if sim.is_finite() && sim >= PROBE_SIMILARITY {
                                    ids.push(memory_id);
                                }
                            }
                        }
                        ids
                    };
                    for memory_id in matching {
                        tx.execute(
                            "UPDATE memories
                             SET activation_boost = MIN(1.0, activation_boost + ?1)
                             WHERE id = ?2",
                            params![boost, memory_id],
                        )?;
                    }
                }
                tx.execute(
                    "UPDATE background_searches SET status = 'processed', processed_at = ?1 WHERE id = ?2",
                    params![Utc::now(), search_id],
                )?;
                processed += 1;
            }
            Ok(processed)
        })
    }

    /// Subtract a small constant from every boost, clamping at zero.
    /// Returns the number of rows still carrying a boost.
    pub fn decay_activation_boosts(&self, step: f64) -> Result<usize> {
        self.with_writer(|conn| decay_activation_boosts_tx(conn, step))
    }

    /// Drop expired activation probes
    pub fn cleanup_activations(&self) -> Result<usize> {
        self.with_writer(|conn| cleanup_activations_tx(conn))
    }
}

pub(crate) fn decay_activation_boosts_tx(conn: &Connection, step: f64) -> Result<usize> {
    conn.execute(
        "UPDATE memories SET activation_boost = MAX(0.0, activation_boost - ?1)
         WHERE activation_boost > 0.0",
        params![step],
    )?;
    let remaining: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE activation_boost > 0.0",
        [],
        |row| row.get(0),
    )?;
    Ok(remaining as usize)
}

pub(crate) fn cleanup_activations_tx(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM memory_activations WHERE expires_at < ?1",
        params![Utc::now()],
    )?;
    Ok(n)
}

// ============================================================================
// TESTS
// ============================================================================
