//! Episodes: coherent, ordered runs of memories.
//!
//! Episode rows live in the `episodes` table; membership is SEQUENCED_IN
//! edges carrying a monotonically increasing `sequence_order`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::embeddings::Embedding;
use crate::graph::{ensure_node_tx, find_node_tx, upsert_edge_tx, EdgeKind, NodeKind};
use crate::memory::store::{memory_from_row, MEMORY_COLUMNS};
use crate::memory::Memory;
use crate::storage::{CoreError, Result, Storage};

/// Episode listing entry
#[derive(Debug, Clone)]
pub struct EpisodeSummary {
    /// Episode id
    pub id: String,
    /// When the episode started
    pub started_at: DateTime<Utc>,
    /// When it was closed, if it was
    pub ended_at: Option<DateTime<Utc>>,
    /// Summary text
    pub summary: String,
    /// Number of SEQUENCED_IN members
    pub memory_count: i64,
}

impl Storage {
    /// Open a new episode
    pub fn begin_episode(&self, summary: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO episodes (id, started_at, summary, created_at) VALUES (?1, ?2, ?3, ?2)",
                params![id, now, summary],
            )?;
            ensure_node_tx(tx, NodeKind::Episode, &id, Some(summary))?;
            Ok(())
        })?;
        Ok(id)
    }

    /// The most recent episode that has not been closed yet
    pub fn active_episode(&self) -> Result<Option<String>> {
        self.with_reader(|conn| active_episode_tx(conn))
    }

    /// Append a memory to an episode. `sequence_order` defaults to one past
    /// the current maximum; an explicit value must exceed it.
    pub fn append_to_episode(
        &self,
        episode_id: &str,
        memory_id: &str,
        sequence_order: Option<i64>,
    ) -> Result<i64> {
        self.with_tx(|tx| append_to_episode_tx(tx, episode_id, memory_id, sequence_order))
    }

    /// Close an episode, optionally replacing its summary. The summary is
    /// embedded (outside the transaction) so episodes participate in
    /// similarity search.
    pub fn close_episode(&self, episode_id: &str, summary: Option<&str>) -> Result<()> {
        let summary_text = match summary {
            Some(s) => Some(s.to_string()),
            None => self.with_reader(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT summary FROM episodes WHERE id = ?1",
                        params![episode_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?)
            })?,
        };
        let Some(summary_text) = summary_text else {
            return Err(CoreError::NotFound(format!("episode {episode_id}")));
        };
        let embedding = if summary_text.is_empty() {
            None
        } else {
            self.get_embedding(&summary_text).ok()
        };
        let now = Utc::now();
        self.with_writer(|conn| {
            let n = conn.execute(
                "UPDATE episodes SET ended_at = ?1, summary = ?2, summary_embedding = ?3 WHERE id = ?4",
                params![
                    now,
                    summary_text,
                    embedding.as_ref().map(|v| Embedding::new(v.clone()).to_bytes()),
                    episode_id
                ],
            )?;
            if n == 0 {
                return Err(CoreError::NotFound(format!("episode {episode_id}")));
            }
            Ok(())
        })
    }

    /// Members of an episode in sequence order
    pub fn get_episode_memories(&self, episode_id: &str) -> Result<Vec<(Memory, i64)>> {
        self.with_reader(|conn| {
            let Some(node) = find_node_tx(conn, NodeKind::Episode, episode_id)? else {
                return Err(CoreError::NotFound(format!("episode {episode_id}")));
            };
            let mut stmt = conn.prepare(
                "SELECT n.key, e.properties FROM graph_edges e
                 JOIN graph_nodes n ON n.id = e.src
                 WHERE e.dst = ?1 AND e.kind = 'SEQUENCED_IN' AND n.kind = 'memory'",
            )?;
            let rows = stmt.query_map(params![node], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out: Vec<(Memory, i64)> = Vec::new();
            for row in rows {
                let (memory_id, props_raw) = row?;
                let order = serde_json::from_str::<serde_json::Value>(&props_raw)
                    .ok()
                    .and_then(|v| v.get("sequence_order").and_then(serde_json::Value::as_i64))
                    .unwrap_or(0);
                let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
                if let Some(memory) = conn
                    .query_row(&sql, params![memory_id], memory_from_row)
                    .optional()?
                {
                    out.push((memory, order));
                }
            }
            out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
            Ok(out)
        })
    }

    /// Recent episodes, newest first, with member counts
    pub fn list_recent_episodes(&self, limit: usize) -> Result<Vec<EpisodeSummary>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ep.id, ep.started_at, ep.ended_at, ep.summary,
                        (SELECT COUNT(*) FROM graph_edges e
                         JOIN graph_nodes n ON n.id = e.dst
                         WHERE n.kind = 'episode' AND n.key = ep.id AND e.kind = 'SEQUENCED_IN')
                 FROM episodes ep
                 ORDER BY ep.started_at DESC, ep.id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(EpisodeSummary {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    ended_at: row.get(2)?,
                    summary: row.get(3)?,
                    memory_count: row.get(4)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

pub(crate) fn active_episode_tx(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM episodes WHERE ended_at IS NULL
             ORDER BY started_at DESC, id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn append_to_episode_tx(
    conn: &Connection,
    episode_id: &str,
    memory_id: &str,
    sequence_order: Option<i64>,
) -> Result<i64> {
    let episode_node = find_node_tx(conn, NodeKind::Episode, episode_id)?
        .ok_or_else(|| CoreError::NotFound(format!("episode {episode_id}")))?;
    let memory_node = find_node_tx(conn, NodeKind::Memory, memory_id)?
        .ok_or_else(|| CoreError::NotFound(format!("graph node for memory {memory_id}")))?;

    let max_order: Option<i64> = conn
        .query_row(
            "SELECT MAX(CAST(json_extract(properties, '$.sequence_order') AS INTEGER))
             FROM graph_edges WHERE dst = ?1 AND kind = 'SEQUENCED_IN'",
            params![episode_node],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let next = max_order.map_or(1, |m| m + 1);
    let order = match sequence_order {
        Some(explicit) => {
            if let Some(max) = max_order {
                if explicit <= max {
                    return Err(CoreError::StateViolation(format!(
                        "sequence_order {explicit} not beyond current maximum {max}"
                    )));
                }
            }
            explicit
        }
        None => next,
    };

    upsert_edge_tx(
        conn,
        memory_node,
        episode_node,
        EdgeKind::SequencedIn,
        1.0,
        Some(&json!({ "sequence_order": order })),
    )?;
    Ok(order)
}

// ============================================================================
// TESTS
// ============================================================================
