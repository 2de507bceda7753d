//! Working Memory
//!
//! Short-lived notes with an explicit expiry. Items that keep getting touched
//! are promoted to episodic memories by the maintenance engine; everything
//! else quietly expires.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::embeddings::Embedding;
use crate::memory::store::insert_memory_tx;
use crate::memory::{MemoryKind, RememberInput};
use crate::storage::{CoreError, Result, Storage};

/// A working-memory row
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    /// Stable identifier
    pub id: String,
    /// Content
    pub content: String,
    /// Embedding, if populated
    pub embedding: Option<Vec<f32>>,
    /// Importance carried into promotion
    pub importance: f64,
    /// Trust carried into promotion
    pub trust_level: f64,
    /// Source descriptor
    pub source_attribution: Value,
    /// Free-form metadata
    pub metadata: Value,
    /// Touch count; drives promotion
    pub access_count: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last touch
    pub last_accessed: DateTime<Utc>,
    /// Hard expiry
    pub expiry: DateTime<Utc>,
}

fn working_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkingMemory> {
    let embedding_bytes: Option<Vec<u8>> = row.get(2)?;
    let source_raw: String = row.get(5)?;
    let metadata_raw: String = row.get(6)?;
    Ok(WorkingMemory {
        id: row.get(0)?,
        content: row.get(1)?,
        embedding: embedding_bytes.and_then(|b| Embedding::from_bytes(&b).map(|e| e.vector)),
        importance: row.get(3)?,
        trust_level: row.get(4)?,
        source_attribution: serde_json::from_str(&source_raw).unwrap_or_else(|_| json!({})),
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_else(|_| json!({})),
        access_count: row.get(7)?,
        created_at: row.get(8)?,
        last_accessed: row.get(9)?,
        expiry: row.get(10)?,
    })
}

const WORKING_COLUMNS: &str = "id, content, embedding, importance, trust_level, \
     source_attribution, metadata, access_count, created_at, last_accessed, expiry";

impl Storage {
    /// Add a working-memory item with a TTL in minutes
    pub fn add_to_working_memory(
        &self,
        content: &str,
        importance: f64,
        ttl_minutes: i64,
        metadata: Value,
    ) -> Result<String> {
        if content.trim().is_empty() {
            return Err(CoreError::InvalidInput("working memory content is empty".into()));
        }
        // Working memory tolerates a missing embedding; promotion re-embeds.
        let embedding = self.get_embedding(content).ok();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expiry = now + Duration::minutes(ttl_minutes.max(1));
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO working_memory (
                    id, content, embedding, importance, trust_level,
                    source_attribution, metadata, access_count,
                    created_at, last_accessed, expiry
                 ) VALUES (?1, ?2, ?3, ?4, 0.5, '{}', ?5, 0, ?6, ?6, ?7)",
                params![
                    id,
                    content,
                    embedding.as_ref().map(|v| Embedding::new(v.clone()).to_bytes()),
                    importance.max(0.0),
                    serde_json::to_string(&metadata)?,
                    now,
                    expiry,
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Bump access counters on working-memory items
    pub fn touch_working_memory(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        self.with_writer(|conn| {
            for id in ids {
                conn.execute(
                    "UPDATE working_memory
                     SET access_count = access_count + 1, last_accessed = ?1
                     WHERE id = ?2",
                    params![now, id],
                )?;
            }
            Ok(())
        })
    }

    /// Fetch one working-memory item
    pub fn get_working_memory(&self, id: &str) -> Result<Option<WorkingMemory>> {
        self.with_reader(|conn| {
            let sql = format!("SELECT {WORKING_COLUMNS} FROM working_memory WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id], working_from_row)
                .optional()?)
        })
    }

    /// Unexpired items, most recently touched first
    pub fn list_working_memory(&self, limit: usize) -> Result<Vec<WorkingMemory>> {
        self.with_reader(|conn| {
            let sql = format!(
                "SELECT {WORKING_COLUMNS} FROM working_memory
                 WHERE expiry > ?1
                 ORDER BY last_accessed DESC, id ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![Utc::now(), limit as i64], working_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Promote one working-memory item into an episodic memory, inheriting
    /// trust and stamping `context.from_working_memory_id`. The working row
    /// is consumed.
    pub fn promote_working_memory_to_episodic(
        &self,
        working_id: &str,
        importance: f64,
    ) -> Result<String> {
        self.with_tx(|tx| promote_tx(tx, working_id, importance))
    }

    /// Delete expired rows; returns how many were removed
    pub fn expire_working_memory(&self) -> Result<usize> {
        self.with_writer(|conn| expire_working_memory_tx(conn))
    }
}

pub(crate) fn expire_working_memory_tx(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM working_memory WHERE expiry < ?1",
        params![Utc::now()],
    )?;
    Ok(n)
}

pub(crate) fn promote_tx(
    tx: &Transaction<'_>,
    working_id: &str,
    importance: f64,
) -> Result<String> {
    let sql = format!("SELECT {WORKING_COLUMNS} FROM working_memory WHERE id = ?1");
    let item = tx
        .query_row(&sql, params![working_id], working_from_row)
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("working memory {working_id}")))?;

    let mut metadata = item.metadata.clone();
    if !metadata.is_object() {
        metadata = json!({});
    }
    let mut context = metadata
        .get("context")
        .cloned()
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}));
    context["from_working_memory_id"] = json!(item.id);
    metadata["context"] = context;
    metadata["emotional_valence"] = metadata
        .get("emotional_valence")
        .cloned()
        .unwrap_or_else(|| json!(0.0));

    let input = RememberInput {
        content: item.content.clone(),
        kind: MemoryKind::Episodic,
        importance: importance.max(0.0),
        trust_level: item.trust_level,
        source_attribution: Some(item.source_attribution.clone()),
        metadata,
        ..Default::default()
    };
    let new_id = insert_memory_tx(tx, &input, item.embedding.as_deref(), Utc::now())?;
    tx.execute(
        "DELETE FROM working_memory WHERE id = ?1",
        params![working_id],
    )?;
    Ok(new_id)
}

/// Ids of unexpired items whose access count crossed the promotion threshold
pub(crate) fn promotion_candidates_tx(
    conn: &Connection,
    min_access_count: i64,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM working_memory
         WHERE access_count >= ?1 AND expiry > ?2
         ORDER BY access_count DESC, id ASC",
    )?;
    let rows = stmt.query_map(params![min_access_count, Utc::now()], |row| {
        row.get::<_, String>(0)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================
