//! Outbox
//!
//! Append-only queue of side-effects destined for delivery outside the core.
//! Delivery is at-least-once: the worker's adapter marks rows delivered or
//! bumps their attempt count, and every payload carries a `message_id` so
//! downstream consumers can deduplicate.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use uuid::Uuid;

use crate::storage::{Result, Storage};

/// Attempts after which a message is parked as failed
const MAX_DELIVERY_ATTEMPTS: i64 = 5;

/// Message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxKind {
    /// Destined for the human user
    User,
    /// Destined for an external tool endpoint
    Tool,
}

impl OutboxKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::User => "user",
            OutboxKind::Tool => "tool",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "user" => Some(OutboxKind::User),
            "tool" => Some(OutboxKind::Tool),
            _ => None,
        }
    }
}

/// An outbox row
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    /// Message id; also embedded in the payload as `message_id`
    pub id: String,
    /// Message class
    pub kind: OutboxKind,
    /// Delivery payload
    pub payload: Value,
    /// 'pending', 'delivered', 'failed'
    pub status: String,
    /// Delivery attempts so far
    pub attempts: i64,
    /// Heartbeat that produced the message, if any
    pub heartbeat_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

fn outbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxMessage> {
    let kind_raw: String = row.get(1)?;
    let payload_raw: String = row.get(2)?;
    Ok(OutboxMessage {
        id: row.get(0)?,
        kind: OutboxKind::parse_name(&kind_raw).unwrap_or(OutboxKind::Tool),
        payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
        status: row.get(3)?,
        attempts: row.get(4)?,
        heartbeat_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const OUTBOX_COLUMNS: &str = "id, kind, payload, status, attempts, heartbeat_id, created_at";

/// Enqueue a message; the generated id is stamped into the payload
pub(crate) fn enqueue_outbox_tx(
    conn: &Connection,
    kind: OutboxKind,
    mut payload: Value,
    heartbeat_id: Option<&str>,
) -> Result<OutboxMessage> {
    let id = Uuid::new_v4().to_string();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("message_id".to_string(), Value::String(id.clone()));
    }
    let now = Utc::now();
    conn.execute(
        "INSERT INTO outbox_messages (id, kind, payload, status, attempts, heartbeat_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)",
        params![id, kind.as_str(), serde_json::to_string(&payload)?, heartbeat_id, now],
    )?;
    Ok(OutboxMessage {
        id,
        kind,
        payload,
        status: "pending".to_string(),
        attempts: 0,
        heartbeat_id: heartbeat_id.map(str::to_string),
        created_at: now,
    })
}

/// Pending messages attached to one heartbeat
pub(crate) fn pending_for_heartbeat_tx(
    conn: &Connection,
    heartbeat_id: &str,
) -> Result<Vec<OutboxMessage>> {
    let sql = format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_messages
         WHERE heartbeat_id = ?1 AND status = 'pending'
         ORDER BY created_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![heartbeat_id], outbox_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

impl Storage {
    /// Enqueue a message for delivery
    pub fn enqueue_outbox(
        &self,
        kind: OutboxKind,
        payload: Value,
        heartbeat_id: Option<&str>,
    ) -> Result<OutboxMessage> {
        self.with_writer(|conn| enqueue_outbox_tx(conn, kind, payload, heartbeat_id))
    }

    /// Oldest pending messages first
    pub fn list_pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        self.with_reader(|conn| {
            let sql = format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox_messages
                 WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], outbox_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Mark a message delivered
    pub fn mark_outbox_delivered(&self, id: &str) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE outbox_messages SET status = 'delivered', updated_at = ?1 WHERE id = ?2",
                params![Utc::now(), id],
            )?;
            Ok(())
        })
    }

    /// Record a failed delivery attempt; the message stays pending until the
    /// attempt budget is exhausted.
    pub fn mark_outbox_attempt_failed(&self, id: &str) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE outbox_messages SET
                    attempts = attempts + 1,
                    status = CASE WHEN attempts + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
                    updated_at = ?2
                 WHERE id = ?3",
                params![MAX_DELIVERY_ATTEMPTS, Utc::now(), id],
            )?;
            Ok(())
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_test_storage;
    use serde_json::json;

    #[test]
    fn test_enqueue_stamps_message_id() {
        let (storage, _dir) = open_test_storage();
        let msg = storage
            .enqueue_outbox(OutboxKind::User, json!({"message": "hi"}), None)
            .unwrap();
        assert_eq!(msg.payload["message_id"], json!(msg.id));
        assert_eq!(msg.payload["message"], json!("hi"));

        let pending = storage.list_pending_outbox(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, msg.id);
    }

    #[test]
    fn test_delivery_lifecycle() {
        let (storage, _dir) = open_test_storage();
        let msg = storage
            .enqueue_outbox(OutboxKind::User, json!({"message": "retry me"}), None)
            .unwrap();

        for _ in 0..MAX_DELIVERY_ATTEMPTS - 1 {
            storage.mark_outbox_attempt_failed(&msg.id).unwrap();
            assert_eq!(storage.list_pending_outbox(10).unwrap().len(), 1);
        }
        storage.mark_outbox_attempt_failed(&msg.id).unwrap();
        assert!(storage.list_pending_outbox(10).unwrap().is_empty());
    }

    #[test]
    fn test_delivered_leaves_queue() {
        let (storage, _dir) = open_test_storage();
        let msg = storage
            .enqueue_outbox(OutboxKind::Tool, json!({"call": "noop"}), None)
            .unwrap();
        storage.mark_outbox_delivered(&msg.id).unwrap();
        assert!(storage.list_pending_outbox(10).unwrap().is_empty());
    }
}
