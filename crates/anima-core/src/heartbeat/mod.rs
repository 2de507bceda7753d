//! Heartbeat Scheduler
//!
//! One heartbeat is one bounded reasoning cycle: regenerate energy, gather
//! the decision context, ask the external processor what to do, apply the
//! decision action by action, and finalize with an auditable memory. The
//! cycle is modeled as persistent state in `heartbeat_log` so it can suspend
//! across external calls that outlive any process.

pub mod context;
pub mod executor;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config;
use crate::drives;
use crate::external::{create_call_tx, ExternalCall};
use crate::goals::GoalChange;
use crate::outbox::OutboxMessage;
use crate::storage::{CoreError, Result, Storage};

// ============================================================================
// DECISION DOCUMENTS
// ============================================================================

/// One action requested by a decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Action name
    pub action: String,
    /// Action parameters
    #[serde(default)]
    pub params: Value,
}

/// A heartbeat decision as returned by the external processor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decision {
    /// Why the agent chose these actions
    #[serde(default)]
    pub reasoning: String,
    /// Actions to apply in order
    #[serde(default)]
    pub actions: Vec<ActionRequest>,
    /// Goal lifecycle changes applied at finalization
    #[serde(default)]
    pub goal_changes: Vec<GoalChange>,
}

/// Audit entry for one applied (or skipped) action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Action name
    pub action: String,
    /// 'ok' or 'skipped'
    pub status: String,
    /// Why it was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Action-specific result payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ActionRecord {
    pub(crate) fn ok(action: &str, result: Option<Value>) -> Self {
        Self {
            action: action.to_string(),
            status: "ok".to_string(),
            reason: None,
            result,
        }
    }

    pub(crate) fn skipped(action: &str, reason: &str) -> Self {
        Self {
            action: action.to_string(),
            status: "skipped".to_string(),
            reason: Some(reason.to_string()),
            result: None,
        }
    }
}

// ============================================================================
// ROW TYPES
// ============================================================================

/// A hydrated heartbeat_log row
#[derive(Debug, Clone)]
pub struct HeartbeatRow {
    /// Heartbeat id
    pub id: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time; `None` while in flight
    pub ended_at: Option<DateTime<Utc>>,
    /// The applied decision document
    pub decision: Option<Decision>,
    /// Actions not yet applied (suspended executor state)
    pub pending_actions: Option<Vec<ActionRequest>>,
    /// Actions applied or skipped so far
    pub actions_taken: Vec<ActionRecord>,
    /// Goal changes to apply at finalization
    pub goal_changes: Vec<GoalChange>,
    /// Last will recorded by a confirmed termination
    pub last_will: Option<String>,
    /// Finalization memory id
    pub memory_id: Option<String>,
    /// Energy after regeneration, before actions
    pub energy_before: f64,
    /// Energy after the cycle
    pub energy_after: Option<f64>,
    /// Why the heartbeat was skipped, if it was
    pub reason_if_skipped: Option<String>,
    /// Abandoned by crash recovery
    pub aborted: bool,
}

/// What a freshly started heartbeat hands back to the worker
#[derive(Debug, Clone)]
pub struct HeartbeatStart {
    /// The new heartbeat id
    pub heartbeat_id: String,
    /// Calls the worker must dispatch (the decision request)
    pub external_calls: Vec<ExternalCall>,
}

/// Result of driving the executor
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// An action spawned an external call; progress is persisted and the
    /// heartbeat resumes when the call's result is applied
    Suspended {
        /// The pending call the worker must dispatch
        external_call: ExternalCall,
    },
    /// The heartbeat finalized
    Finalized {
        /// Finalization memory id
        memory_id: String,
        /// Messages queued during the cycle, ready for delivery
        outbox_messages: Vec<OutboxMessage>,
        /// A confirmed termination was executed
        terminated: bool,
    },
}

// ============================================================================
// ROW HELPERS
// ============================================================================

const HEARTBEAT_COLUMNS: &str = "id, started_at, ended_at, decision, pending_actions, \
     actions_taken, goal_changes, last_will, memory_id, energy_before, energy_after, \
     reason_if_skipped, aborted";

fn heartbeat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HeartbeatRow> {
    let decision_raw: Option<String> = row.get(3)?;
    let pending_raw: Option<String> = row.get(4)?;
    let taken_raw: String = row.get(5)?;
    let changes_raw: String = row.get(6)?;
    Ok(HeartbeatRow {
        id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        decision: decision_raw.and_then(|s| serde_json::from_str(&s).ok()),
        pending_actions: pending_raw.and_then(|s| serde_json::from_str(&s).ok()),
        actions_taken: serde_json::from_str(&taken_raw).unwrap_or_default(),
        goal_changes: serde_json::from_str(&changes_raw).unwrap_or_default(),
        last_will: row.get(7)?,
        memory_id: row.get(8)?,
        energy_before: row.get(9)?,
        energy_after: row.get(10)?,
        reason_if_skipped: row.get(11)?,
        aborted: row.get::<_, i64>(12)? != 0,
    })
}

pub(crate) fn load_heartbeat_tx(conn: &Connection, id: &str) -> Result<HeartbeatRow> {
    let sql = format!("SELECT {HEARTBEAT_COLUMNS} FROM heartbeat_log WHERE id = ?1");
    conn.query_row(&sql, params![id], heartbeat_from_row)
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("heartbeat {id}")))
}

pub(crate) fn in_flight_heartbeat_tx(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM heartbeat_log WHERE ended_at IS NULL AND aborted = 0
             ORDER BY started_at DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn current_energy_tx(conn: &Connection) -> Result<f64> {
    Ok(conn.query_row(
        "SELECT current_energy FROM heartbeat_state WHERE id = 1",
        [],
        |row| row.get(0),
    )?)
}

pub(crate) fn heartbeat_count_tx(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT heartbeat_count FROM heartbeat_state WHERE id = 1",
        [],
        |row| row.get(0),
    )?)
}

fn last_heartbeat_end_tx(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    Ok(conn
        .query_row(
            "SELECT MAX(ended_at) FROM heartbeat_log WHERE ended_at IS NOT NULL AND aborted = 0",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten())
}

// ============================================================================
// DUE-CHECK & START
// ============================================================================

/// Why a heartbeat is not currently due
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotDue {
    /// Agent not yet configured or initialization incomplete
    NotReady,
    /// No recorded consent decision of 'consent'
    ConsentMissing,
    /// `heartbeat_state.is_paused` is set
    Paused,
    /// The agent has been terminated
    Terminated,
    /// A heartbeat is already in flight
    InFlight(String),
    /// The interval since the last heartbeat has not elapsed
    TooSoon,
}

pub(crate) fn due_check_tx(conn: &Connection, now: DateTime<Utc>) -> Result<std::result::Result<(), NotDue>> {
    if config::is_agent_terminated_tx(conn)? {
        return Ok(Err(NotDue::Terminated));
    }
    if !config::is_agent_configured_tx(conn)? || !crate::init::is_init_complete_tx(conn)? {
        return Ok(Err(NotDue::NotReady));
    }
    if config::consent_status_tx(conn)?.as_deref() != Some("consent") {
        return Ok(Err(NotDue::ConsentMissing));
    }
    let paused: i64 = conn.query_row(
        "SELECT is_paused FROM heartbeat_state WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    if paused != 0 {
        return Ok(Err(NotDue::Paused));
    }
    if let Some(id) = in_flight_heartbeat_tx(conn)? {
        return Ok(Err(NotDue::InFlight(id)));
    }
    let settings = config::heartbeat_settings_tx(conn)?;
    if let Some(last_end) = last_heartbeat_end_tx(conn)? {
        if now - last_end < Duration::minutes(settings.interval_minutes) {
            return Ok(Err(NotDue::TooSoon));
        }
    }
    Ok(Ok(()))
}

impl Storage {
    /// Run one heartbeat if it is due. Returns `None` when the due-check does
    /// not pass; the worker simply polls again later.
    pub fn run_heartbeat(&self) -> Result<Option<HeartbeatStart>> {
        let now = Utc::now();
        self.with_tx(|tx| {
            match due_check_tx(tx, now)? {
                Ok(()) => {}
                Err(reason) => {
                    tracing::trace!(?reason, "heartbeat not due");
                    return Ok(None);
                }
            }
            Ok(Some(start_heartbeat_tx(tx, now)?))
        })
    }

    /// Start a heartbeat unconditionally (gates still enforced). Exposed for
    /// operator tooling; the worker path is [`Storage::run_heartbeat`].
    pub fn start_heartbeat(&self) -> Result<HeartbeatStart> {
        let now = Utc::now();
        self.with_tx(|tx| {
            if config::consent_status_tx(tx)?.as_deref() != Some("consent") {
                return Err(CoreError::ConsentRequired(
                    "heartbeats require a recorded consent decision".into(),
                ));
            }
            if let Some(in_flight) = in_flight_heartbeat_tx(tx)? {
                return Err(CoreError::StateViolation(format!(
                    "heartbeat {in_flight} is already in flight"
                )));
            }
            start_heartbeat_tx(tx, now)
        })
    }

    /// Fetch one heartbeat row
    pub fn get_heartbeat(&self, id: &str) -> Result<HeartbeatRow> {
        self.with_reader(|conn| load_heartbeat_tx(conn, id))
    }

    /// JSON snapshot of the heartbeat singleton
    pub fn heartbeat_state_snapshot(&self) -> Result<Value> {
        self.with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT current_energy, heartbeat_count, is_paused, init_stage
                 FROM heartbeat_state WHERE id = 1",
                [],
                |row| {
                    Ok(json!({
                        "current_energy": row.get::<_, f64>(0)?,
                        "heartbeat_count": row.get::<_, i64>(1)?,
                        "is_paused": row.get::<_, i64>(2)? != 0,
                        "init_stage": row.get::<_, String>(3)?,
                    }))
                },
            )?)
        })
    }

    /// Pause or resume the heartbeat loop
    pub fn set_heartbeat_paused(&self, paused: bool) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE heartbeat_state SET is_paused = ?1 WHERE id = 1",
                params![i64::from(paused)],
            )?;
            Ok(())
        })
    }

    /// Crash recovery: heartbeats left unfinalized without a pending external
    /// call are abandoned with a `crash_recovery` finalization memory; ones
    /// awaiting a call are left to resume normally. Returns abandoned ids.
    pub fn recover_unfinalized_heartbeats(&self) -> Result<Vec<String>> {
        self.with_tx(|tx| {
            let stale: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM heartbeat_log WHERE ended_at IS NULL AND aborted = 0",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut abandoned = Vec::new();
            for heartbeat_id in stale {
                let waiting: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM external_calls
                     WHERE status IN ('pending', 'in_flight')
                       AND (parent_heartbeat_id = ?1
                            OR json_extract(input, '$.heartbeat_id') = ?1)",
                    params![heartbeat_id],
                    |row| row.get(0),
                )?;
                if waiting > 0 {
                    continue;
                }

                let content = "Recovered from an interrupted cycle; abandoning it".to_string();
                let memory_id = crate::memory::store::insert_memory_tx(
                    tx,
                    &crate::memory::RememberInput {
                        content,
                        kind: crate::memory::MemoryKind::Episodic,
                        importance: 0.4,
                        metadata: json!({
                            "action_taken": "crash_recovery",
                            "context": { "heartbeat_id": heartbeat_id },
                            "result": "aborted",
                            "emotional_valence": -0.2,
                        }),
                        allow_deferred_embedding: true,
                        ..Default::default()
                    },
                    None,
                    Utc::now(),
                )?;
                tx.execute(
                    "UPDATE heartbeat_log SET
                        ended_at = ?1, aborted = 1, memory_id = ?2,
                        energy_after = (SELECT current_energy FROM heartbeat_state WHERE id = 1),
                        reason_if_skipped = 'crash_recovery'
                     WHERE id = ?3",
                    params![Utc::now(), memory_id, heartbeat_id],
                )?;
                abandoned.push(heartbeat_id);
            }
            Ok(abandoned)
        })
    }
}

pub(crate) fn start_heartbeat_tx(
    tx: &rusqlite::Transaction<'_>,
    now: DateTime<Utc>,
) -> Result<HeartbeatStart> {
    let settings = config::heartbeat_settings_tx(tx)?;

    // Drives accrue with wall-clock time whenever a cycle begins
    drives::accrue_drives_tx(tx, now)?;

    // Energy regenerates at the start of the cycle
    let energy = current_energy_tx(tx)?;
    let regenerated = (energy + settings.base_regeneration).min(settings.max_energy);
    tx.execute(
        "UPDATE heartbeat_state SET current_energy = ?1 WHERE id = 1",
        params![regenerated],
    )?;

    let heartbeat_id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO heartbeat_log (id, started_at, energy_before) VALUES (?1, ?2, ?3)",
        params![heartbeat_id, now, regenerated],
    )?;

    let decision_context = context::build_decision_context_tx(tx, &settings, &heartbeat_id)?;
    let call = create_call_tx(
        tx,
        json!({
            "kind": "heartbeat_decision",
            "heartbeat_id": heartbeat_id,
            "context": decision_context,
            "max_tokens": settings.max_decision_tokens,
        }),
        Some(&heartbeat_id),
    )?;

    tracing::info!(heartbeat = %heartbeat_id, energy = regenerated, "heartbeat started");
    Ok(HeartbeatStart {
        heartbeat_id,
        external_calls: vec![call],
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{consented_storage, open_test_storage};

    #[test]
    fn test_due_check_requires_consent() {
        let (storage, _dir) = open_test_storage();
        storage.set_config("agent.is_configured", &json!(true)).unwrap();
        assert!(storage.run_heartbeat().unwrap().is_none());

        let err = storage.start_heartbeat().unwrap_err();
        assert!(matches!(err, CoreError::ConsentRequired(_)));
    }

    #[test]
    fn test_run_heartbeat_regenerates_energy_and_emits_decision_call() {
        let (storage, _dir) = consented_storage();
        let start = storage.run_heartbeat().unwrap().unwrap();
        assert_eq!(start.external_calls.len(), 1);
        let call = &start.external_calls[0];
        assert_eq!(call.subkind(), Some("heartbeat_decision"));
        assert_eq!(call.parent_heartbeat_id.as_deref(), Some(start.heartbeat_id.as_str()));

        let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
        assert!(row.ended_at.is_none());
        // 0 energy + base_regeneration 10, capped at max 20
        assert!((row.energy_before - 10.0).abs() < 1e-9);

        // A second run is blocked by the in-flight heartbeat
        assert!(storage.run_heartbeat().unwrap().is_none());
    }

    #[test]
    fn test_paused_state_blocks_heartbeats() {
        let (storage, _dir) = consented_storage();
        storage.set_heartbeat_paused(true).unwrap();
        assert!(storage.run_heartbeat().unwrap().is_none());
        storage.set_heartbeat_paused(false).unwrap();
        assert!(storage.run_heartbeat().unwrap().is_some());
    }

    #[test]
    fn test_recovery_abandons_orphaned_heartbeat() {
        let (storage, _dir) = consented_storage();
        let start = storage.run_heartbeat().unwrap().unwrap();
        // Simulate a crash that lost the decision call
        storage
            .with_writer(|conn| {
                conn.execute("DELETE FROM external_calls", [])?;
                Ok(())
            })
            .unwrap();

        let abandoned = storage.recover_unfinalized_heartbeats().unwrap();
        assert_eq!(abandoned, vec![start.heartbeat_id.clone()]);
        let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
        assert!(row.aborted);
        assert!(row.ended_at.is_some());
        assert!(row.memory_id.is_some());

        // With the orphan cleared, a new heartbeat can start after the interval
        storage
            .set_config("heartbeat.heartbeat_interval_minutes", &json!(0))
            .unwrap();
        assert!(storage.run_heartbeat().unwrap().is_some());
    }

    #[test]
    fn test_recovery_leaves_waiting_heartbeat_alone() {
        let (storage, _dir) = consented_storage();
        let start = storage.run_heartbeat().unwrap().unwrap();
        let abandoned = storage.recover_unfinalized_heartbeats().unwrap();
        assert!(abandoned.is_empty());
        let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
        assert!(!row.aborted);
        assert!(row.ended_at.is_none());
    }
}
