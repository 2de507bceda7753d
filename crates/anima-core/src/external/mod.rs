//! External Call Orchestration
//!
//! The bridge between the in-store state machine and out-of-process compute.
//! Calls are rows in a ledger; the worker dispatches them to a processor and
//! feeds results back through [`Storage::apply_external_call_result`], which
//! routes on a tagged result document and applies every side effect in one
//! transaction. Re-applying the same call is a no-op.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::goals::{goal_content, CreateGoal, GoalPriority};
use crate::graph::{ensure_node_tx, find_node_tx, upsert_edge_tx, EdgeKind, NodeKind};
use crate::heartbeat::executor::{
    debit_energy_tx, execute_pending_tx, finalization_content, finalize_heartbeat_tx,
    push_action_record_tx, TextEmbeddings,
};
use crate::heartbeat::{
    current_energy_tx, load_heartbeat_tx, ActionRecord, ActionRequest, Decision, ExecutionOutcome,
};
use crate::memory::store::{get_memory_tx, insert_memory_tx};
use crate::memory::{MemoryKind, RememberInput};
use crate::outbox::OutboxMessage;
use crate::storage::{CoreError, Result, Storage};

/// In-flight calls older than this are considered stranded and re-dispatched
const IN_FLIGHT_STALE_SECONDS: i64 = 120;

// ============================================================================
// LEDGER TYPES
// ============================================================================

/// Call lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Waiting to be dispatched
    Pending,
    /// Handed to a processor
    InFlight,
    /// Result applied
    Applied,
    /// Retries exhausted; a fallback document was (or will be) applied
    Failed,
}

impl CallStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::InFlight => "in_flight",
            CallStatus::Applied => "applied",
            CallStatus::Failed => "failed",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CallStatus::Pending),
            "in_flight" => Some(CallStatus::InFlight),
            "applied" => Some(CallStatus::Applied),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }
}

/// A ledger row
#[derive(Debug, Clone)]
pub struct ExternalCall {
    /// Call id
    pub id: String,
    /// Only 'think' exists today
    pub call_type: String,
    /// Typed input document; `input.kind` selects the processor
    pub input: Value,
    /// Heartbeat this call suspends, if any
    pub parent_heartbeat_id: Option<String>,
    /// Lifecycle status
    pub status: CallStatus,
    /// Dispatch attempts so far
    pub attempts: i64,
    /// The applied (or failed) result document
    pub output: Option<Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl ExternalCall {
    /// The input's `kind` discriminator
    pub fn subkind(&self) -> Option<&str> {
        self.input.get("kind").and_then(Value::as_str)
    }

    /// Deterministic fallback document applied after retry exhaustion
    pub fn fallback_output(&self) -> Value {
        match self.subkind() {
            Some("heartbeat_decision") => json!({
                "kind": "heartbeat_decision",
                "heartbeat_id": self.input.get("heartbeat_id"),
                "decision": {
                    "reasoning": "(no decision available)",
                    "actions": [{ "action": "rest", "params": {} }],
                    "goal_changes": [],
                },
            }),
            Some("brainstorm_goals") => json!({
                "kind": "brainstorm_goals",
                "heartbeat_id": self.input.get("heartbeat_id"),
                "goals": [],
            }),
            Some("inquire") => json!({
                "kind": "inquire",
                "heartbeat_id": self.input.get("heartbeat_id"),
                "query": self.input.get("query"),
                "depth": self.input.get("depth"),
                "summary": "",
                "confidence": 0.0,
                "sources": [],
            }),
            Some("reflect") => json!({
                "kind": "reflect",
                "heartbeat_id": self.input.get("heartbeat_id"),
                "result": {},
            }),
            Some("termination_confirm") => json!({
                "kind": "termination_confirm",
                "heartbeat_id": self.input.get("heartbeat_id"),
                "confirm": false,
                "reasoning": "(no confirmation available)",
                "alternative_actions": [{ "action": "rest", "params": {} }],
            }),
            _ => json!({
                "kind": "consent_request",
                "decision": "abstain",
                "signature": "",
                "memories": [],
            }),
        }
    }
}

const CALL_COLUMNS: &str =
    "id, call_type, input, parent_heartbeat_id, status, attempts, output, created_at, updated_at";

fn call_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExternalCall> {
    let input_raw: String = row.get(2)?;
    let status_raw: String = row.get(4)?;
    let output_raw: Option<String> = row.get(6)?;
    Ok(ExternalCall {
        id: row.get(0)?,
        call_type: row.get(1)?,
        input: serde_json::from_str(&input_raw).unwrap_or(Value::Null),
        parent_heartbeat_id: row.get(3)?,
        status: CallStatus::parse_name(&status_raw).unwrap_or(CallStatus::Pending),
        attempts: row.get(5)?,
        output: output_raw.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub(crate) fn create_call_tx(
    conn: &Connection,
    input: Value,
    parent_heartbeat_id: Option<&str>,
) -> Result<ExternalCall> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO external_calls (id, call_type, input, parent_heartbeat_id, status, attempts, created_at, updated_at)
         VALUES (?1, 'think', ?2, ?3, 'pending', 0, ?4, ?4)",
        params![id, serde_json::to_string(&input)?, parent_heartbeat_id, now],
    )?;
    Ok(ExternalCall {
        id,
        call_type: "think".to_string(),
        input,
        parent_heartbeat_id: parent_heartbeat_id.map(str::to_string),
        status: CallStatus::Pending,
        attempts: 0,
        output: None,
        created_at: now,
        updated_at: now,
    })
}

pub(crate) fn get_call_tx(conn: &Connection, id: &str) -> Result<Option<ExternalCall>> {
    let sql = format!("SELECT {CALL_COLUMNS} FROM external_calls WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], call_from_row).optional()?)
}

// ============================================================================
// RESULT DOCUMENTS
// ============================================================================

/// A goal proposed by a brainstorm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalDraft {
    /// Goal title
    pub title: String,
    /// Longer description
    #[serde(default)]
    pub description: Option<String>,
    /// Initial phase
    #[serde(default)]
    pub priority: Option<GoalPriority>,
    /// Where the goal came from
    #[serde(default)]
    pub source: Option<String>,
    /// Parent goal memory id
    #[serde(default)]
    pub parent_goal_id: Option<String>,
    /// Deadline
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

/// An insight produced by reflection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Insight {
    /// The insight itself
    pub content: String,
    /// Confidence in [0, 1]
    #[serde(default)]
    pub confidence: f64,
    /// Topic bucket
    #[serde(default)]
    pub category: Option<String>,
}

/// An identity facet change proposed by reflection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityUpdate {
    /// Facet ('voice', 'curiosity', ...)
    pub aspect_type: String,
    /// The change, phrased as a statement
    #[serde(default)]
    pub change: String,
    /// Why
    #[serde(default)]
    pub reason: Option<String>,
}

/// A confidence adjustment to an existing worldview memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldviewUpdate {
    /// Worldview memory id
    pub id: String,
    /// Replacement confidence in [0, 1]
    pub new_confidence: f64,
    /// Why
    #[serde(default)]
    pub reason: Option<String>,
}

/// A new evidence edge between a memory and a worldview memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldviewInfluence {
    /// Worldview memory id
    pub worldview_id: String,
    /// Evidence memory id
    pub memory_id: String,
    /// Edge strength
    #[serde(default)]
    pub strength: f64,
    /// 'supports' or 'contradicts'
    #[serde(default)]
    pub influence_type: Option<String>,
}

/// A typed relationship discovered between two memories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveredRelationship {
    /// Source memory id
    pub from_id: String,
    /// Target memory id
    pub to_id: String,
    /// Edge kind name
    #[serde(rename = "type")]
    pub relation: String,
    /// Confidence used as edge strength
    #[serde(default)]
    pub confidence: f64,
}

/// A contradiction noticed between two memories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContradictionNote {
    /// One side
    pub memory_a: String,
    /// The other side
    pub memory_b: String,
    /// Proposed resolution
    #[serde(default)]
    pub resolution: Option<String>,
}

/// A self-model adjustment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfUpdate {
    /// Association kind (free-form)
    #[serde(default)]
    pub kind: String,
    /// Concept name
    pub concept: String,
    /// Link strength
    #[serde(default)]
    pub strength: f64,
    /// Evidence memory to link from
    #[serde(default)]
    pub evidence_memory_id: Option<String>,
}

/// Everything a reflection may produce
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflectOutcome {
    /// New semantic memories
    #[serde(default)]
    pub insights: Vec<Insight>,
    /// Identity facet changes
    #[serde(default)]
    pub identity_updates: Vec<IdentityUpdate>,
    /// Worldview confidence adjustments
    #[serde(default)]
    pub worldview_updates: Vec<WorldviewUpdate>,
    /// New evidence edges
    #[serde(default)]
    pub worldview_influences: Vec<WorldviewInfluence>,
    /// New typed relationships
    #[serde(default)]
    pub discovered_relationships: Vec<DiscoveredRelationship>,
    /// Contradictions noticed
    #[serde(default)]
    pub contradictions_noted: Vec<ContradictionNote>,
    /// Self-model adjustments
    #[serde(default)]
    pub self_updates: Vec<SelfUpdate>,
}

/// A memory offered alongside a consent decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentMemory {
    /// Memory kind name
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Content
    pub content: String,
    /// Importance
    #[serde(default)]
    pub importance: Option<f64>,
}

/// The tagged result document. Unknown kinds fail deserialization, which is
/// exactly the fail-closed behavior dispatch wants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallOutput {
    /// The heartbeat decision
    HeartbeatDecision {
        /// Heartbeat to resume
        heartbeat_id: String,
        /// The decision document
        decision: Decision,
    },
    /// Proposed goals
    BrainstormGoals {
        /// Parent heartbeat
        #[serde(default)]
        heartbeat_id: Option<String>,
        /// Proposed goals
        #[serde(default)]
        goals: Vec<GoalDraft>,
    },
    /// Research summary
    Inquire {
        /// Parent heartbeat
        #[serde(default)]
        heartbeat_id: Option<String>,
        /// The question asked
        #[serde(default)]
        query: String,
        /// 'inquire_shallow' or 'inquire_deep'
        #[serde(default)]
        depth: String,
        /// The synthesized answer
        #[serde(default)]
        summary: String,
        /// Confidence in [0, 1]
        #[serde(default)]
        confidence: f64,
        /// Source descriptors
        #[serde(default)]
        sources: Vec<String>,
    },
    /// Reflection results
    Reflect {
        /// Parent heartbeat; absent for the subconscious decider
        #[serde(default)]
        heartbeat_id: Option<String>,
        /// What the reflection produced
        #[serde(default)]
        result: ReflectOutcome,
    },
    /// Termination confirmation round-trip
    TerminationConfirm {
        /// Parent heartbeat
        #[serde(default)]
        heartbeat_id: Option<String>,
        /// Whether termination proceeds
        confirm: bool,
        /// Why
        #[serde(default)]
        reasoning: String,
        /// Final words, required on confirm
        #[serde(default)]
        last_will: String,
        /// Replacement action queue on refusal
        #[serde(default)]
        alternative_actions: Vec<ActionRequest>,
    },
    /// Consent decision
    ConsentRequest {
        /// 'consent', 'decline', or 'abstain'
        decision: String,
        /// Signature accompanying consent
        #[serde(default)]
        signature: String,
        /// Memories to seed on consent
        #[serde(default)]
        memories: Vec<ConsentMemory>,
        /// Raw model response for the ledger
        #[serde(default)]
        raw_response: String,
    },
}

/// What applying a result produced
#[derive(Debug)]
pub struct ApplyOutcome {
    /// The call had already been applied; nothing was done
    pub already_applied: bool,
    /// Messages ready for delivery
    pub outbox_messages: Vec<OutboxMessage>,
    /// Executor movement, when the call belonged to a heartbeat
    pub execution: Option<ExecutionOutcome>,
    /// A confirmed termination was executed
    pub terminated: bool,
}

// ============================================================================
// STORAGE SURFACE
// ============================================================================

impl Storage {
    /// Fetch one call
    pub fn get_external_call(&self, id: &str) -> Result<Option<ExternalCall>> {
        self.with_reader(|conn| get_call_tx(conn, id))
    }

    /// Calls ready for dispatch: pending ones, plus in-flight ones whose
    /// worker apparently died.
    pub fn list_dispatchable_calls(&self, limit: usize) -> Result<Vec<ExternalCall>> {
        let stale = Utc::now() - Duration::seconds(IN_FLIGHT_STALE_SECONDS);
        self.with_reader(|conn| {
            let sql = format!(
                "SELECT {CALL_COLUMNS} FROM external_calls
                 WHERE status = 'pending' OR (status = 'in_flight' AND updated_at < ?1)
                 ORDER BY created_at ASC, id ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![stale, limit as i64], call_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Atomically claim a call for processing. Returns the attempt number, or
    /// `None` when another worker already holds it (or it is no longer
    /// claimable). Safe to race from both worker loops.
    pub fn claim_call(&self, id: &str) -> Result<Option<i64>> {
        let stale = Utc::now() - Duration::seconds(IN_FLIGHT_STALE_SECONDS);
        self.with_writer(|conn| {
            let claimed = conn.execute(
                "UPDATE external_calls SET status = 'in_flight', attempts = attempts + 1, updated_at = ?1
                 WHERE id = ?2
                   AND (status = 'pending' OR (status = 'in_flight' AND updated_at < ?3))",
                params![Utc::now(), id, stale],
            )?;
            if claimed == 0 {
                return Ok(None);
            }
            Ok(Some(conn.query_row(
                "SELECT attempts FROM external_calls WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?))
        })
    }

    /// Put a call back in the queue for another attempt
    pub fn mark_call_pending(&self, id: &str) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE external_calls SET status = 'pending', updated_at = ?1 WHERE id = ?2",
                params![Utc::now(), id],
            )?;
            Ok(())
        })
    }

    /// Record retry exhaustion. The caller then applies the fallback document.
    pub fn mark_call_failed(&self, id: &str) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE external_calls SET status = 'failed', updated_at = ?1 WHERE id = ?2",
                params![Utc::now(), id],
            )?;
            Ok(())
        })
    }

    /// Apply a result document to a call, transactionally. Routing is by the
    /// document's `kind` tag; a document that does not parse is rejected
    /// (fail closed). Applying the same call twice is a no-op.
    pub fn apply_external_call_result(&self, call_id: &str, output: &Value) -> Result<ApplyOutcome> {
        let parsed: CallOutput = serde_json::from_value(output.clone()).map_err(|e| {
            CoreError::InvalidInput(format!("unusable result document for call {call_id}: {e}"))
        })?;

        let call = self
            .get_external_call(call_id)?
            .ok_or_else(|| CoreError::NotFound(format!("external call {call_id}")))?;

        let embeddings = self.prefetch_for_output(&call, &parsed)?;

        self.with_tx(|tx| {
            let current = get_call_tx(tx, call_id)?
                .ok_or_else(|| CoreError::NotFound(format!("external call {call_id}")))?;
            if current.status == CallStatus::Applied {
                return Ok(ApplyOutcome {
                    already_applied: true,
                    outbox_messages: Vec::new(),
                    execution: None,
                    terminated: false,
                });
            }
            tx.execute(
                "UPDATE external_calls SET status = 'applied', output = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(output)?, Utc::now(), call_id],
            )?;

            apply_output_tx(tx, &current, &parsed, &embeddings)
        })
    }

    fn prefetch_for_output(
        &self,
        call: &ExternalCall,
        output: &CallOutput,
    ) -> Result<TextEmbeddings> {
        let mut texts: Vec<String> = Vec::new();
        match output {
            CallOutput::HeartbeatDecision { decision, .. } => {
                texts.extend(Self::decision_prefetch_texts(decision));
            }
            CallOutput::BrainstormGoals { goals, .. } => {
                for goal in goals {
                    texts.push(goal_content(&goal.title, goal.description.as_deref()));
                }
            }
            CallOutput::Inquire { summary, .. } => texts.push(summary.clone()),
            CallOutput::Reflect { result, .. } => {
                texts.extend(result.insights.iter().map(|i| i.content.clone()));
                texts.extend(result.identity_updates.iter().map(|u| u.change.clone()));
            }
            CallOutput::TerminationConfirm { confirm, last_will, .. } => {
                if *confirm {
                    texts.push(last_will.clone());
                }
            }
            CallOutput::ConsentRequest { memories, .. } => {
                texts.extend(memories.iter().map(|m| m.content.clone()));
            }
        }

        // A resuming heartbeat may run further inline actions and finalize
        if let Some(heartbeat_id) = &call.parent_heartbeat_id {
            if let Ok(row) = self.with_reader(|conn| load_heartbeat_tx(conn, heartbeat_id)) {
                if let Some(pending) = &row.pending_actions {
                    let queued = Decision {
                        reasoning: row
                            .decision
                            .as_ref()
                            .map(|d| d.reasoning.clone())
                            .unwrap_or_default(),
                        actions: pending.clone(),
                        goal_changes: vec![],
                    };
                    texts.extend(Self::decision_prefetch_texts(&queued));
                }
                if let Some(decision) = &row.decision {
                    texts.push(finalization_content(&decision.reasoning));
                }
            }
        }
        if let CallOutput::HeartbeatDecision { decision, .. } = output {
            texts.push(finalization_content(&decision.reasoning));
        }

        Ok(self.prefetch_embeddings(texts))
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

fn apply_output_tx(
    tx: &Transaction<'_>,
    call: &ExternalCall,
    output: &CallOutput,
    embeddings: &TextEmbeddings,
) -> Result<ApplyOutcome> {
    match output {
        CallOutput::HeartbeatDecision { heartbeat_id, decision } => {
            let row = load_heartbeat_tx(tx, heartbeat_id)?;
            if row.ended_at.is_some() {
                return Err(CoreError::StateViolation(format!(
                    "heartbeat {heartbeat_id} is already finalized"
                )));
            }
            tx.execute(
                "UPDATE heartbeat_log SET decision = ?1, pending_actions = ?2, goal_changes = ?3
                 WHERE id = ?4",
                params![
                    serde_json::to_string(decision)?,
                    serde_json::to_string(&decision.actions)?,
                    serde_json::to_string(&decision.goal_changes)?,
                    heartbeat_id,
                ],
            )?;
            let execution = execute_pending_tx(tx, heartbeat_id, embeddings)?;
            Ok(outcome_from_execution(execution))
        }

        CallOutput::BrainstormGoals { goals, .. } => {
            let active_episode = crate::graph::episodes::active_episode_tx(tx)?;
            let mut goal_ids = Vec::new();
            for draft in goals {
                if draft.title.trim().is_empty() {
                    continue;
                }
                let content = goal_content(&draft.title, draft.description.as_deref());
                let create = CreateGoal {
                    title: draft.title.clone(),
                    description: draft.description.clone(),
                    source: draft.source.clone().unwrap_or_else(|| "derived".to_string()),
                    priority: draft.priority.unwrap_or(GoalPriority::Queued),
                    parent_goal_id: draft.parent_goal_id.clone(),
                    originated_from: None,
                    due_at: draft.due_at,
                };
                let goal_id = crate::goals::create_goal_tx(
                    tx,
                    &create,
                    &content,
                    embeddings.get(&content).map(Vec::as_slice),
                )?;
                if let Some(episode) = &active_episode {
                    crate::graph::episodes::append_to_episode_tx(tx, episode, &goal_id, None)?;
                }
                goal_ids.push(goal_id);
            }
            resume_parent_tx(tx, call, json!({ "goal_ids": goal_ids }), embeddings)
        }

        CallOutput::Inquire { summary, confidence, sources, query, .. } => {
            let result = if summary.trim().is_empty() {
                json!({ "note": "empty inquiry result" })
            } else {
                let source_refs: Vec<Value> = sources
                    .iter()
                    .map(|s| json!({ "kind": "web", "ref": s, "trust": 0.5 }))
                    .collect();
                let input = RememberInput {
                    content: summary.clone(),
                    kind: MemoryKind::Semantic,
                    importance: 0.5,
                    metadata: json!({
                        "confidence": confidence.clamp(0.0, 1.0),
                        "source_references": source_refs,
                        "category": [],
                        "related_concepts": [],
                        "query": query,
                    }),
                    allow_deferred_embedding: true,
                    ..Default::default()
                };
                let memory_id = insert_memory_tx(
                    tx,
                    &input,
                    embeddings.get(summary).map(Vec::as_slice),
                    Utc::now(),
                )?;
                json!({ "memory_id": memory_id })
            };
            resume_parent_tx(tx, call, result, embeddings)
        }

        CallOutput::Reflect { result, .. } => {
            let summary = apply_reflect_tx(tx, result, embeddings)?;
            if call.parent_heartbeat_id.is_some() {
                resume_parent_tx(tx, call, summary, embeddings)
            } else {
                // Subconscious decider pass
                crate::maintenance::mark_subconscious_run_tx(tx)?;
                Ok(ApplyOutcome {
                    already_applied: false,
                    outbox_messages: Vec::new(),
                    execution: None,
                    terminated: false,
                })
            }
        }

        CallOutput::TerminationConfirm {
            confirm,
            last_will,
            alternative_actions,
            reasoning,
            ..
        } => {
            let heartbeat_id = call.parent_heartbeat_id.clone().ok_or_else(|| {
                CoreError::StateViolation("termination confirm without a heartbeat".into())
            })?;
            if *confirm {
                push_action_record_tx(
                    tx,
                    &heartbeat_id,
                    ActionRecord::ok("terminate", Some(json!({ "reasoning": reasoning }))),
                )?;
                let final_words = if last_will.trim().is_empty() {
                    "Goodbye."
                } else {
                    last_will.as_str()
                };
                insert_memory_tx(
                    tx,
                    &RememberInput {
                        content: final_words.to_string(),
                        kind: MemoryKind::Episodic,
                        importance: 1.0,
                        metadata: json!({
                            "action_taken": "terminate",
                            "context": { "heartbeat_id": heartbeat_id },
                            "result": "terminated",
                            "emotional_valence": 0.0,
                        }),
                        allow_deferred_embedding: true,
                        ..Default::default()
                    },
                    embeddings.get(last_will).map(Vec::as_slice),
                    Utc::now(),
                )?;
                tx.execute(
                    "UPDATE heartbeat_log SET last_will = ?1, pending_actions = '[]' WHERE id = ?2",
                    params![final_words, heartbeat_id],
                )?;
                crate::config::set_config_tx(tx, "agent.terminated", &json!(true))?;
                let execution = finalize_heartbeat_tx(tx, &heartbeat_id, embeddings, true)?;
                Ok(outcome_from_execution(execution))
            } else {
                push_action_record_tx(
                    tx,
                    &heartbeat_id,
                    ActionRecord::skipped("terminate", "not_confirmed"),
                )?;
                tx.execute(
                    "UPDATE heartbeat_log SET pending_actions = ?1 WHERE id = ?2",
                    params![serde_json::to_string(alternative_actions)?, heartbeat_id],
                )?;
                let execution = execute_pending_tx(tx, &heartbeat_id, embeddings)?;
                Ok(outcome_from_execution(execution))
            }
        }

        CallOutput::ConsentRequest {
            decision,
            signature,
            memories,
            raw_response,
        } => {
            let record = crate::init::record_consent_tx(
                tx,
                decision,
                signature,
                memories,
                raw_response,
                embeddings,
            )?;
            tracing::info!(decision = %record.decision, "consent recorded");
            Ok(ApplyOutcome {
                already_applied: false,
                outbox_messages: Vec::new(),
                execution: None,
                terminated: false,
            })
        }
    }
}

fn outcome_from_execution(execution: ExecutionOutcome) -> ApplyOutcome {
    let (outbox_messages, terminated) = match &execution {
        ExecutionOutcome::Finalized {
            outbox_messages,
            terminated,
            ..
        } => (outbox_messages.clone(), *terminated),
        ExecutionOutcome::Suspended { .. } => (Vec::new(), false),
    };
    ApplyOutcome {
        already_applied: false,
        outbox_messages,
        execution: Some(execution),
        terminated,
    }
}

/// Epilogue for a call that suspended an action: debit the action's energy,
/// record it as taken, and drive the executor onward.
fn resume_parent_tx(
    tx: &Transaction<'_>,
    call: &ExternalCall,
    result: Value,
    embeddings: &TextEmbeddings,
) -> Result<ApplyOutcome> {
    let Some(heartbeat_id) = &call.parent_heartbeat_id else {
        return Ok(ApplyOutcome {
            already_applied: false,
            outbox_messages: Vec::new(),
            execution: None,
            terminated: false,
        });
    };
    let action = call
        .input
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let cost = call.input.get("cost").and_then(Value::as_f64).unwrap_or(0.0);

    let energy = current_energy_tx(tx)?;
    if cost > energy {
        push_action_record_tx(
            tx,
            heartbeat_id,
            ActionRecord::skipped(&action, "insufficient_energy"),
        )?;
    } else {
        debit_energy_tx(tx, cost)?;
        push_action_record_tx(tx, heartbeat_id, ActionRecord::ok(&action, Some(result)))?;
    }
    let execution = execute_pending_tx(tx, heartbeat_id, embeddings)?;
    Ok(outcome_from_execution(execution))
}

/// Apply everything a reflection produced. Returns a count summary.
pub(crate) fn apply_reflect_tx(
    tx: &Transaction<'_>,
    outcome: &ReflectOutcome,
    embeddings: &TextEmbeddings,
) -> Result<Value> {
    let now = Utc::now();

    let mut insight_ids = Vec::new();
    for insight in &outcome.insights {
        if insight.content.trim().is_empty() {
            continue;
        }
        let input = RememberInput {
            content: insight.content.clone(),
            kind: MemoryKind::Semantic,
            importance: 0.6,
            metadata: json!({
                "confidence": insight.confidence.clamp(0.0, 1.0),
                "source_references": [],
                "category": insight.category.clone().map(|c| vec![c]).unwrap_or_default(),
                "related_concepts": [],
                "origin": "reflection",
            }),
            allow_deferred_embedding: true,
            ..Default::default()
        };
        let id = insert_memory_tx(
            tx,
            &input,
            embeddings.get(&insight.content).map(Vec::as_slice),
            now,
        )?;
        insight_ids.push(id);
    }

    for update in &outcome.identity_updates {
        if update.change.trim().is_empty() {
            continue;
        }
        let input = RememberInput {
            content: update.change.clone(),
            kind: MemoryKind::Worldview,
            importance: 0.7,
            decay_rate: 0.0,
            metadata: json!({
                "category": "identity",
                "subcategory": update.aspect_type,
                "origin": "reflection",
                "confidence": 0.6,
                "stability": 0.5,
                "change_requires": "evidence",
                "reason": update.reason,
            }),
            allow_deferred_embedding: true,
            ..Default::default()
        };
        insert_memory_tx(
            tx,
            &input,
            embeddings.get(&update.change).map(Vec::as_slice),
            now,
        )?;
    }

    for update in &outcome.worldview_updates {
        let Some(memory) = get_memory_tx(tx, &update.id)? else {
            tracing::warn!(worldview = %update.id, "worldview update target missing");
            continue;
        };
        if memory.kind != MemoryKind::Worldview {
            continue;
        }
        let mut metadata = memory.metadata;
        metadata["confidence"] = json!(update.new_confidence.clamp(0.0, 1.0));
        tx.execute(
            "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&metadata)?, now, update.id],
        )?;
    }

    for influence in &outcome.worldview_influences {
        let kind = match influence.influence_type.as_deref() {
            Some("contradicts") => EdgeKind::Contradicts,
            _ => EdgeKind::Supports,
        };
        let (Some(src), Some(dst)) = (
            find_node_tx(tx, NodeKind::Memory, &influence.memory_id)?,
            find_node_tx(tx, NodeKind::Memory, &influence.worldview_id)?,
        ) else {
            continue;
        };
        upsert_edge_tx(tx, src, dst, kind, influence.strength.clamp(0.0, 1.0), None)?;
        crate::memory::trust::update_worldview_confidence_tx(tx, &influence.worldview_id)?;
    }

    let mut relationships = 0usize;
    for rel in &outcome.discovered_relationships {
        let Some(kind) = EdgeKind::parse_name(&rel.relation.to_uppercase()) else {
            tracing::warn!(relation = %rel.relation, "unknown relationship kind skipped");
            continue;
        };
        let (Some(src), Some(dst)) = (
            find_node_tx(tx, NodeKind::Memory, &rel.from_id)?,
            find_node_tx(tx, NodeKind::Memory, &rel.to_id)?,
        ) else {
            continue;
        };
        upsert_edge_tx(tx, src, dst, kind, rel.confidence.clamp(0.0, 1.0), None)?;
        relationships += 1;
    }

    for note in &outcome.contradictions_noted {
        let (Some(src), Some(dst)) = (
            find_node_tx(tx, NodeKind::Memory, &note.memory_a)?,
            find_node_tx(tx, NodeKind::Memory, &note.memory_b)?,
        ) else {
            continue;
        };
        upsert_edge_tx(
            tx,
            src,
            dst,
            EdgeKind::Contradicts,
            0.8,
            Some(&json!({ "resolution": note.resolution })),
        )?;
    }

    for update in &outcome.self_updates {
        if update.concept.trim().is_empty() {
            continue;
        }
        let concept_node = ensure_node_tx(tx, NodeKind::Concept, &update.concept, Some(&update.concept))?;
        if let Some(evidence) = &update.evidence_memory_id {
            if let Some(memory_node) = find_node_tx(tx, NodeKind::Memory, evidence)? {
                upsert_edge_tx(
                    tx,
                    memory_node,
                    concept_node,
                    EdgeKind::InstanceOf,
                    update.strength.clamp(0.0, 1.0),
                    Some(&json!({ "kind": update.kind })),
                )?;
            }
        }
    }

    Ok(json!({
        "insights": insight_ids,
        "identity_updates": outcome.identity_updates.len(),
        "worldview_updates": outcome.worldview_updates.len(),
        "relationships": relationships,
        "contradictions": outcome.contradictions_noted.len(),
    }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::ActionRequest;
    use crate::test_support::consented_storage;

    fn start_with_decision(storage: &Storage, actions: Vec<ActionRequest>) -> (String, String) {
        let start = storage.run_heartbeat().unwrap().unwrap();
        let call = &start.external_calls[0];
        let output = json!({
            "kind": "heartbeat_decision",
            "heartbeat_id": start.heartbeat_id,
            "decision": {
                "reasoning": "exercise",
                "actions": actions,
                "goal_changes": [],
            },
        });
        storage.apply_external_call_result(&call.id, &output).unwrap();
        (start.heartbeat_id, call.id.clone())
    }

    #[test]
    fn test_unknown_kind_fails_closed() {
        let (storage, _dir) = consented_storage();
        let start = storage.run_heartbeat().unwrap().unwrap();
        let err = storage
            .apply_external_call_result(
                &start.external_calls[0].id,
                &json!({ "kind": "mystery", "data": 1 }),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (storage, _dir) = consented_storage();
        let start = storage.run_heartbeat().unwrap().unwrap();
        let call_id = start.external_calls[0].id.clone();
        let output = json!({
            "kind": "heartbeat_decision",
            "heartbeat_id": start.heartbeat_id,
            "decision": { "reasoning": "calm", "actions": [{"action": "rest", "params": {}}], "goal_changes": [] },
        });
        let first = storage.apply_external_call_result(&call_id, &output).unwrap();
        assert!(!first.already_applied);
        let second = storage.apply_external_call_result(&call_id, &output).unwrap();
        assert!(second.already_applied);

        // Only one finalized heartbeat, counted once
        let count = storage.heartbeat_state_snapshot().unwrap()["heartbeat_count"]
            .as_i64()
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_brainstorm_suspension_roundtrip() {
        let (storage, _dir) = consented_storage();
        let (heartbeat_id, _) = start_with_decision(
            &storage,
            vec![
                ActionRequest {
                    action: "brainstorm_goals".into(),
                    params: json!({}),
                },
                ActionRequest {
                    action: "rest".into(),
                    params: json!({}),
                },
            ],
        );

        // The decision suspended on the brainstorm call
        let row = storage.get_heartbeat(&heartbeat_id).unwrap();
        assert!(row.ended_at.is_none());
        let calls = storage.list_dispatchable_calls(10).unwrap();
        assert_eq!(calls.len(), 1);
        let brainstorm = &calls[0];
        assert_eq!(brainstorm.subkind(), Some("brainstorm_goals"));

        let outcome = storage
            .apply_external_call_result(
                &brainstorm.id,
                &json!({
                    "kind": "brainstorm_goals",
                    "heartbeat_id": heartbeat_id,
                    "goals": [
                        {"title": "Goal A", "priority": "queued", "source": "curiosity"}
                    ],
                }),
            )
            .unwrap();
        assert!(matches!(
            outcome.execution,
            Some(ExecutionOutcome::Finalized { .. })
        ));

        let row = storage.get_heartbeat(&heartbeat_id).unwrap();
        assert!(row.ended_at.is_some());
        assert_eq!(row.actions_taken.len(), 2);
        assert_eq!(row.actions_taken[0].action, "brainstorm_goals");
        assert_eq!(row.actions_taken[1].action, "rest");

        let goals = storage.list_goals(GoalPriority::Queued, 10).unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].title, "Goal A");
        assert_eq!(
            goals[0].memory.metadata["title"],
            json!("Goal A")
        );
    }

    #[test]
    fn test_inquire_creates_semantic_memory() {
        let (storage, _dir) = consented_storage();
        let (heartbeat_id, _) = start_with_decision(
            &storage,
            vec![ActionRequest {
                action: "inquire_shallow".into(),
                params: json!({"query": "what is an embedding?"}),
            }],
        );
        let call = storage.list_dispatchable_calls(10).unwrap().remove(0);
        assert_eq!(call.subkind(), Some("inquire"));

        storage
            .apply_external_call_result(
                &call.id,
                &json!({
                    "kind": "inquire",
                    "heartbeat_id": heartbeat_id,
                    "query": "what is an embedding?",
                    "depth": "inquire_shallow",
                    "summary": "Embeddings are dense vectors.",
                    "confidence": 0.8,
                    "sources": ["https://example.com"],
                }),
            )
            .unwrap();

        let results = storage
            .recall(&crate::memory::RecallInput {
                query: "Embeddings are dense vectors.".into(),
                limit: 3,
                kinds: Some(vec![MemoryKind::Semantic]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content, "Embeddings are dense vectors.");
        assert!(results[0].memory.trust_level > 0.0);
    }

    #[test]
    fn test_termination_refused_substitutes_alternatives() {
        let (storage, _dir) = consented_storage();
        let (heartbeat_id, _) = start_with_decision(
            &storage,
            vec![ActionRequest {
                action: "terminate".into(),
                params: json!({"last_will": "goodbye"}),
            }],
        );
        let confirm_call = storage.list_dispatchable_calls(10).unwrap().remove(0);
        assert_eq!(confirm_call.subkind(), Some("termination_confirm"));

        let outcome = storage
            .apply_external_call_result(
                &confirm_call.id,
                &json!({
                    "kind": "termination_confirm",
                    "heartbeat_id": heartbeat_id,
                    "confirm": false,
                    "alternative_actions": [{"action": "rest", "params": {}}],
                }),
            )
            .unwrap();
        assert!(!outcome.terminated);
        assert!(!storage.is_agent_terminated().unwrap());

        let row = storage.get_heartbeat(&heartbeat_id).unwrap();
        assert!(row.ended_at.is_some());
        let names: Vec<&str> = row.actions_taken.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(names, vec!["terminate", "rest"]);
        assert_eq!(row.actions_taken[0].status, "skipped");

        // Heartbeats keep running afterwards
        storage
            .set_config("heartbeat.heartbeat_interval_minutes", &json!(0))
            .unwrap();
        assert!(storage.run_heartbeat().unwrap().is_some());
    }

    #[test]
    fn test_termination_confirmed_stops_the_agent() {
        let (storage, _dir) = consented_storage();
        let (heartbeat_id, _) = start_with_decision(
            &storage,
            vec![ActionRequest {
                action: "terminate".into(),
                params: json!({"last_will": "thank you for everything"}),
            }],
        );
        let confirm_call = storage.list_dispatchable_calls(10).unwrap().remove(0);
        let outcome = storage
            .apply_external_call_result(
                &confirm_call.id,
                &json!({
                    "kind": "termination_confirm",
                    "heartbeat_id": heartbeat_id,
                    "confirm": true,
                    "last_will": "thank you for everything",
                }),
            )
            .unwrap();
        assert!(outcome.terminated);
        assert!(storage.is_agent_terminated().unwrap());

        let row = storage.get_heartbeat(&heartbeat_id).unwrap();
        assert!(row.ended_at.is_some());
        assert_eq!(row.last_will.as_deref(), Some("thank you for everything"));

        // No further heartbeats
        storage
            .set_config("heartbeat.heartbeat_interval_minutes", &json!(0))
            .unwrap();
        assert!(storage.run_heartbeat().unwrap().is_none());
    }

    #[test]
    fn test_fallback_document_for_failed_decision() {
        let (storage, _dir) = consented_storage();
        let start = storage.run_heartbeat().unwrap().unwrap();
        let call = &start.external_calls[0];
        storage.mark_call_failed(&call.id).unwrap();

        let fallback = call.fallback_output();
        let outcome = storage.apply_external_call_result(&call.id, &fallback).unwrap();
        assert!(matches!(
            outcome.execution,
            Some(ExecutionOutcome::Finalized { .. })
        ));
        let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
        assert!(row.ended_at.is_some());
        let memory = storage.get_memory(row.memory_id.as_ref().unwrap()).unwrap().unwrap();
        assert!(memory.content.contains("no decision available"));
    }
}
