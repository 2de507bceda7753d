//! Action Executor
//!
//! Applies a decision's actions in order, spending energy as it goes. An
//! action that needs external compute suspends the cycle: progress is
//! persisted on the heartbeat row, the pending call goes into the ledger,
//! and execution resumes when the call's result is applied. Energy for such
//! an action is debited only on successful application of its result.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use serde_json::{json, Value};

use crate::config::{self, HeartbeatSettings};
use crate::external::create_call_tx;
use crate::goals::{goal_counts_tx, list_goals_tx, GoalPriority};
use crate::heartbeat::{
    current_energy_tx, load_heartbeat_tx, ActionRecord, ActionRequest, Decision,
    ExecutionOutcome,
};
use crate::memory::store::{insert_memory_tx, recall_with_embedding_tx, RecallInput};
use crate::memory::{MemoryKind, RememberInput};
use crate::outbox::{enqueue_outbox_tx, pending_for_heartbeat_tx, OutboxKind};
use crate::storage::{CoreError, Result, Storage};

/// Embeddings computed before a transaction opens, keyed by exact text.
/// The provider crosses the process boundary, so it is never consulted while
/// the writer transaction is held.
pub(crate) type TextEmbeddings = HashMap<String, Vec<f32>>;

// ============================================================================
// ACTION TAXONOMY
// ============================================================================

/// Known heartbeat actions
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Note the current situation into working memory
    Observe,
    /// Do nothing; relieves drive pressure
    Rest,
    /// Query the memory store
    Recall,
    /// Persist a new memory
    Remember,
    /// Reflective pass over recent experience (external)
    Reflect,
    /// Generate candidate goals (external)
    BrainstormGoals,
    /// Quick research question (external)
    InquireShallow,
    /// Deep research question (external)
    InquireDeep,
    /// Queue a message to the user
    ReachOutUser,
    /// Begin the two-phase termination protocol (external confirm)
    Terminate,
}

impl ActionKind {
    /// Every known action
    pub const ALL: &'static [ActionKind] = &[
        ActionKind::Observe,
        ActionKind::Rest,
        ActionKind::Recall,
        ActionKind::Remember,
        ActionKind::Reflect,
        ActionKind::BrainstormGoals,
        ActionKind::InquireShallow,
        ActionKind::InquireDeep,
        ActionKind::ReachOutUser,
        ActionKind::Terminate,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Observe => "observe",
            ActionKind::Rest => "rest",
            ActionKind::Recall => "recall",
            ActionKind::Remember => "remember",
            ActionKind::Reflect => "reflect",
            ActionKind::BrainstormGoals => "brainstorm_goals",
            ActionKind::InquireShallow => "inquire_shallow",
            ActionKind::InquireDeep => "inquire_deep",
            ActionKind::ReachOutUser => "reach_out_user",
            ActionKind::Terminate => "terminate",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "observe" => Some(ActionKind::Observe),
            "rest" => Some(ActionKind::Rest),
            "recall" => Some(ActionKind::Recall),
            "remember" => Some(ActionKind::Remember),
            "reflect" => Some(ActionKind::Reflect),
            "brainstorm_goals" => Some(ActionKind::BrainstormGoals),
            "inquire_shallow" => Some(ActionKind::InquireShallow),
            "inquire_deep" => Some(ActionKind::InquireDeep),
            "reach_out_user" => Some(ActionKind::ReachOutUser),
            "terminate" => Some(ActionKind::Terminate),
            _ => None,
        }
    }

    /// Baseline energy cost, overridable per action via `heartbeat.cost_<action>`
    pub fn default_cost(&self) -> f64 {
        match self {
            ActionKind::Observe | ActionKind::Rest | ActionKind::Terminate => 0.0,
            ActionKind::Recall | ActionKind::Remember => 1.0,
            ActionKind::Reflect => 2.0,
            ActionKind::BrainstormGoals | ActionKind::InquireShallow => 3.0,
            ActionKind::ReachOutUser => 5.0,
            ActionKind::InquireDeep => 6.0,
        }
    }

    /// Cost after config overrides
    pub fn effective_cost(&self, settings: &HeartbeatSettings) -> f64 {
        settings
            .cost_overrides
            .get(self.as_str())
            .copied()
            .unwrap_or_else(|| self.default_cost())
            .max(0.0)
    }

    /// Does applying this action require an external call round-trip?
    pub fn spawns_external_call(&self) -> bool {
        matches!(
            self,
            ActionKind::Reflect
                | ActionKind::BrainstormGoals
                | ActionKind::InquireShallow
                | ActionKind::InquireDeep
                | ActionKind::Terminate
        )
    }

    fn allowed(&self, settings: &HeartbeatSettings) -> bool {
        match &settings.allowed_actions {
            Some(list) => list.iter().any(|a| a == self.as_str()),
            None => true,
        }
    }
}

// ============================================================================
// ROW BOOKKEEPING
// ============================================================================

fn save_pending_tx(conn: &Connection, heartbeat_id: &str, pending: &[ActionRequest]) -> Result<()> {
    conn.execute(
        "UPDATE heartbeat_log SET pending_actions = ?1 WHERE id = ?2",
        params![serde_json::to_string(pending)?, heartbeat_id],
    )?;
    Ok(())
}

pub(crate) fn push_action_record_tx(
    conn: &Connection,
    heartbeat_id: &str,
    record: ActionRecord,
) -> Result<()> {
    let row = load_heartbeat_tx(conn, heartbeat_id)?;
    let mut taken = row.actions_taken;
    taken.push(record);
    conn.execute(
        "UPDATE heartbeat_log SET actions_taken = ?1 WHERE id = ?2",
        params![serde_json::to_string(&taken)?, heartbeat_id],
    )?;
    Ok(())
}

pub(crate) fn debit_energy_tx(conn: &Connection, cost: f64) -> Result<()> {
    conn.execute(
        "UPDATE heartbeat_state SET current_energy = MAX(0.0, current_energy - ?1) WHERE id = 1",
        params![cost.max(0.0)],
    )?;
    Ok(())
}

/// The content of a heartbeat's finalization memory; shared with embedding
/// prefetch so the key matches at insert time.
pub(crate) fn finalization_content(reasoning: &str) -> String {
    let trimmed = reasoning.trim();
    if trimmed.is_empty() {
        "Heartbeat concluded with no decision available".to_string()
    } else {
        format!("Heartbeat reflection: {trimmed}")
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

pub(crate) fn execute_pending_tx(
    tx: &Transaction<'_>,
    heartbeat_id: &str,
    embeddings: &TextEmbeddings,
) -> Result<ExecutionOutcome> {
    let settings = config::heartbeat_settings_tx(tx)?;

    loop {
        let row = load_heartbeat_tx(tx, heartbeat_id)?;
        if row.ended_at.is_some() {
            return Err(CoreError::StateViolation(format!(
                "heartbeat {heartbeat_id} is already finalized"
            )));
        }
        let mut pending = row.pending_actions.unwrap_or_default();
        let Some(request) = (!pending.is_empty()).then(|| pending.remove(0)) else {
            return finalize_heartbeat_tx(tx, heartbeat_id, embeddings, false);
        };
        save_pending_tx(tx, heartbeat_id, &pending)?;

        let Some(kind) = ActionKind::parse_name(&request.action) else {
            push_action_record_tx(
                tx,
                heartbeat_id,
                ActionRecord::skipped(&request.action, "unknown_action"),
            )?;
            continue;
        };
        if !kind.allowed(&settings) {
            push_action_record_tx(
                tx,
                heartbeat_id,
                ActionRecord::skipped(kind.as_str(), "not_allowed"),
            )?;
            continue;
        }

        let cost = kind.effective_cost(&settings);
        let energy = current_energy_tx(tx)?;
        if cost > energy {
            // Energy is exhausted: this action and everything behind it is
            // skipped, then the cycle finalizes.
            push_action_record_tx(
                tx,
                heartbeat_id,
                ActionRecord::skipped(kind.as_str(), "insufficient_energy"),
            )?;
            for rest in &pending {
                push_action_record_tx(
                    tx,
                    heartbeat_id,
                    ActionRecord::skipped(&rest.action, "insufficient_energy"),
                )?;
            }
            save_pending_tx(tx, heartbeat_id, &[])?;
            continue;
        }

        if kind.spawns_external_call() {
            // Suspend before spending: energy is debited when the result is
            // applied. The suspended action rides along in the call input.
            let call = spawn_action_call_tx(tx, heartbeat_id, kind, &request.params, cost)?;
            tracing::debug!(
                heartbeat = heartbeat_id,
                action = kind.as_str(),
                call = %call.id,
                "executor suspended on external call"
            );
            return Ok(ExecutionOutcome::Suspended {
                external_call: call,
            });
        }

        let result = apply_inline_action_tx(tx, heartbeat_id, kind, &request.params, embeddings)?;
        debit_energy_tx(tx, cost)?;
        push_action_record_tx(tx, heartbeat_id, ActionRecord::ok(kind.as_str(), result))?;
    }
}

fn spawn_action_call_tx(
    tx: &Transaction<'_>,
    heartbeat_id: &str,
    kind: ActionKind,
    action_params: &Value,
    cost: f64,
) -> Result<crate::external::ExternalCall> {
    let input = match kind {
        ActionKind::BrainstormGoals => {
            let counts = goal_counts_tx(tx)?;
            let active: Vec<String> = list_goals_tx(tx, GoalPriority::Active, 10)?
                .into_iter()
                .map(|g| g.title)
                .collect();
            json!({
                "kind": "brainstorm_goals",
                "heartbeat_id": heartbeat_id,
                "action": kind.as_str(),
                "cost": cost,
                "params": action_params,
                "context": {
                    "counts": counts
                        .iter()
                        .map(|(p, n)| (p.as_str().to_string(), json!(n)))
                        .collect::<serde_json::Map<_, _>>(),
                    "active_titles": active,
                },
            })
        }
        ActionKind::InquireShallow | ActionKind::InquireDeep => json!({
            "kind": "inquire",
            "heartbeat_id": heartbeat_id,
            "action": kind.as_str(),
            "cost": cost,
            "depth": kind.as_str(),
            "query": action_params.get("query").and_then(Value::as_str).unwrap_or(""),
            "params": action_params,
        }),
        ActionKind::Reflect => json!({
            "kind": "reflect",
            "heartbeat_id": heartbeat_id,
            "action": kind.as_str(),
            "cost": cost,
            "context": crate::maintenance::subconscious_context_tx(tx)?,
        }),
        ActionKind::Terminate => json!({
            "kind": "termination_confirm",
            "heartbeat_id": heartbeat_id,
            "action": kind.as_str(),
            "cost": cost,
            "params": {
                "last_will": action_params.get("last_will").and_then(Value::as_str).unwrap_or(""),
            },
        }),
        _ => unreachable!("only external actions spawn calls"),
    };
    create_call_tx(tx, input, Some(heartbeat_id))
}

fn apply_inline_action_tx(
    tx: &Transaction<'_>,
    heartbeat_id: &str,
    kind: ActionKind,
    params: &Value,
    embeddings: &TextEmbeddings,
) -> Result<Option<Value>> {
    match kind {
        ActionKind::Observe => {
            let energy = current_energy_tx(tx)?;
            let state = crate::emotion::emotional_state_tx(tx)?;
            let active_goals = list_goals_tx(tx, GoalPriority::Active, 100)?.len();
            let content = format!(
                "Observation: energy {energy:.1}, {active_goals} active goals, feeling {}",
                state.primary_emotion
            );
            let now = Utc::now();
            let expiry = now + chrono::Duration::hours(6);
            tx.execute(
                "INSERT INTO working_memory (
                    id, content, embedding, importance, trust_level,
                    source_attribution, metadata, access_count,
                    created_at, last_accessed, expiry
                 ) VALUES (?1, ?2, NULL, 0.3, 0.5, '{}', ?3, 0, ?4, ?4, ?5)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    content,
                    serde_json::to_string(&json!({ "heartbeat_id": heartbeat_id }))?,
                    now,
                    expiry,
                ],
            )?;
            Ok(Some(json!({ "observed": content })))
        }
        ActionKind::Rest => {
            tx.execute(
                "UPDATE drives SET level = level * 0.75, updated_at = ?1",
                params![Utc::now()],
            )?;
            Ok(None)
        }
        ActionKind::Recall => {
            let query = params.get("query").and_then(Value::as_str).unwrap_or("");
            let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;
            let Some(query_embedding) = embeddings.get(query) else {
                return Ok(Some(json!({ "memories": [], "note": "embedding unavailable" })));
            };
            let results = recall_with_embedding_tx(
                tx,
                &RecallInput {
                    query: query.to_string(),
                    limit,
                    ..Default::default()
                },
                query_embedding,
                Utc::now(),
            )?;
            let now = Utc::now();
            let mut briefs = Vec::new();
            for hit in &results {
                tx.execute(
                    "UPDATE memories SET
                        access_count = access_count + 1,
                        importance = importance + 0.05 / (1.0 + access_count),
                        last_accessed = ?1, updated_at = ?1
                     WHERE id = ?2",
                    params![now, hit.memory.id],
                )?;
                briefs.push(json!({
                    "id": hit.memory.id,
                    "content": hit.memory.content,
                    "score": hit.score,
                }));
            }
            Ok(Some(json!({ "memories": briefs })))
        }
        ActionKind::Remember => {
            let content = params.get("content").and_then(Value::as_str).unwrap_or("");
            if content.trim().is_empty() {
                return Ok(Some(json!({ "note": "nothing to remember" })));
            }
            let memory_kind = params
                .get("kind")
                .and_then(Value::as_str)
                .and_then(MemoryKind::parse_name)
                .unwrap_or(MemoryKind::Episodic);
            let importance = params
                .get("importance")
                .and_then(Value::as_f64)
                .unwrap_or(0.5);
            let input = RememberInput {
                content: content.to_string(),
                kind: memory_kind,
                importance,
                metadata: json!({
                    "action_taken": "remember",
                    "context": { "heartbeat_id": heartbeat_id },
                }),
                allow_deferred_embedding: true,
                ..Default::default()
            };
            let memory_id = insert_memory_tx(
                tx,
                &input,
                embeddings.get(content).map(Vec::as_slice),
                Utc::now(),
            )?;
            Ok(Some(json!({ "memory_id": memory_id })))
        }
        ActionKind::ReachOutUser => {
            let payload = json!({
                "message": params.get("message").and_then(Value::as_str).unwrap_or(""),
                "intent": params.get("intent"),
                "context": params.get("context"),
            });
            let message = enqueue_outbox_tx(tx, OutboxKind::User, payload, Some(heartbeat_id))?;
            Ok(Some(json!({ "outbox_message_id": message.id })))
        }
        _ => unreachable!("external actions do not reach the inline path"),
    }
}

// ============================================================================
// FINALIZATION
// ============================================================================

pub(crate) fn finalize_heartbeat_tx(
    tx: &Transaction<'_>,
    heartbeat_id: &str,
    embeddings: &TextEmbeddings,
    terminated: bool,
) -> Result<ExecutionOutcome> {
    let row = load_heartbeat_tx(tx, heartbeat_id)?;
    if row.ended_at.is_some() {
        return Err(CoreError::StateViolation(format!(
            "heartbeat {heartbeat_id} is already finalized"
        )));
    }

    // Goal changes apply before the finalization memory is written
    for change in &row.goal_changes {
        if let Err(e) = crate::goals::apply_goal_change_tx(tx, change) {
            tracing::warn!(goal = %change.goal_id, "goal change failed: {}", e);
        }
    }

    let reasoning = row
        .decision
        .as_ref()
        .map(|d| d.reasoning.clone())
        .unwrap_or_default();
    let content = finalization_content(&reasoning);
    let action_names: Vec<&str> = row.actions_taken.iter().map(|a| a.action.as_str()).collect();
    let metadata = json!({
        "action_taken": "heartbeat",
        "context": {
            "heartbeat_id": heartbeat_id,
            "actions": action_names,
        },
        "result": if terminated { "terminated" } else { "finalized" },
        "emotional_valence": 0.0,
    });
    let memory_id = insert_memory_tx(
        tx,
        &RememberInput {
            content: content.clone(),
            kind: MemoryKind::Episodic,
            importance: 0.5,
            metadata,
            allow_deferred_embedding: true,
            ..Default::default()
        },
        embeddings.get(&content).map(Vec::as_slice),
        Utc::now(),
    )?;

    let energy_after = current_energy_tx(tx)?;
    tx.execute(
        "UPDATE heartbeat_log SET
            ended_at = ?1, energy_after = ?2, memory_id = ?3, pending_actions = NULL
         WHERE id = ?4",
        params![Utc::now(), energy_after, memory_id, heartbeat_id],
    )?;
    tx.execute(
        "UPDATE heartbeat_state SET heartbeat_count = heartbeat_count + 1 WHERE id = 1",
        [],
    )?;

    let outbox_messages = pending_for_heartbeat_tx(tx, heartbeat_id)?;
    tracing::info!(
        heartbeat = heartbeat_id,
        energy_after,
        outbox = outbox_messages.len(),
        terminated,
        "heartbeat finalized"
    );
    Ok(ExecutionOutcome::Finalized {
        memory_id,
        outbox_messages,
        terminated,
    })
}

// ============================================================================
// STORAGE SURFACE
// ============================================================================

impl Storage {
    /// Best-effort embedding prefetch for a set of texts. Failures simply
    /// leave the text out of the map; insertion falls back to the deferred
    /// null-embedding path.
    pub(crate) fn prefetch_embeddings<I>(&self, texts: I) -> TextEmbeddings
    where
        I: IntoIterator<Item = String>,
    {
        let mut map = TextEmbeddings::new();
        for text in texts {
            if text.trim().is_empty() || map.contains_key(&text) {
                continue;
            }
            match self.get_embedding(&text) {
                Ok(vector) => {
                    map.insert(text, vector);
                }
                Err(e) => tracing::warn!("prefetch embedding failed: {}", e),
            }
        }
        map
    }

    pub(crate) fn decision_prefetch_texts(decision: &Decision) -> Vec<String> {
        let mut texts = vec![finalization_content(&decision.reasoning)];
        for action in &decision.actions {
            match action.action.as_str() {
                "recall" => {
                    if let Some(q) = action.params.get("query").and_then(Value::as_str) {
                        texts.push(q.to_string());
                    }
                }
                "remember" => {
                    if let Some(c) = action.params.get("content").and_then(Value::as_str) {
                        texts.push(c.to_string());
                    }
                }
                _ => {}
            }
        }
        texts
    }

    /// Store a decision on its heartbeat and drive the executor until it
    /// either suspends on an external call or finalizes the cycle.
    pub fn apply_heartbeat_decision(
        &self,
        heartbeat_id: &str,
        decision: &Decision,
    ) -> Result<ExecutionOutcome> {
        let embeddings = self.prefetch_embeddings(Self::decision_prefetch_texts(decision));
        self.with_tx(|tx| {
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
            execute_pending_tx(tx, heartbeat_id, &embeddings)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::consented_storage;
    use pretty_assertions::assert_eq;

    fn start(storage: &Storage) -> String {
        storage.run_heartbeat().unwrap().unwrap().heartbeat_id
    }

    fn decision(actions: Vec<ActionRequest>) -> Decision {
        Decision {
            reasoning: "test cycle".into(),
            actions,
            goal_changes: vec![],
        }
    }

    fn action(name: &str, params: Value) -> ActionRequest {
        ActionRequest {
            action: name.into(),
            params,
        }
    }

    #[test]
    fn test_rest_only_cycle_finalizes() {
        let (storage, _dir) = consented_storage();
        let hb = start(&storage);
        let outcome = storage
            .apply_heartbeat_decision(&hb, &decision(vec![action("rest", json!({}))]))
            .unwrap();
        let ExecutionOutcome::Finalized { memory_id, terminated, .. } = outcome else {
            panic!("expected finalization");
        };
        assert!(!terminated);

        let row = storage.get_heartbeat(&hb).unwrap();
        assert!(row.ended_at.is_some());
        assert_eq!(row.memory_id, Some(memory_id.clone()));
        assert_eq!(row.actions_taken.len(), 1);
        assert_eq!(row.actions_taken[0].action, "rest");
        assert_eq!(row.actions_taken[0].status, "ok");
        // rest costs nothing
        assert_eq!(row.energy_after, Some(row.energy_before));

        let memory = storage.get_memory(&memory_id).unwrap().unwrap();
        assert!(memory.content.contains("test cycle"));

        let count = storage.heartbeat_state_snapshot().unwrap()["heartbeat_count"]
            .as_i64()
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_energy_accounting_matches_costs() {
        let (storage, _dir) = consented_storage();
        let hb = start(&storage);
        let outcome = storage
            .apply_heartbeat_decision(
                &hb,
                &decision(vec![
                    action("remember", json!({"content": "note one", "importance": 0.4})),
                    action("recall", json!({"query": "note one", "limit": 3})),
                ]),
            )
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Finalized { .. }));

        let row = storage.get_heartbeat(&hb).unwrap();
        // remember (1.0) + recall (1.0)
        assert_eq!(row.energy_after, Some(row.energy_before - 2.0));
        let recall_record = &row.actions_taken[1];
        let hits = recall_record.result.as_ref().unwrap()["memories"]
            .as_array()
            .unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn test_insufficient_energy_skips_remaining() {
        let (storage, _dir) = consented_storage();
        storage
            .set_config("heartbeat.cost_reach_out_user", &json!(100.0))
            .unwrap();
        let hb = start(&storage);
        let outcome = storage
            .apply_heartbeat_decision(
                &hb,
                &decision(vec![
                    action("reach_out_user", json!({"message": "hello"})),
                    action("remember", json!({"content": "after the wall"})),
                ]),
            )
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Finalized { .. }));

        let row = storage.get_heartbeat(&hb).unwrap();
        assert_eq!(row.actions_taken.len(), 2);
        for record in &row.actions_taken {
            assert_eq!(record.status, "skipped");
            assert_eq!(record.reason.as_deref(), Some("insufficient_energy"));
        }
        assert_eq!(row.energy_after, Some(row.energy_before));
    }

    #[test]
    fn test_disallowed_and_unknown_actions_are_skipped() {
        let (storage, _dir) = consented_storage();
        storage
            .set_config("heartbeat.allowed_actions", &json!(["rest"]))
            .unwrap();
        let hb = start(&storage);
        storage
            .apply_heartbeat_decision(
                &hb,
                &decision(vec![
                    action("recall", json!({"query": "anything"})),
                    action("dance", json!({})),
                    action("rest", json!({})),
                ]),
            )
            .unwrap();
        let row = storage.get_heartbeat(&hb).unwrap();
        assert_eq!(row.actions_taken[0].reason.as_deref(), Some("not_allowed"));
        assert_eq!(row.actions_taken[1].reason.as_deref(), Some("unknown_action"));
        assert_eq!(row.actions_taken[2].status, "ok");
    }

    #[test]
    fn test_external_action_suspends_without_spending() {
        let (storage, _dir) = consented_storage();
        let hb = start(&storage);
        let outcome = storage
            .apply_heartbeat_decision(
                &hb,
                &decision(vec![
                    action("brainstorm_goals", json!({})),
                    action("rest", json!({})),
                ]),
            )
            .unwrap();
        let ExecutionOutcome::Suspended { external_call } = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(external_call.subkind(), Some("brainstorm_goals"));
        assert_eq!(external_call.parent_heartbeat_id.as_deref(), Some(hb.as_str()));

        let row = storage.get_heartbeat(&hb).unwrap();
        assert!(row.ended_at.is_none());
        assert!(row.actions_taken.is_empty(), "nothing applied yet");
        // Pending queue holds the remaining action only
        assert_eq!(row.pending_actions.as_ref().unwrap().len(), 1);
        // Energy untouched until the result applies
        let energy = storage.heartbeat_state_snapshot().unwrap()["current_energy"]
            .as_f64()
            .unwrap();
        assert_eq!(energy, row.energy_before);
    }

    #[test]
    fn test_reach_out_user_lands_in_outbox() {
        let (storage, _dir) = consented_storage();
        let hb = start(&storage);
        let outcome = storage
            .apply_heartbeat_decision(
                &hb,
                &decision(vec![action(
                    "reach_out_user",
                    json!({"message": "thinking of you", "intent": "checkin"}),
                )]),
            )
            .unwrap();
        let ExecutionOutcome::Finalized { outbox_messages, .. } = outcome else {
            panic!("expected finalization");
        };
        assert_eq!(outbox_messages.len(), 1);
        assert_eq!(outbox_messages[0].payload["message"], json!("thinking of you"));
        assert!(outbox_messages[0].payload["message_id"].is_string());
    }
}
