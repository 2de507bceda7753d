//! Full heartbeat cycles driven through the public surface: start, decision
//! application, suspension on external calls, termination, and the consent
//! gate, with a scripted stand-in for the external processor.

use anima_e2e_tests::{heartbeat_log_rows, initialized_agent};
use anima_core::{ExecutionOutcome, GoalPriority, MemoryKind};
use serde_json::json;

#[test]
fn first_heartbeat_happy_path() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;
    storage
        .set_config("heartbeat.allowed_actions", &json!(["rest"]))
        .unwrap();

    let start = storage.run_heartbeat().unwrap().expect("heartbeat due");
    let decision_call = &start.external_calls[0];
    assert_eq!(decision_call.subkind(), Some("heartbeat_decision"));

    let outcome = storage
        .apply_external_call_result(
            &decision_call.id,
            &json!({
                "kind": "heartbeat_decision",
                "heartbeat_id": start.heartbeat_id,
                "decision": {
                    "reasoning": "calm",
                    "actions": [{"action": "rest", "params": {}}],
                    "goal_changes": [],
                },
            }),
        )
        .unwrap();

    let ExecutionOutcome::Finalized { memory_id, terminated, .. } =
        outcome.execution.expect("executor ran")
    else {
        panic!("expected finalization");
    };
    assert!(!terminated);

    // Energy was already full (20), regeneration capped it, rest cost nothing
    let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
    assert_eq!(row.energy_after, Some(20.0));
    assert_eq!(row.energy_before, 20.0);
    assert!(row.ended_at.is_some());

    let snapshot = storage.heartbeat_state_snapshot().unwrap();
    assert_eq!(snapshot["heartbeat_count"], json!(1));

    // The finalization memory is episodic and references the reasoning
    let memory = storage.get_memory(&memory_id).unwrap().unwrap();
    assert_eq!(memory.kind, MemoryKind::Episodic);
    assert!(memory.content.contains("calm"));

    // Not due again inside the 60-minute interval
    assert!(storage.run_heartbeat().unwrap().is_none());
}

#[test]
fn action_suspension_and_resumption() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;
    storage
        .set_config("heartbeat.allowed_actions", &json!(["brainstorm_goals", "rest"]))
        .unwrap();

    let start = storage.run_heartbeat().unwrap().unwrap();
    let decision_call = start.external_calls[0].id.clone();
    let outcome = storage
        .apply_external_call_result(
            &decision_call,
            &json!({
                "kind": "heartbeat_decision",
                "heartbeat_id": start.heartbeat_id,
                "decision": {
                    "reasoning": "expand the goal set",
                    "actions": [
                        {"action": "brainstorm_goals", "params": {}},
                        {"action": "rest", "params": {}},
                    ],
                    "goal_changes": [],
                },
            }),
        )
        .unwrap();

    // First application leaves the heartbeat suspended on a pending call
    let Some(ExecutionOutcome::Suspended { external_call }) = outcome.execution else {
        panic!("expected suspension");
    };
    assert_eq!(external_call.subkind(), Some("brainstorm_goals"));
    let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
    assert!(row.ended_at.is_none());

    // Second application finishes the cycle
    let outcome = storage
        .apply_external_call_result(
            &external_call.id,
            &json!({
                "kind": "brainstorm_goals",
                "heartbeat_id": start.heartbeat_id,
                "goals": [
                    {"title": "Goal A", "priority": "queued", "source": "curiosity"},
                ],
            }),
        )
        .unwrap();
    assert!(matches!(
        outcome.execution,
        Some(ExecutionOutcome::Finalized { .. })
    ));

    let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
    assert!(row.ended_at.is_some());
    assert_eq!(row.actions_taken.len(), 2);
    assert_eq!(row.actions_taken[0].action, "brainstorm_goals");
    assert_eq!(row.actions_taken[0].status, "ok");
    assert_eq!(row.actions_taken[1].action, "rest");

    let goals = storage.list_goals(GoalPriority::Queued, 10).unwrap();
    assert_eq!(goals.len(), 1);
    assert_eq!(goals[0].memory.metadata["title"], json!("Goal A"));
}

#[test]
fn termination_requires_confirmation() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;

    let start = storage.run_heartbeat().unwrap().unwrap();
    storage
        .apply_external_call_result(
            &start.external_calls[0].id,
            &json!({
                "kind": "heartbeat_decision",
                "heartbeat_id": start.heartbeat_id,
                "decision": {
                    "reasoning": "weary",
                    "actions": [{"action": "terminate", "params": {"last_will": "goodbye"}}],
                    "goal_changes": [],
                },
            }),
        )
        .unwrap();

    let confirm_call = storage.list_dispatchable_calls(10).unwrap().remove(0);
    assert_eq!(confirm_call.subkind(), Some("termination_confirm"));

    let outcome = storage
        .apply_external_call_result(
            &confirm_call.id,
            &json!({
                "kind": "termination_confirm",
                "heartbeat_id": start.heartbeat_id,
                "confirm": false,
                "alternative_actions": [{"action": "rest", "params": {}}],
            }),
        )
        .unwrap();
    assert!(!outcome.terminated);
    assert!(!storage.is_agent_terminated().unwrap());

    // The heartbeat finalized with the substituted action applied
    let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
    assert!(row.ended_at.is_some());
    let names: Vec<&str> = row.actions_taken.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(names, vec!["terminate", "rest"]);

    // Subsequent heartbeats still run
    storage
        .set_config("heartbeat.heartbeat_interval_minutes", &json!(0))
        .unwrap();
    assert!(storage.run_heartbeat().unwrap().is_some());
}

#[test]
fn consent_decline_blocks_heartbeats() {
    let agent = initialized_agent("decline");
    let storage = &agent.storage;

    assert_eq!(storage.consent_status().unwrap().as_deref(), Some("decline"));
    assert!(storage.is_agent_configured().unwrap());
    assert!(storage.is_init_complete().unwrap());

    // The due-check refuses indefinitely; no heartbeat rows appear
    for _ in 0..3 {
        assert!(storage.run_heartbeat().unwrap().is_none());
    }
    assert_eq!(heartbeat_log_rows(&agent.db_path), 0);
}

#[test]
fn energy_exhaustion_skips_and_finalizes() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;
    storage
        .set_config("heartbeat.cost_inquire_deep", &json!(50.0))
        .unwrap();

    let start = storage.run_heartbeat().unwrap().unwrap();
    let outcome = storage
        .apply_external_call_result(
            &start.external_calls[0].id,
            &json!({
                "kind": "heartbeat_decision",
                "heartbeat_id": start.heartbeat_id,
                "decision": {
                    "reasoning": "ambitious",
                    "actions": [
                        {"action": "remember", "params": {"content": "a small note"}},
                        {"action": "inquire_deep", "params": {"query": "everything"}},
                        {"action": "remember", "params": {"content": "never reached"}},
                    ],
                    "goal_changes": [],
                },
            }),
        )
        .unwrap();
    assert!(matches!(
        outcome.execution,
        Some(ExecutionOutcome::Finalized { .. })
    ));

    let row = storage.get_heartbeat(&start.heartbeat_id).unwrap();
    assert_eq!(row.actions_taken.len(), 3);
    assert_eq!(row.actions_taken[0].status, "ok");
    assert_eq!(row.actions_taken[1].reason.as_deref(), Some("insufficient_energy"));
    assert_eq!(row.actions_taken[2].reason.as_deref(), Some("insufficient_energy"));
    // Only the applied action spent energy
    assert_eq!(row.energy_after, Some(row.energy_before - 1.0));
}

#[test]
fn goal_changes_apply_at_finalization() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;
    let goal_id = storage
        .create_goal(anima_core::CreateGoal {
            title: "finish the survey".into(),
            source: "user_request".into(),
            priority: GoalPriority::Active,
            ..Default::default()
        })
        .unwrap();

    let start = storage.run_heartbeat().unwrap().unwrap();
    storage
        .apply_external_call_result(
            &start.external_calls[0].id,
            &json!({
                "kind": "heartbeat_decision",
                "heartbeat_id": start.heartbeat_id,
                "decision": {
                    "reasoning": "wrap up",
                    "actions": [{"action": "rest", "params": {}}],
                    "goal_changes": [
                        {"goal_id": goal_id, "change": "completed", "reason": "done"}
                    ],
                },
            }),
        )
        .unwrap();

    let memory = storage.get_memory(&goal_id).unwrap().unwrap();
    assert_eq!(memory.metadata["priority"], json!("completed"));
    assert_eq!(memory.status, anima_core::MemoryStatus::Archived);
}
