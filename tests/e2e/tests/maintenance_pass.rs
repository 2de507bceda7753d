//! Maintenance engine scenarios: archival and retention pruning over aged
//! rows, working-memory promotion, activation decay, and the subconscious
//! decider's full round-trip.

use anima_e2e_tests::{backdate_memory, initialized_agent};
use anima_core::{MemoryStatus, NodeKind, RecallInput, RememberInput};
use chrono::{Duration, Utc};
use serde_json::json;

#[test]
fn stale_memory_is_archived_then_deleted() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;

    let id = storage
        .remember(RememberInput {
            content: "an old, faded detail".into(),
            importance: 0.05,
            decay_rate: 0.01,
            ..Default::default()
        })
        .unwrap();
    backdate_memory(
        &agent.db_path,
        &id,
        Utc::now() - Duration::days(120),
        Utc::now() - Duration::days(90),
    );

    // First pass: relevance has decayed below threshold and the memory has
    // not been touched in over 30 days, so it is archived
    let stats = storage.run_maintenance_pass().unwrap();
    assert_eq!(stats.memories_archived, 1);
    assert_eq!(
        storage.get_memory(&id).unwrap().unwrap().status,
        MemoryStatus::Archived
    );

    // Second pass with a 100-day retention window deletes it and detaches
    // the graph node
    storage
        .set_config("maintenance.retention_days", &json!(100))
        .unwrap();
    let stats = storage.run_maintenance_pass().unwrap();
    assert_eq!(stats.memories_deleted, 1);
    assert!(storage.get_memory(&id).unwrap().is_none());
    assert!(storage
        .find_graph_node(NodeKind::Memory, &id)
        .unwrap()
        .is_none());
}

#[test]
fn important_memories_survive_the_pass() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;

    let id = storage
        .remember(RememberInput {
            content: "a formative event".into(),
            importance: 0.9,
            decay_rate: 0.001,
            ..Default::default()
        })
        .unwrap();
    backdate_memory(
        &agent.db_path,
        &id,
        Utc::now() - Duration::days(120),
        Utc::now() - Duration::days(90),
    );

    let stats = storage.run_maintenance_pass().unwrap();
    assert_eq!(stats.memories_archived, 0);
    assert_eq!(
        storage.get_memory(&id).unwrap().unwrap().status,
        MemoryStatus::Active
    );
}

#[test]
fn hot_working_memory_promotes_to_episodic() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;

    let hot = storage
        .add_to_working_memory("a recurring thought", 0.5, 120, json!({}))
        .unwrap();
    let cold = storage
        .add_to_working_memory("a passing thought", 0.3, 120, json!({}))
        .unwrap();
    for _ in 0..3 {
        storage.touch_working_memory(&[hot.clone()]).unwrap();
    }

    let stats = storage.run_maintenance_pass().unwrap();
    assert_eq!(stats.working_promoted, 1);
    assert!(storage.get_working_memory(&hot).unwrap().is_none());
    assert!(storage.get_working_memory(&cold).unwrap().is_some());

    // The promoted copy is episodic and traceable to its working-memory row
    let results = storage
        .recall(&RecallInput {
            query: "a recurring thought".into(),
            limit: 1,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results[0].memory.content, "a recurring thought");
    assert_eq!(
        results[0].memory.metadata["context"]["from_working_memory_id"],
        json!(hot)
    );
}

#[test]
fn activation_boosts_decay_across_passes() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;
    storage
        .set_config("maintenance.activation_decay", &json!(0.06))
        .unwrap();

    let id = storage
        .remember(RememberInput {
            content: "background search target".into(),
            ..Default::default()
        })
        .unwrap();
    storage
        .request_background_search("background search target")
        .unwrap();
    storage.process_background_searches(10, 0).unwrap();
    let boosted = storage.get_memory(&id).unwrap().unwrap().activation_boost;
    assert!(boosted > 0.0);

    storage.run_maintenance_pass().unwrap();
    let after_one = storage.get_memory(&id).unwrap().unwrap().activation_boost;
    assert!(after_one < boosted);

    storage.run_maintenance_pass().unwrap();
    let after_two = storage.get_memory(&id).unwrap().unwrap().activation_boost;
    assert_eq!(after_two, 0.0);
}

#[test]
fn subconscious_decider_round_trip() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;
    storage
        .set_config("maintenance.subconscious_interval_seconds", &json!(0))
        .unwrap();

    // Requires at least one heartbeat since the last run
    assert!(!storage.should_run_subconscious_decider().unwrap());
    let start = storage.run_heartbeat().unwrap().unwrap();
    storage
        .apply_external_call_result(
            &start.external_calls[0].id,
            &json!({
                "kind": "heartbeat_decision",
                "heartbeat_id": start.heartbeat_id,
                "decision": {
                    "reasoning": "quiet cycle",
                    "actions": [{"action": "rest", "params": {}}],
                    "goal_changes": [],
                },
            }),
        )
        .unwrap();
    assert!(storage.should_run_subconscious_decider().unwrap());

    let call = storage.start_subconscious_reflection().unwrap().unwrap();
    let seed = storage
        .remember(RememberInput {
            content: "evidence worth linking".into(),
            ..Default::default()
        })
        .unwrap();
    let other = storage
        .remember(RememberInput {
            content: "its consequence".into(),
            ..Default::default()
        })
        .unwrap();

    storage
        .apply_external_call_result(
            &call.id,
            &json!({
                "kind": "reflect",
                "result": {
                    "insights": [
                        {"content": "quiet cycles are restorative", "confidence": 0.7, "category": "self"}
                    ],
                    "discovered_relationships": [
                        {"from_id": seed, "to_id": other, "type": "CAUSES", "confidence": 0.8}
                    ],
                },
            }),
        )
        .unwrap();

    // The insight landed as a semantic memory
    let results = storage
        .recall(&RecallInput {
            query: "quiet cycles are restorative".into(),
            limit: 1,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results[0].memory.content, "quiet cycles are restorative");

    // The relationship landed in the graph
    let causes = storage.find_causes(&other, 2).unwrap();
    assert_eq!(causes.len(), 1);
    assert_eq!(causes[0].memory.id, seed);

    // The run was marked; the gate closes until another heartbeat
    assert!(!storage.should_run_subconscious_decider().unwrap());
}
