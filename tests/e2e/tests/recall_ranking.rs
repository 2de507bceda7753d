//! Recall ranking with pinned embedding geometry: the combined score, its
//! determinism, and the boundary behaviors around zero vectors and limits.

use anima_e2e_tests::{open_agent, unit_axis, vector_with_cosine};
use anima_core::{RecallInput, RememberInput, EMBEDDING_DIMENSIONS};
use serde_json::json;

const QUERY: &str = "the pinned query";

/// Insert a memory with exact similarity-to-query geometry
fn pinned_memory(
    agent: &anima_e2e_tests::TestAgent,
    content: &str,
    cosine: f32,
    importance: f64,
    trust: f64,
) -> String {
    agent
        .storage
        .remember(RememberInput {
            content: content.into(),
            importance,
            decay_rate: 0.0,
            trust_level: trust,
            embedding: Some(vector_with_cosine(cosine)),
            ..Default::default()
        })
        .unwrap()
}

#[test]
fn combined_score_ranks_and_breaks_ties_by_id() {
    let agent = open_agent();
    agent.embedder.set_override(QUERY, unit_axis(0));

    // (importance, trust, cosine) triples
    let m1 = pinned_memory(&agent, "memory one", 0.80, 0.9, 0.9);
    let m2 = pinned_memory(&agent, "memory two", 0.95, 0.6, 0.9);
    let m3 = pinned_memory(&agent, "memory three", 0.95, 0.9, 0.2);

    let results = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 3,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results.len(), 3);

    // With unit weights, no decay, and shared recency, the additive score is
    // cosine + importance + trust (+ constant): 2.6, 2.45, 2.05
    let order: Vec<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
    assert_eq!(order, vec![m1.as_str(), m2.as_str(), m3.as_str()]);
    assert!(results[0].score > results[1].score);
    assert!(results[1].score > results[2].score);

    // Determinism: identical state and query produce the identical ranking
    let again = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 3,
            ..Default::default()
        })
        .unwrap();
    let order_again: Vec<&str> = again.iter().map(|r| r.memory.id.as_str()).collect();
    assert_eq!(order, order_again);

    // Exact ties break by id ascending
    let twin_a = pinned_memory(&agent, "twin", 0.5, 0.5, 0.5);
    let twin_b = pinned_memory(&agent, "twin", 0.5, 0.5, 0.5);
    let twins = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 10,
            min_importance: 0.45,
            ..Default::default()
        })
        .unwrap();
    let twin_order: Vec<&str> = twins
        .iter()
        .map(|r| r.memory.id.as_str())
        .filter(|id| *id == twin_a || *id == twin_b)
        .collect();
    let mut expected = vec![twin_a.as_str(), twin_b.as_str()];
    expected.sort();
    assert_eq!(twin_order, expected);
}

#[test]
fn weights_are_configurable() {
    let agent = open_agent();
    agent.embedder.set_override(QUERY, unit_axis(0));

    let similar = pinned_memory(&agent, "similar but untrusted", 0.95, 0.1, 0.1);
    let trusted = pinned_memory(&agent, "distant but trusted", 0.10, 0.1, 1.0);

    // Similarity-only weighting
    agent
        .storage
        .set_config(
            "memory.recall_weights",
            &json!({"alpha": 1.0, "beta": 0.0, "gamma": 0.0, "delta": 0.0}),
        )
        .unwrap();
    let results = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 2,
            include_partial: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results[0].memory.id, similar);

    // Trust-dominant weighting flips the order
    agent
        .storage
        .set_config(
            "memory.recall_weights",
            &json!({"alpha": 1.0, "beta": 0.0, "gamma": 10.0, "delta": 0.0}),
        )
        .unwrap();
    let results = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 2,
            include_partial: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results[0].memory.id, trusted);
}

#[test]
fn zero_vector_memories_stay_out_of_recall() {
    let agent = open_agent();
    agent.embedder.set_override(QUERY, unit_axis(0));

    let zeroed = agent
        .storage
        .remember(RememberInput {
            content: "zero vector".into(),
            embedding: Some(vec![0.0; EMBEDDING_DIMENSIONS]),
            ..Default::default()
        })
        .unwrap();
    pinned_memory(&agent, "normal", 0.9, 0.5, 0.5);

    let results = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 10,
            include_partial: true,
            ..Default::default()
        })
        .unwrap();
    assert!(results.iter().all(|r| r.memory.id != zeroed));

    // Still reachable by exact id
    assert!(agent.storage.get_memory(&zeroed).unwrap().is_some());
}

#[test]
fn limit_zero_returns_empty_without_embedding() {
    let agent = open_agent();
    // No override for the query: a provider call would hash-embed it, but
    // limit 0 must not even reach the provider
    let results = agent
        .storage
        .recall(&RecallInput {
            query: "never embedded".into(),
            limit: 0,
            ..Default::default()
        })
        .unwrap();
    assert!(results.is_empty());
}

#[test]
fn partial_results_are_flagged_or_suppressed() {
    let agent = open_agent();
    agent.embedder.set_override(QUERY, unit_axis(0));
    agent
        .storage
        .set_config("memory.partial_threshold", &json!(1.5))
        .unwrap();

    pinned_memory(&agent, "strong hit", 0.95, 0.9, 0.9);
    let weak = pinned_memory(&agent, "weak hit", 0.05, 0.05, 0.05);

    let suppressed = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert!(suppressed.iter().all(|r| r.memory.id != weak));

    let included = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 10,
            include_partial: true,
            ..Default::default()
        })
        .unwrap();
    let weak_hit = included.iter().find(|r| r.memory.id == weak).unwrap();
    assert!(weak_hit.partial);
    let strong_hit = &included[0];
    assert!(!strong_hit.partial);
}

#[test]
fn kind_filter_and_min_importance() {
    let agent = open_agent();
    agent.embedder.set_override(QUERY, unit_axis(0));

    pinned_memory(&agent, "low importance", 0.9, 0.1, 0.5);
    let important = pinned_memory(&agent, "high importance", 0.9, 0.9, 0.5);

    let results = agent
        .storage
        .recall(&RecallInput {
            query: QUERY.into(),
            limit: 10,
            min_importance: 0.5,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].memory.id, important);
}
