//! Trust accounting and belief transformation driven end to end: idempotence
//! laws, source-edit resync, worldview influence, and the full exploration ->
//! readiness -> transformation arc.

use anima_e2e_tests::{initialized_agent, open_agent};
use anima_core::{
    dedupe_source_references, normalize_source_references, ChangeRequires, EdgeKind,
    SemanticInput, TransformationEffort, WorldviewInput,
};
use serde_json::json;

#[test]
fn normalize_is_idempotent_and_dedupes_by_latest() {
    let raw = json!([
        {"kind": "paper", "ref": "doi:1", "observed_at": "2020-01-01T00:00:00Z", "trust": 0.7},
        {"kind": "paper", "ref": "doi:1", "observed_at": "2021-01-01T00:00:00Z", "trust": 1.4},
        {"kind": "web", "ref": "https://a"},
        {"not_a_ref": true},
    ]);
    let once = normalize_source_references(Some(&raw));
    assert_eq!(once.len(), 3, "entries without a ref are dropped");
    assert!(once.iter().all(|r| (0.0..=1.0).contains(&r.trust)));

    let twice = normalize_source_references(Some(&serde_json::to_value(&once).unwrap()));
    assert_eq!(once, twice);

    let deduped = dedupe_source_references(&once);
    assert_eq!(deduped.len(), 2);
    let doi = deduped.iter().find(|r| r.reference == "doi:1").unwrap();
    assert!(doi.observed_at.to_rfc3339().starts_with("2021"));
    assert_eq!(doi.trust, 1.0);
}

#[test]
fn trust_sync_is_idempotent_and_tracks_source_edits() {
    let agent = open_agent();
    let storage = &agent.storage;

    let id = storage
        .create_semantic_memory(SemanticInput {
            content: "tides follow the moon".into(),
            confidence: 0.8,
            importance: 0.6,
            source_references: json!([
                {"kind": "web", "ref": "https://a", "trust": 0.4}
            ]),
            ..Default::default()
        })
        .unwrap();

    storage.sync_memory_trust(&id).unwrap();
    let first = storage.get_memory(&id).unwrap().unwrap().trust_level;
    storage.sync_memory_trust(&id).unwrap();
    let second = storage.get_memory(&id).unwrap().unwrap().trust_level;
    assert_eq!(first, second, "repeated sync without source changes is a no-op");

    storage
        .update_source_references(
            &id,
            &json!([
                {"kind": "paper", "ref": "doi:strong", "trust": 1.0},
                {"kind": "paper", "ref": "doi:second", "trust": 0.9},
            ]),
        )
        .unwrap();
    let after = storage.get_memory(&id).unwrap().unwrap();
    assert!(after.trust_level > first);
    assert_eq!(after.source_attribution["ref"], json!("doi:strong"));

    let profile = storage.get_memory_truth_profile(&id).unwrap();
    assert_eq!(profile.source_count, 2);
    assert!(profile.trust_level > 0.0 && profile.trust_level <= 1.0);
}

#[test]
fn worldview_support_feeds_trust_and_confidence() {
    let agent = open_agent();
    let storage = &agent.storage;

    let claim = storage
        .create_semantic_memory(SemanticInput {
            content: "kindness compounds".into(),
            confidence: 0.8,
            importance: 0.6,
            source_references: json!([{"kind": "agent", "ref": "obs:1", "trust": 0.9}]),
            ..Default::default()
        })
        .unwrap();
    storage.sync_memory_trust(&claim).unwrap();
    let baseline = storage.get_memory(&claim).unwrap().unwrap().trust_level;

    let belief = storage
        .create_worldview_memory(WorldviewInput {
            content: "people respond to care".into(),
            confidence: 0.4,
            stability: 0.2,
            ..Default::default()
        })
        .unwrap();
    storage
        .create_memory_relationship(&claim, &belief, EdgeKind::Supports, 1.0, None)
        .unwrap();

    // Alignment lifts the claim's trust
    storage.sync_memory_trust(&claim).unwrap();
    let aligned = storage.get_memory(&claim).unwrap().unwrap().trust_level;
    assert!(aligned >= baseline);
    assert!(storage.compute_worldview_alignment(&claim).unwrap() > 0.0);

    // Evidence lifts the belief's confidence
    storage
        .update_worldview_confidence_from_influences(&belief)
        .unwrap();
    let confidence = storage.get_memory(&belief).unwrap().unwrap().metadata["confidence"]
        .as_f64()
        .unwrap();
    assert!(confidence > 0.4);
}

#[test]
fn belief_transformation_arc() {
    let agent = initialized_agent("consent");
    let storage = &agent.storage;
    storage
        .set_config(
            "transformation.self_worth",
            &json!({
                "min_reflections": 2,
                "min_heartbeats": 0,
                "evidence_threshold": 0.3,
                "max_change_per_attempt": 0.15,
            }),
        )
        .unwrap();

    let belief = storage
        .create_worldview_memory(WorldviewInput {
            content: "my conclusions are only as good as my sources".into(),
            subcategory: Some("self_worth".into()),
            confidence: 0.8,
            stability: 0.5,
            change_requires: ChangeRequires::DeliberateTransformation,
            ..Default::default()
        })
        .unwrap();

    // A belief gated on evidence alone cannot enter deliberate exploration
    let evidence_gated = storage
        .create_worldview_memory(WorldviewInput {
            content: "water is wet".into(),
            ..Default::default()
        })
        .unwrap();
    assert!(storage.begin_belief_exploration(&evidence_gated, None).is_err());

    storage.begin_belief_exploration(&belief, None).unwrap();
    assert!(storage.check_transformation_readiness().unwrap().is_empty());

    for i in 0..2 {
        let evidence = storage
            .create_semantic_memory(SemanticInput {
                content: format!("counterexample {i}"),
                confidence: 0.9,
                importance: 0.5,
                source_references: json!([
                    {"kind": "agent", "ref": format!("obs:{i}"), "trust": 0.9}
                ]),
                ..Default::default()
            })
            .unwrap();
        storage
            .record_transformation_effort(
                &belief,
                TransformationEffort::Reflect,
                None,
                Some(&evidence),
            )
            .unwrap();
    }

    let ready = storage.check_transformation_readiness().unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].belief_id, belief);
    assert!(ready[0].ready);

    storage
        .attempt_worldview_transformation(
            &belief,
            "good conclusions also need good reasoning",
            "refined",
            Some(0.2),
        )
        .unwrap();
    let after = storage.get_memory(&belief).unwrap().unwrap();
    assert_eq!(after.content, "good conclusions also need good reasoning");
    // Requested 0.2 from 0.8 is clamped to a 0.15 step
    let confidence = after.metadata["confidence"].as_f64().unwrap();
    assert!((confidence - 0.65).abs() < 1e-9);
    assert_eq!(after.metadata["origin"], json!("transformed"));

    // The exploration state reset; a second attempt requires a fresh arc
    assert!(storage.check_transformation_readiness().unwrap().is_empty());
    assert!(storage
        .attempt_worldview_transformation(&belief, "again", "refined", None)
        .is_err());
}

#[test]
fn ingestion_receipts_are_idempotent() {
    let agent = open_agent();
    let storage = &agent.storage;

    let memory = storage
        .remember(anima_core::RememberInput {
            content: "ingested chunk".into(),
            ..Default::default()
        })
        .unwrap();
    let receipts = vec![anima_core::IngestionReceipt {
        source_file: "corpus.md".into(),
        chunk_index: 0,
        content_hash: anima_core::content_hash("ingested chunk"),
        memory_id: memory,
    }];
    assert_eq!(storage.record_ingestion_receipts(&receipts).unwrap(), 1);
    assert_eq!(storage.record_ingestion_receipts(&receipts).unwrap(), 0);
}
