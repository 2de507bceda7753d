//! Trust & Provenance
//!
//! Semantic memories earn trust from three signals: a confidence prior, a
//! reinforcement score over deduplicated source references, and alignment
//! with the worldview (SUPPORTS/CONTRADICTS edges to worldview memories).
//! `sync_memory_trust` recomputes and persists; a dirty flag set on source
//! edits lets maintenance resync only what changed.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::graph::{find_node_tx, NodeKind};
use crate::memory::store::get_memory_tx;
use crate::memory::{MemoryKind, SourceRef};
use crate::storage::{CoreError, Result, Storage};

/// Diminishing weight for the k-th source: `trust / (1 + PENALTY * k)`
const SOURCE_PENALTY: f64 = 0.5;

/// Blend weights of the trust signals
const W_CONFIDENCE: f64 = 0.4;
const W_REINFORCEMENT: f64 = 0.4;
const W_ALIGNMENT: f64 = 0.2;

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Normalize one raw source reference. Returns `None` for anything without a
/// usable `ref`. Trust is clamped to [0, 1]; `observed_at` defaults to now.
pub fn normalize_source_reference(raw: &Value) -> Option<SourceRef> {
    let obj = raw.as_object()?;
    let reference = obj.get("ref").and_then(Value::as_str)?.trim().to_string();
    if reference.is_empty() {
        return None;
    }
    let observed_at = obj
        .get("observed_at")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));
    Some(SourceRef {
        kind: obj
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        reference,
        label: obj.get("label").and_then(Value::as_str).map(str::to_string),
        author: obj.get("author").and_then(Value::as_str).map(str::to_string),
        observed_at,
        trust: obj
            .get("trust")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        content_hash: obj
            .get("content_hash")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Normalize a raw reference list (array, single object, or absent).
/// Idempotent: normalizing an already-normalized list is a no-op.
pub fn normalize_source_references(raw: Option<&Value>) -> Vec<SourceRef> {
    match raw {
        None => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter_map(normalize_source_reference).collect(),
        Some(v) => normalize_source_reference(v).into_iter().collect(),
    }
}

/// Deduplicate by `ref`, keeping the latest `observed_at` per reference.
/// Output is ordered by reference for determinism.
pub fn dedupe_source_references(refs: &[SourceRef]) -> Vec<SourceRef> {
    let mut best: std::collections::BTreeMap<String, SourceRef> = std::collections::BTreeMap::new();
    for r in refs {
        match best.get(&r.reference) {
            Some(existing) if existing.observed_at >= r.observed_at => {}
            _ => {
                best.insert(r.reference.clone(), r.clone());
            }
        }
    }
    best.into_values().collect()
}

/// The source a memory should attribute itself to: highest trust, then most
/// recently observed.
pub fn best_source(refs: &[SourceRef]) -> Option<&SourceRef> {
    refs.iter().max_by(|a, b| {
        a.trust
            .partial_cmp(&b.trust)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.observed_at.cmp(&b.observed_at))
    })
}

// ============================================================================
// SCORING
// ============================================================================

/// Monotonic reinforcement over deduplicated sources. The k-th strongest
/// source contributes `trust / (1 + PENALTY * k)`; the sum is capped at 1.
pub fn source_reinforcement_score(refs: &[SourceRef]) -> f64 {
    let deduped = dedupe_source_references(refs);
    let mut trusts: Vec<f64> = deduped.iter().map(|r| r.trust).collect();
    trusts.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let sum: f64 = trusts
        .iter()
        .enumerate()
        .map(|(k, t)| t / (1.0 + SOURCE_PENALTY * k as f64))
        .sum();
    sum.min(1.0)
}

/// Combined semantic trust: confidence prior, source reinforcement, and
/// worldview alignment in [-1, 1] mapped onto [0, 1]. Clamped to [0, 1].
pub fn compute_semantic_trust(confidence: f64, refs: &[SourceRef], alignment: f64) -> f64 {
    let confidence = confidence.clamp(0.0, 1.0);
    let alignment = alignment.clamp(-1.0, 1.0);
    let reinforcement = source_reinforcement_score(refs);
    (W_CONFIDENCE * confidence
        + W_REINFORCEMENT * reinforcement
        + W_ALIGNMENT * (0.5 + 0.5 * alignment))
        .clamp(0.0, 1.0)
}

// ============================================================================
// GRAPH-DERIVED SIGNALS
// ============================================================================

/// Alignment of a memory with the worldview: outbound SUPPORTS edges to
/// worldview memories pull toward +1, CONTRADICTS toward -1, each weighted by
/// edge strength and the worldview memory's confidence.
pub(crate) fn compute_worldview_alignment_tx(conn: &Connection, memory_id: &str) -> Result<f64> {
    let Some(node) = find_node_tx(conn, NodeKind::Memory, memory_id)? else {
        return Ok(0.0);
    };
    let mut stmt = conn.prepare(
        "SELECT e.kind, e.strength, m.metadata FROM graph_edges e
         JOIN graph_nodes n ON n.id = e.dst
         JOIN memories m ON m.id = n.key
         WHERE e.src = ?1 AND e.kind IN ('SUPPORTS', 'CONTRADICTS')
           AND n.kind = 'memory' AND m.kind = 'worldview'",
    )?;
    let rows = stmt.query_map(params![node], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut total = 0.0f64;
    let mut weight = 0.0f64;
    for row in rows {
        let (kind, strength, metadata_raw) = row?;
        let confidence = serde_json::from_str::<Value>(&metadata_raw)
            .ok()
            .and_then(|m| m.get("confidence").and_then(Value::as_f64))
            .unwrap_or(0.5);
        let sign = if kind == "SUPPORTS" { 1.0 } else { -1.0 };
        total += sign * strength * confidence;
        weight += strength;
    }
    if weight == 0.0 {
        return Ok(0.0);
    }
    Ok((total / weight).clamp(-1.0, 1.0))
}

// ============================================================================
// SYNC
// ============================================================================

pub(crate) fn sync_memory_trust_tx(conn: &Connection, memory_id: &str) -> Result<()> {
    let memory = get_memory_tx(conn, memory_id)?
        .ok_or_else(|| CoreError::NotFound(format!("memory {memory_id}")))?;
    if memory.kind != MemoryKind::Semantic {
        // Only semantic memories derive trust from sources; just clear the flag.
        conn.execute(
            "UPDATE memories SET trust_dirty = 0 WHERE id = ?1",
            params![memory_id],
        )?;
        return Ok(());
    }

    let refs = dedupe_source_references(&normalize_source_references(
        memory.metadata.get("source_references"),
    ));
    let confidence = memory
        .metadata
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5);
    let alignment = compute_worldview_alignment_tx(conn, memory_id)?;
    let trust = compute_semantic_trust(confidence, &refs, alignment);

    let mut metadata = memory.metadata;
    metadata["source_references"] = serde_json::to_value(&refs)?;
    let attribution = match best_source(&refs) {
        Some(best) => serde_json::to_value(best)?,
        None => memory.source_attribution,
    };

    conn.execute(
        "UPDATE memories SET
            trust_level = ?1,
            source_attribution = ?2,
            metadata = ?3,
            trust_dirty = 0,
            updated_at = ?4
         WHERE id = ?5",
        params![
            trust,
            serde_json::to_string(&attribution)?,
            serde_json::to_string(&metadata)?,
            Utc::now(),
            memory_id
        ],
    )?;
    Ok(())
}

/// Nudge a worldview memory's confidence toward its evidence. Inbound
/// SUPPORTS push up, CONTRADICTS push down, each weighted by edge strength
/// and evidence trust; stability dampens the step.
pub(crate) fn update_worldview_confidence_tx(conn: &Connection, worldview_id: &str) -> Result<()> {
    let memory = get_memory_tx(conn, worldview_id)?
        .ok_or_else(|| CoreError::NotFound(format!("memory {worldview_id}")))?;
    if memory.kind != MemoryKind::Worldview {
        return Err(CoreError::InvalidInput(format!(
            "memory {worldview_id} is {}, not worldview",
            memory.kind
        )));
    }
    let Some(node) = find_node_tx(conn, NodeKind::Memory, worldview_id)? else {
        return Ok(());
    };

    let mut stmt = conn.prepare(
        "SELECT e.kind, e.strength, m.trust_level FROM graph_edges e
         JOIN graph_nodes n ON n.id = e.src
         JOIN memories m ON m.id = n.key
         WHERE e.dst = ?1 AND e.kind IN ('SUPPORTS', 'CONTRADICTS') AND n.kind = 'memory'",
    )?;
    let rows = stmt.query_map(params![node], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
        ))
    })?;

    let mut total = 0.0f64;
    let mut weight = 0.0f64;
    for row in rows {
        let (kind, strength, trust) = row?;
        let sign = if kind == "SUPPORTS" { 1.0 } else { -1.0 };
        total += sign * strength * trust;
        weight += strength;
    }
    if weight == 0.0 {
        return Ok(());
    }

    let evidence = (total / weight).clamp(-1.0, 1.0);
    let target = 0.5 + 0.5 * evidence;
    let confidence = memory
        .metadata
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5);
    let stability = memory
        .metadata
        .get("stability")
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    let step = 0.3 * (1.0 - stability);
    let updated = (confidence + step * (target - confidence)).clamp(0.0, 1.0);

    let mut metadata = memory.metadata;
    metadata["confidence"] = serde_json::json!(updated);
    conn.execute(
        "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&metadata)?, Utc::now(), worldview_id],
    )?;
    Ok(())
}

// ============================================================================
// STORAGE SURFACE
// ============================================================================

/// Compact provenance readout
#[derive(Debug, Clone, serde::Serialize)]
pub struct TruthProfile {
    /// Memory kind
    pub kind: String,
    /// Persisted trust level
    pub trust_level: f64,
    /// Deduplicated source count
    pub source_count: usize,
    /// Worldview alignment in [-1, 1]
    pub alignment: f64,
    /// Confidence prior from metadata
    pub confidence: f64,
}

impl Storage {
    /// Recompute and persist a memory's trust and attribution. Idempotent
    /// while sources are unchanged.
    pub fn sync_memory_trust(&self, memory_id: &str) -> Result<()> {
        self.with_tx(|tx| sync_memory_trust_tx(tx, memory_id))
    }

    /// Replace a semantic memory's source references. Normalizes the input
    /// and marks the row for trust resync (also performed immediately).
    pub fn update_source_references(&self, memory_id: &str, raw: &Value) -> Result<()> {
        self.with_tx(|tx| {
            let memory = get_memory_tx(tx, memory_id)?
                .ok_or_else(|| CoreError::NotFound(format!("memory {memory_id}")))?;
            let refs = normalize_source_references(Some(raw));
            let mut metadata = memory.metadata;
            metadata["source_references"] = serde_json::to_value(&refs)?;
            tx.execute(
                "UPDATE memories SET metadata = ?1, trust_dirty = 1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&metadata)?, Utc::now(), memory_id],
            )?;
            sync_memory_trust_tx(tx, memory_id)
        })
    }

    /// Worldview alignment for a memory
    pub fn compute_worldview_alignment(&self, memory_id: &str) -> Result<f64> {
        self.with_reader(|conn| compute_worldview_alignment_tx(conn, memory_id))
    }

    /// Update a worldview memory's confidence from its influence edges
    pub fn update_worldview_confidence_from_influences(&self, worldview_id: &str) -> Result<()> {
        self.with_tx(|tx| update_worldview_confidence_tx(tx, worldview_id))
    }

    /// Compact provenance readout for one memory
    pub fn get_memory_truth_profile(&self, memory_id: &str) -> Result<TruthProfile> {
        self.with_reader(|conn| {
            let memory = get_memory_tx(conn, memory_id)?
                .ok_or_else(|| CoreError::NotFound(format!("memory {memory_id}")))?;
            let refs = dedupe_source_references(&normalize_source_references(
                memory.metadata.get("source_references"),
            ));
            Ok(TruthProfile {
                kind: memory.kind.to_string(),
                trust_level: memory.trust_level,
                source_count: refs.len(),
                alignment: compute_worldview_alignment_tx(conn, memory_id)?,
                confidence: memory
                    .metadata
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.5),
            })
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;
    use crate::memory::{SemanticInput, WorldviewInput};
    use crate::test_support::open_test_storage;
    use serde_json::json;

    #[test]
    fn test_normalize_clamps_trust_and_defaults_observed_at() {
        let normalized =
            normalize_source_reference(&json!({"kind": "web", "ref": "http://example.com", "trust": 1.5}))
                .unwrap();
        assert_eq!(normalized.trust, 1.0);
        assert_eq!(normalized.kind, "web");

        assert!(normalize_source_reference(&json!([])).is_none());
        assert!(normalize_source_reference(&json!({"kind": "web"})).is_none());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = json!([
            {"kind": "paper", "ref": "doi:1", "trust": 0.7},
            {"kind": "web", "ref": "https://a", "trust": 2.0},
        ]);
        let once = normalize_source_references(Some(&raw));
        let once_value = serde_json::to_value(&once).unwrap();
        let twice = normalize_source_references(Some(&once_value));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_dedupe_keeps_latest_observed() {
        let raw = json!([
            {"kind": "paper", "ref": "doi:1", "observed_at": "2020-01-01T00:00:00Z", "trust": 0.7},
            {"kind": "paper", "ref": "doi:1", "observed_at": "2021-01-01T00:00:00Z", "trust": 0.9},
        ]);
        let normalized = normalize_source_references(Some(&raw));
        assert_eq!(normalized.len(), 2);
        let deduped = dedupe_source_references(&normalized);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].trust, 0.9);
        assert!(deduped[0].observed_at.to_rfc3339().starts_with("2021-01-01"));
    }

    #[test]
    fn test_reinforcement_is_monotonic_and_bounded() {
        assert_eq!(source_reinforcement_score(&[]), 0.0);
        let one = normalize_source_references(Some(&json!([
            {"kind": "web", "ref": "a", "trust": 0.6}
        ])));
        let two = normalize_source_references(Some(&json!([
            {"kind": "web", "ref": "a", "trust": 0.6},
            {"kind": "web", "ref": "b", "trust": 0.6}
        ])));
        let s1 = source_reinforcement_score(&one);
        let s2 = source_reinforcement_score(&two);
        assert!(s1 > 0.0);
        assert!(s2 > s1);
        assert!(s2 <= 1.0);
    }

    #[test]
    fn test_semantic_trust_respects_alignment() {
        let refs = normalize_source_references(Some(&json!([
            {"kind": "web", "ref": "a", "trust": 0.9},
            {"kind": "web", "ref": "b", "trust": 0.9}
        ])));
        let aligned = compute_semantic_trust(0.9, &refs, 0.5);
        let opposed = compute_semantic_trust(0.9, &refs, -0.5);
        assert!(aligned > opposed);
        assert!(aligned <= 1.0);
        assert!(opposed >= 0.0);
    }

    #[test]
    fn test_sync_memory_trust_is_idempotent() {
        let (storage, _dir) = open_test_storage();
        let id = storage
            .create_semantic_memory(SemanticInput {
                content: "Trust sync target".into(),
                confidence: 0.9,
                importance: 0.5,
                source_references: json!([
                    {"kind": "web", "ref": "https://example.com/a", "trust": 1.0},
                    {"kind": "paper", "ref": "doi:10.1/test", "trust": 0.8},
                ]),
                ..Default::default()
            })
            .unwrap();

        storage.sync_memory_trust(&id).unwrap();
        let first = storage.get_memory(&id).unwrap().unwrap().trust_level;
        storage.sync_memory_trust(&id).unwrap();
        let second = storage.get_memory(&id).unwrap().unwrap().trust_level;
        assert_eq!(first, second);

        let profile = storage.get_memory_truth_profile(&id).unwrap();
        assert_eq!(profile.source_count, 2);
        assert_eq!(profile.kind, "semantic");
    }

    #[test]
    fn test_worldview_support_raises_trust() {
        let (storage, _dir) = open_test_storage();
        let memory_id = storage
            .create_semantic_memory(SemanticInput {
                content: "Claim with worldview backing".into(),
                confidence: 0.9,
                importance: 0.5,
                source_references: json!([{"kind": "web", "ref": "https://example.com", "trust": 1.0}]),
                ..Default::default()
            })
            .unwrap();
        storage.sync_memory_trust(&memory_id).unwrap();
        let baseline = storage.get_memory(&memory_id).unwrap().unwrap().trust_level;

        let worldview_id = storage
            .create_worldview_memory(WorldviewInput {
                content: "evidence matters".into(),
                confidence: 0.8,
                ..Default::default()
            })
            .unwrap();
        storage
            .create_memory_relationship(&memory_id, &worldview_id, EdgeKind::Supports, 1.0, None)
            .unwrap();
        storage.sync_memory_trust(&memory_id).unwrap();
        let supported = storage.get_memory(&memory_id).unwrap().unwrap().trust_level;
        assert!(supported >= baseline);
    }

    #[test]
    fn test_update_source_references_triggers_resync() {
        let (storage, _dir) = open_test_storage();
        let id = storage
            .create_semantic_memory(SemanticInput {
                content: "resync target".into(),
                confidence: 0.9,
                importance: 0.5,
                source_references: json!([{"kind": "web", "ref": "a", "trust": 0.2}]),
                ..Default::default()
            })
            .unwrap();
        let before = storage.get_memory(&id).unwrap().unwrap();

        storage
            .update_source_references(
                &id,
                &json!([
                    {"kind": "paper", "ref": "b", "trust": 0.95},
                    {"kind": "paper", "ref": "c", "trust": 0.9}
                ]),
            )
            .unwrap();
        let after = storage.get_memory(&id).unwrap().unwrap();
        assert!(after.trust_level > before.trust_level);
        assert_eq!(after.source_attribution["ref"], json!("b"));
    }

    #[test]
    fn test_worldview_confidence_moves_toward_evidence() {
        let (storage, _dir) = open_test_storage();
        let worldview_id = storage
            .create_worldview_memory(WorldviewInput {
                content: "people are mostly kind".into(),
                confidence: 0.4,
                stability: 0.2,
                ..Default::default()
            })
            .unwrap();
        let evidence = storage
            .create_semantic_memory(SemanticInput {
                content: "a stranger helped today".into(),
                confidence: 0.9,
                importance: 0.5,
                source_references: json!([{"kind": "agent", "ref": "obs:1", "trust": 1.0}]),
                ..Default::default()
            })
            .unwrap();
        storage
            .create_memory_relationship(&evidence, &worldview_id, EdgeKind::Supports, 1.0, None)
            .unwrap();

        storage
            .update_worldview_confidence_from_influences(&worldview_id)
            .unwrap();
        let after = storage.get_memory(&worldview_id).unwrap().unwrap();
        let confidence = after.metadata["confidence"].as_f64().unwrap();
        assert!(confidence > 0.4);
    }
}
