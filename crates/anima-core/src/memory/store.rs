//! Memory store operations: remember, recall, touch, lifecycle.
//!
//! Write discipline: table row first, then graph node, then edges; deletion
//! runs in reverse. Embeddings are always obtained before a transaction is
//! opened (the provider crosses the process boundary).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config;
use crate::embeddings::{cosine_similarity, Embedding, EMBEDDING_DIMENSIONS};
use crate::emotion;
use crate::graph::{self, EdgeKind, NodeKind};
use crate::memory::transformation::{normalize_transformation_state, ChangeRequires};
use crate::memory::trust;
use crate::memory::{recency_boost, relevance, Memory, MemoryKind, MemoryStatus};
use crate::storage::{CoreError, Result, Storage};

pub(crate) const MEMORY_COLUMNS: &str = "id, kind, content, embedding, importance, decay_rate, \
     access_count, status, trust_level, source_attribution, metadata, activation_boost, \
     created_at, updated_at, last_accessed";

// ============================================================================
// INPUT / OUTPUT TYPES
// ============================================================================

/// Input for creating a new memory
#[derive(Debug, Clone)]
pub struct RememberInput {
    /// Natural-language content
    pub content: String,
    /// Memory kind
    pub kind: MemoryKind,
    /// Importance, non-negative
    pub importance: f64,
    /// Decay rate, non-negative
    pub decay_rate: f64,
    /// Pre-computed embedding; obtained from the provider when `None`
    pub embedding: Option<Vec<f32>>,
    /// Initial trust in [0, 1]
    pub trust_level: f64,
    /// Source descriptor
    pub source_attribution: Option<Value>,
    /// Kind-specific metadata
    pub metadata: Value,
    /// Concept names to link via INSTANCE_OF, with edge strength
    pub concepts: Vec<(String, f64)>,
    /// Accept the memory with a null embedding if the provider fails;
    /// maintenance will populate it on a later touch
    pub allow_deferred_embedding: bool,
}

impl Default for RememberInput {
    fn default() -> Self {
        Self {
            content: String::new(),
            kind: MemoryKind::Episodic,
            importance: 0.5,
            decay_rate: 0.01,
            embedding: None,
            trust_level: 0.5,
            source_attribution: None,
            metadata: json!({}),
            concepts: Vec::new(),
            allow_deferred_embedding: false,
        }
    }
}

/// Input for recalling memories
#[derive(Debug, Clone)]
pub struct RecallInput {
    /// Search query
    pub query: String,
    /// Maximum results
    pub limit: usize,
    /// Restrict to these kinds; `None` = all
    pub kinds: Option<Vec<MemoryKind>>,
    /// Minimum importance filter
    pub min_importance: f64,
    /// Return below-threshold entries flagged `partial` instead of dropping them
    pub include_partial: bool,
}

impl Default for RecallInput {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: 10,
            kinds: None,
            min_importance: 0.0,
            include_partial: false,
        }
    }
}

/// One ranked recall result
#[derive(Debug, Clone)]
pub struct RecalledMemory {
    /// The memory
    pub memory: Memory,
    /// Cosine similarity to the query
    pub similarity: f32,
    /// Combined score used for ordering
    pub score: f64,
    /// Below the recall threshold (only produced with `include_partial`)
    pub partial: bool,
}

/// Input for an episodic memory
#[derive(Debug, Clone, Default)]
pub struct EpisodicInput {
    /// What happened
    pub content: String,
    /// Importance
    pub importance: f64,
    /// Action that produced the event, if any
    pub action_taken: Option<String>,
    /// Free-form context
    pub context: Value,
    /// Outcome description
    pub result: Option<String>,
    /// Valence of the event in [-1, 1]
    pub emotional_valence: f64,
    /// When the event happened (defaults to now)
    pub event_time: Option<DateTime<Utc>>,
}

/// Input for a semantic memory
#[derive(Debug, Clone, Default)]
pub struct SemanticInput {
    /// The fact or claim
    pub content: String,
    /// Confidence prior in [0, 1]
    pub confidence: f64,
    /// Importance
    pub importance: f64,
    /// Topic categories
    pub category: Vec<String>,
    /// Concepts to link via INSTANCE_OF
    pub related_concepts: Vec<String>,
    /// Raw source references; normalized and deduplicated on insert
    pub source_references: Value,
}

/// Input for a worldview memory
#[derive(Debug, Clone)]
pub struct WorldviewInput {
    /// The belief statement
    pub content: String,
    /// Category: 'belief', 'value', 'identity', 'personality', 'relationship'
    pub category: String,
    /// Finer classification used for transformation config lookup
    pub subcategory: Option<String>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Resistance to change in [0, 1]
    pub stability: f64,
    /// Importance
    pub importance: f64,
    /// Where the belief came from: 'seeded', 'discovered', 'transformed'
    pub origin: String,
    /// Optional structured value payload
    pub value: Option<Value>,
    /// Gate on how the belief may change
    pub change_requires: ChangeRequires,
}

impl Default for WorldviewInput {
    fn default() -> Self {
        Self {
            content: String::new(),
            category: "belief".to_string(),
            subcategory: None,
            confidence: 0.5,
            stability: 0.5,
            importance: 0.7,
            origin: "discovered".to_string(),
            value: None,
            change_requires: ChangeRequires::Evidence,
        }
    }
}

/// Procedural search hit with its observed success rate
#[derive(Debug, Clone)]
pub struct ProceduralMatch {
    /// The memory
    pub memory: Memory,
    /// Cosine similarity to the query
    pub similarity: f32,
    /// `success_count / total_attempts`, or `None` before any attempt
    pub success_rate: Option<f64>,
}

/// Strategic search hit
#[derive(Debug, Clone)]
pub struct StrategicMatch {
    /// The memory
    pub memory: Memory,
    /// Cosine similarity to the query
    pub similarity: f32,
    /// The recognized pattern
    pub pattern_description: String,
    /// Confidence in the pattern
    pub confidence_score: f64,
}

// ============================================================================
// ROW HYDRATION
// ============================================================================

pub(crate) fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let kind_raw: String = row.get(1)?;
    let status_raw: String = row.get(7)?;
    let source_raw: String = row.get(9)?;
    let metadata_raw: String = row.get(10)?;
    let embedding_bytes: Option<Vec<u8>> = row.get(3)?;

    Ok(Memory {
        id: row.get(0)?,
        kind: MemoryKind::parse_name(&kind_raw).unwrap_or_default(),
        content: row.get(2)?,
        embedding: embedding_bytes.and_then(|b| Embedding::from_bytes(&b).map(|e| e.vector)),
        importance: row.get(4)?,
        decay_rate: row.get(5)?,
        access_count: row.get(6)?,
        status: MemoryStatus::parse_name(&status_raw).unwrap_or_default(),
        trust_level: row.get(8)?,
        source_attribution: serde_json::from_str(&source_raw).unwrap_or_else(|_| json!({})),
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_else(|_| json!({})),
        activation_boost: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        last_accessed: row.get(14)?,
    })
}

pub(crate) fn get_memory_tx(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], memory_from_row)
        .optional()?)
}

// ============================================================================
// INSERT
// ============================================================================

pub(crate) fn insert_memory_tx(
    tx: &Transaction<'_>,
    input: &RememberInput,
    embedding: Option<&[f32]>,
    now: DateTime<Utc>,
) -> Result<String> {
    if input.content.trim().is_empty() {
        return Err(CoreError::InvalidInput("memory content is empty".into()));
    }
    if input.importance < 0.0 {
        return Err(CoreError::InvalidInput("importance must be non-negative".into()));
    }
    if input.decay_rate < 0.0 {
        return Err(CoreError::InvalidInput("decay_rate must be non-negative".into()));
    }
    if let Some(vector) = embedding {
        if vector.len() != EMBEDDING_DIMENSIONS {
            return Err(CoreError::Corruption(format!(
                "embedding dimension {} != {}",
                vector.len(),
                EMBEDDING_DIMENSIONS
            )));
        }
    }

    let id = Uuid::new_v4().to_string();
    let mut metadata = input.metadata.clone();
    if !metadata.is_object() {
        metadata = json!({});
    }

    // Stamp the current emotional state into every insertion
    let emotional_context = emotion::current_context_tx(tx)?;
    metadata["emotional_context"] = emotional_context;

    let mut trust_level = input.trust_level.clamp(0.0, 1.0);
    let mut source_attribution = input.source_attribution.clone().unwrap_or_else(|| json!({}));

    match input.kind {
        MemoryKind::Worldview => {
            let state = metadata.get("transformation_state").cloned();
            metadata["transformation_state"] = normalize_transformation_state(state.as_ref());
        }
        MemoryKind::Semantic => {
            let refs = trust::normalize_source_references(metadata.get("source_references"));
            let confidence = metadata
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.5);
            // No graph edges exist yet, so worldview alignment starts neutral
            trust_level = trust::compute_semantic_trust(confidence, &refs, 0.0);
            if let Some(best) = trust::best_source(&refs) {
                source_attribution = serde_json::to_value(best)?;
            }
            metadata["source_references"] = serde_json::to_value(&refs)?;
        }
        _ => {}
    }

    let embedding_bytes = embedding.map(|v| Embedding::new(v.to_vec()).to_bytes());
    tx.execute(
        "INSERT INTO memories (
            id, kind, content, embedding, importance, decay_rate, access_count,
            status, trust_level, source_attribution, metadata,
            created_at, updated_at, last_accessed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'active', ?7, ?8, ?9, ?10, ?10, ?10)",
        params![
            id,
            input.kind.as_str(),
            input.content,
            embedding_bytes,
            input.importance,
            input.decay_rate,
            trust_level,
            serde_json::to_string(&source_attribution)?,
            serde_json::to_string(&metadata)?,
            now,
        ],
    )?;

    // Row first, then node, then edges
    let node = graph::sync_memory_node_tx(tx, &id, input.kind.as_str())?;
    for (concept, strength) in &input.concepts {
        let concept_node = graph::ensure_node_tx(tx, NodeKind::Concept, concept, Some(concept))?;
        graph::upsert_edge_tx(tx, node, concept_node, EdgeKind::InstanceOf, *strength, None)?;
    }

    Ok(id)
}

// ============================================================================
// STORAGE SURFACE
// ============================================================================

impl Storage {
    /// Persist a new memory and synchronize its graph node and concept edges.
    /// Returns the new memory's id.
    pub fn remember(&self, input: RememberInput) -> Result<String> {
        let embedding = match &input.embedding {
            Some(v) => Some(v.clone()),
            None => match self.get_embedding(&input.content) {
                Ok(v) => Some(v),
                Err(e) if input.allow_deferred_embedding => {
                    tracing::warn!("Deferring embedding population: {}", e);
                    None
                }
                Err(e) => return Err(e),
            },
        };
        let now = Utc::now();
        self.with_tx(|tx| insert_memory_tx(tx, &input, embedding.as_deref(), now))
    }

    /// Fetch one memory by id
    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        self.with_reader(|conn| get_memory_tx(conn, id))
    }

    /// Ranked semantic recall over active memories.
    ///
    /// `score = alpha * cosine + beta * decayed_importance + gamma * trust
    ///        + delta * recency + activation_boost`, ties broken by id so the
    /// ordering is a pure function of store state and query embedding.
    /// Memories whose similarity is non-finite (null or zero embeddings) are
    /// never surfaced here; they remain reachable by id.
    pub fn recall(&self, input: &RecallInput) -> Result<Vec<RecalledMemory>> {
        if input.limit == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.get_embedding(&input.query)?;
        self.with_reader(|conn| {
            recall_with_embedding_tx(conn, input, &query_embedding, Utc::now())
        })
    }

    /// Most recent active memories ranked by recency x importance
    pub fn recall_recent(
        &self,
        limit: usize,
        kinds: Option<&[MemoryKind]>,
    ) -> Result<Vec<Memory>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.with_reader(|conn| {
            let now = Utc::now();
            let mut scored: Vec<(f64, Memory)> = Vec::new();
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE status = 'active' \
                 ORDER BY created_at DESC LIMIT 500"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], memory_from_row)?;
            for row in rows {
                let memory = row?;
                if let Some(kinds) = kinds {
                    if !kinds.contains(&memory.kind) {
                        continue;
                    }
                }
                let score = recency_boost(memory.created_at, now) * memory.importance;
                scored.push((score, memory));
            }
            scored.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.id.cmp(&b.1.id))
            });
            Ok(scored.into_iter().take(limit).map(|(_, m)| m).collect())
        })
    }

    /// Touch memories: bump `last_accessed` and `access_count`, nudging
    /// importance upward with diminishing returns.
    pub fn touch_memories(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        self.with_tx(|tx| {
            for id in ids {
                tx.execute(
                    "UPDATE memories SET
                        access_count = access_count + 1,
                        importance = importance + 0.05 / (1.0 + access_count),
                        last_accessed = ?1,
                        updated_at = ?1
                     WHERE id = ?2",
                    params![now, id],
                )?;
            }
            Ok(())
        })
    }

    /// Apply a lifecycle transition, enforcing the status DAG
    pub fn set_memory_status(&self, id: &str, status: MemoryStatus) -> Result<()> {
        self.with_tx(|tx| set_memory_status_tx(tx, id, status))
    }

    /// Delete a memory. Graph edges are detached (node removed, edges
    /// cascade) before the row disappears.
    pub fn delete_memory(&self, id: &str) -> Result<()> {
        self.with_tx(|tx| delete_memory_tx(tx, id))
    }

    /// Create an episodic memory
    pub fn create_episodic_memory(&self, input: EpisodicInput) -> Result<String> {
        let event_time = input.event_time.unwrap_or_else(Utc::now);
        let metadata = json!({
            "action_taken": input.action_taken,
            "context": input.context,
            "result": input.result,
            "emotional_valence": input.emotional_valence.clamp(-1.0, 1.0),
            "event_time": event_time.to_rfc3339(),
        });
        self.remember(RememberInput {
            content: input.content,
            kind: MemoryKind::Episodic,
            importance: input.importance,
            metadata,
            ..Default::default()
        })
    }

    /// Create a semantic memory with normalized sources and computed trust
    pub fn create_semantic_memory(&self, input: SemanticInput) -> Result<String> {
        let metadata = json!({
            "confidence": input.confidence.clamp(0.0, 1.0),
            "source_references": input.source_references,
            "category": input.category,
            "related_concepts": input.related_concepts,
        });
        let concepts = input
            .related_concepts
            .iter()
            .map(|c| (c.clone(), 0.6))
            .collect();
        self.remember(RememberInput {
            content: input.content,
            kind: MemoryKind::Semantic,
            importance: input.importance,
            metadata,
            concepts,
            ..Default::default()
        })
    }

    /// Create a procedural memory with a zeroed attempt ledger
    pub fn create_procedural_memory(
        &self,
        content: &str,
        steps: &[String],
        prerequisites: Value,
        importance: f64,
    ) -> Result<String> {
        let metadata = json!({
            "steps": steps,
            "prerequisites": prerequisites,
            "success_count": 0,
            "total_attempts": 0,
        });
        self.remember(RememberInput {
            content: content.to_string(),
            kind: MemoryKind::Procedural,
            importance,
            decay_rate: 0.001,
            metadata,
            ..Default::default()
        })
    }

    /// Create a strategic memory
    pub fn create_strategic_memory(
        &self,
        content: &str,
        pattern_description: &str,
        supporting_evidence: &[String],
        confidence_score: f64,
        importance: f64,
    ) -> Result<String> {
        let metadata = json!({
            "pattern_description": pattern_description,
            "supporting_evidence": supporting_evidence,
            "confidence_score": confidence_score.clamp(0.0, 1.0),
        });
        self.remember(RememberInput {
            content: content.to_string(),
            kind: MemoryKind::Strategic,
            importance,
            metadata,
            ..Default::default()
        })
    }

    /// Create a worldview memory with a normalized transformation state
    pub fn create_worldview_memory(&self, input: WorldviewInput) -> Result<String> {
        let metadata = json!({
            "category": input.category,
            "subcategory": input.subcategory,
            "origin": input.origin,
            "value": input.value,
            "confidence": input.confidence.clamp(0.0, 1.0),
            "stability": input.stability.clamp(0.0, 1.0),
            "change_requires": input.change_requires.as_str(),
        });
        self.remember(RememberInput {
            content: input.content,
            kind: MemoryKind::Worldview,
            importance: input.importance,
            decay_rate: 0.0,
            metadata,
            ..Default::default()
        })
    }

    /// Record an attempt of a procedure. Keeps `success_count <= total_attempts`.
    pub fn record_procedure_outcome(&self, id: &str, success: bool) -> Result<()> {
        self.with_tx(|tx| {
            let memory = get_memory_tx(tx, id)?
                .ok_or_else(|| CoreError::NotFound(format!("memory {id}")))?;
            if memory.kind != MemoryKind::Procedural {
                return Err(CoreError::InvalidInput(format!(
                    "memory {id} is {}, not procedural",
                    memory.kind
                )));
            }
            let mut metadata = memory.metadata;
            let attempts = metadata
                .get("total_attempts")
                .and_then(Value::as_i64)
                .unwrap_or(0)
                + 1;
            let successes = metadata
                .get("success_count")
                .and_then(Value::as_i64)
                .unwrap_or(0)
                + i64::from(success);
            metadata["total_attempts"] = json!(attempts);
            metadata["success_count"] = json!(successes.min(attempts));
            tx.execute(
                "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&metadata)?, Utc::now(), id],
            )?;
            Ok(())
        })
    }

    /// Procedural recall reporting the observed success rate of each hit
    pub fn search_procedural_memories(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ProceduralMatch>> {
        let results = self.recall(&RecallInput {
            query: query.to_string(),
            limit,
            kinds: Some(vec![MemoryKind::Procedural]),
            ..Default::default()
        })?;
        Ok(results
            .into_iter()
            .map(|r| {
                let attempts = r
                    .memory
                    .metadata
                    .get("total_attempts")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let successes = r
                    .memory
                    .metadata
                    .get("success_count")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let success_rate = if attempts > 0 {
                    Some(successes as f64 / attempts as f64)
                } else {
                    None
                };
                ProceduralMatch {
                    memory: r.memory,
                    similarity: r.similarity,
                    success_rate,
                }
            })
            .collect())
    }

    /// Strategic recall surfacing the recognized pattern
    pub fn search_strategic_memories(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<StrategicMatch>> {
        let results = self.recall(&RecallInput {
            query: query.to_string(),
            limit,
            kinds: Some(vec![MemoryKind::Strategic]),
            ..Default::default()
        })?;
        Ok(results
            .into_iter()
            .map(|r| {
                let pattern_description = r
                    .memory
                    .metadata
                    .get("pattern_description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let confidence_score = r
                    .memory
                    .metadata
                    .get("confidence_score")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                StrategicMatch {
                    memory: r.memory,
                    similarity: r.similarity,
                    pattern_description,
                    confidence_score,
                }
            })
            .collect())
    }
}

pub(crate) fn set_memory_status_tx(
    tx: &Transaction<'_>,
    id: &str,
    status: MemoryStatus,
) -> Result<()> {
    let current: Option<String> = tx
        .query_row(
            "SELECT status FROM memories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let current = current.ok_or_else(|| CoreError::NotFound(format!("memory {id}")))?;
    let current = MemoryStatus::parse_name(&current)
        .ok_or_else(|| CoreError::Corruption(format!("memory {id} has status {current:?}")))?;
    if current == status {
        return Ok(());
    }
    if !current.can_transition_to(status) {
        return Err(CoreError::StateViolation(format!(
            "illegal status transition {current} -> {status} for memory {id}"
        )));
    }
    tx.execute(
        "UPDATE memories SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), Utc::now(), id],
    )?;
    Ok(())
}

pub(crate) fn delete_memory_tx(tx: &Transaction<'_>, id: &str) -> Result<()> {
    graph::detach_memory_node_tx(tx, id)?;
    tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
    Ok(())
}

pub(crate) fn recall_with_embedding_tx(
    conn: &Connection,
    input: &RecallInput,
    query_embedding: &[f32],
    now: DateTime<Utc>,
) -> Result<Vec<RecalledMemory>> {
    if input.limit == 0 {
        return Ok(Vec::new());
    }
    let weights = config::recall_weights_tx(conn)?;
    let partial_threshold = config::get_f64(conn, "memory.partial_threshold")?.unwrap_or(0.25);

    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE status = 'active'");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], memory_from_row)?;

    let mut scored: Vec<RecalledMemory> = Vec::new();
    for row in rows {
        let memory = row?;
        if memory.importance < input.min_importance {
            continue;
        }
        if let Some(kinds) = &input.kinds {
            if !kinds.contains(&memory.kind) {
                continue;
            }
        }
        let Some(embedding) = &memory.embedding else {
            continue;
        };
        let similarity = cosine_similarity(embedding, query_embedding);
        if !similarity.is_finite() {
            continue;
        }
        let decayed = relevance(
            memory.importance,
            memory.decay_rate,
            memory.created_at,
            memory.last_accessed,
            now,
        );
        let score = weights.alpha * f64::from(similarity)
            + weights.beta * decayed
            + weights.gamma * memory.trust_level
            + weights.delta * recency_boost(memory.created_at, now)
            + memory.activation_boost;
        let partial = score < partial_threshold;
        if partial && !input.include_partial {
            continue;
        }
        scored.push(RecalledMemory {
            memory,
            similarity,
            score,
            partial,
        });
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
    scored.truncate(input.limit);
    Ok(scored)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_test_storage;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_remember_and_get_roundtrip() {
        let (storage, _dir) = open_test_storage();
        let id = storage
            .remember(RememberInput {
                content: "The sky was clear this morning".into(),
                ..Default::default()
            })
            .unwrap();
        let memory = storage.get_memory(&id).unwrap().unwrap();
        assert_eq!(memory.kind, MemoryKind::Episodic);
        assert_eq!(memory.status, MemoryStatus::Active);
        assert_eq!(memory.embedding.as_ref().unwrap().len(), EMBEDDING_DIMENSIONS);
        assert!(memory.metadata.get("emotional_context").is_some());
    }

    #[test]
    fn test_remember_rejects_empty_content() {
        let (storage, _dir) = open_test_storage();
        let err = storage
            .remember(RememberInput {
                content: "   ".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn test_semantic_memory_computes_trust_from_sources() {
        let (storage, _dir) = open_test_storage();
        let id = storage
            .create_semantic_memory(SemanticInput {
                content: "Water boils at 100C at sea level".into(),
                confidence: 0.9,
                importance: 0.6,
                source_references: json!([
                    {"kind": "web", "ref": "https://example.com/a", "trust": 0.9},
                    {"kind": "paper", "ref": "doi:10.1/x", "trust": 0.8},
                ]),
                ..Default::default()
            })
            .unwrap();
        let memory = storage.get_memory(&id).unwrap().unwrap();
        assert!(memory.trust_level > 0.0 && memory.trust_level <= 1.0);
        assert!(memory.source_attribution.get("ref").is_some());
        let refs = memory.metadata["source_references"].as_array().unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn test_touch_bumps_access_and_importance() {
        let (storage, _dir) = open_test_storage();
        let id = storage
            .remember(RememberInput {
                content: "touch me".into(),
                importance: 0.5,
                ..Default::default()
            })
            .unwrap();
        storage.touch_memories(&[id.clone()]).unwrap();
        let after_one = storage.get_memory(&id).unwrap().unwrap();
        assert_eq!(after_one.access_count, 1);
        assert!(after_one.importance > 0.5);

        storage.touch_memories(&[id.clone()]).unwrap();
        let after_two = storage.get_memory(&id).unwrap().unwrap();
        let first_gain = after_one.importance - 0.5;
        let second_gain = after_two.importance - after_one.importance;
        assert!(second_gain < first_gain, "importance gains should diminish");
    }

    #[test]
    fn test_status_dag_enforced() {
        let (storage, _dir) = open_test_storage();
        let id = storage
            .remember(RememberInput {
                content: "lifecycle".into(),
                ..Default::default()
            })
            .unwrap();
        storage.set_memory_status(&id, MemoryStatus::Archived).unwrap();
        let err = storage
            .set_memory_status(&id, MemoryStatus::Invalidated)
            .unwrap_err();
        assert!(matches!(err, CoreError::StateViolation(_)));
    }

    #[test]
    fn test_recall_limit_zero_is_empty() {
        let (storage, _dir) = open_test_storage();
        let results = storage
            .recall(&RecallInput {
                query: "anything".into(),
                limit: 0,
                ..Default::default()
            })
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_recall_orders_by_score_with_id_tiebreak() {
        let (storage, _dir) = open_test_storage();
        // Same content = same embedding = same similarity; importance differs
        let low = storage
            .remember(RememberInput {
                content: "shared phrasing".into(),
                importance: 0.2,
                ..Default::default()
            })
            .unwrap();
        let high = storage
            .remember(RememberInput {
                content: "shared phrasing".into(),
                importance: 0.9,
                ..Default::default()
            })
            .unwrap();
        let results = storage
            .recall(&RecallInput {
                query: "shared phrasing".into(),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].memory.id, high);
        assert_eq!(results[1].memory.id, low);

        // Determinism: repeated recall returns the identical ordering
        let again = storage
            .recall(&RecallInput {
                query: "shared phrasing".into(),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.memory.id.clone()).collect();
        let ids_again: Vec<_> = again.iter().map(|r| r.memory.id.clone()).collect();
        assert_eq!(ids, ids_again);
    }

    #[test]
    fn test_recall_excludes_other_kinds_when_filtered() {
        let (storage, _dir) = open_test_storage();
        storage
            .remember(RememberInput {
                content: "an episodic note".into(),
                kind: MemoryKind::Episodic,
                ..Default::default()
            })
            .unwrap();
        let semantic = storage
            .create_semantic_memory(SemanticInput {
                content: "an episodic note".into(),
                confidence: 0.8,
                importance: 0.5,
                source_references: json!([]),
                ..Default::default()
            })
            .unwrap();
        let results = storage
            .recall(&RecallInput {
                query: "an episodic note".into(),
                limit: 10,
                kinds: Some(vec![MemoryKind::Semantic]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, semantic);
    }

    #[test]
    fn test_procedure_outcomes_bounded() {
        let (storage, _dir) = open_test_storage();
        let id = storage
            .create_procedural_memory(
                "Restart the service",
                &["stop".into(), "start".into()],
                json!(null),
                0.5,
            )
            .unwrap();
        storage.record_procedure_outcome(&id, true).unwrap();
        storage.record_procedure_outcome(&id, false).unwrap();
        storage.record_procedure_outcome(&id, true).unwrap();
        let memory = storage.get_memory(&id).unwrap().unwrap();
        assert_eq!(memory.metadata["success_count"], json!(2));
        assert_eq!(memory.metadata["total_attempts"], json!(3));

        let hits = storage
            .search_procedural_memories("Restart the service", 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        let rate = hits[0].success_rate.unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_delete_memory_removes_graph_node() {
        let (storage, _dir) = open_test_storage();
        let id = storage
            .remember(RememberInput {
                content: "to be deleted".into(),
                concepts: vec![("deletion".into(), 0.9)],
                ..Default::default()
            })
            .unwrap();
        assert!(storage.find_graph_node(NodeKind::Memory, &id).unwrap().is_some());
        storage.delete_memory(&id).unwrap();
        assert!(storage.get_memory(&id).unwrap().is_none());
        assert!(storage.find_graph_node(NodeKind::Memory, &id).unwrap().is_none());
    }
}
