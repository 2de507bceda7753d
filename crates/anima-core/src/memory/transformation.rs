//! Belief Transformation
//!
//! Worldview memories do not change casually. A belief marked
//! `deliberate_transformation` must go through an explicit exploration:
//! reflections, contemplation actions, and accumulated evidence, gated by
//! per-subcategory requirements in config, before its content may change.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::config;
use crate::memory::store::get_memory_tx;
use crate::memory::MemoryKind;
use crate::storage::{CoreError, Result, Storage};

// ============================================================================
// CHANGE GATES
// ============================================================================

/// How a worldview memory is allowed to change
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequires {
    /// Confidence follows evidence edges; content stays
    Evidence,
    /// Content may only change through the transformation protocol
    DeliberateTransformation,
}

impl ChangeRequires {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequires::Evidence => "evidence",
            ChangeRequires::DeliberateTransformation => "deliberate_transformation",
        }
    }
}

/// Contemplation actions recorded against an active exploration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationEffort {
    /// A reflection pass considered the belief
    Reflect,
    /// An internal debate weighed both sides
    DebateInternally,
    /// New evidence was sought out
    SeekEvidence,
}

impl TransformationEffort {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformationEffort::Reflect => "reflect",
            TransformationEffort::DebateInternally => "debate_internally",
            TransformationEffort::SeekEvidence => "seek_evidence",
        }
    }
}

// ============================================================================
// TRANSFORMATION STATE
// ============================================================================

/// Default per-belief bookkeeping
pub fn default_transformation_state() -> Value {
    json!({
        "active_exploration": false,
        "exploration_goal_id": null,
        "evidence_memories": [],
        "reflection_count": 0,
        "first_questioned_heartbeat": null,
        "contemplation_actions": 0,
    })
}

/// Merge a raw state document over the defaults. Unknown fields are dropped;
/// missing fields take their default. Idempotent.
pub fn normalize_transformation_state(raw: Option<&Value>) -> Value {
    let mut state = default_transformation_state();
    let Some(Value::Object(given)) = raw else {
        return state;
    };
    let defaults = state.as_object_mut().expect("state is an object");
    for (key, default_value) in defaults.iter_mut() {
        if let Some(v) = given.get(key) {
            // Keep the default on type mismatch
            let type_matches = matches!(
                (&*default_value, v),
                (Value::Bool(_), Value::Bool(_))
                    | (Value::Array(_), Value::Array(_))
                    | (Value::Number(_), Value::Number(_))
            ) || default_value.is_null()
                || v.is_null();
            if type_matches {
                *default_value = v.clone();
            }
        }
    }
    state
}

/// Requirements a belief must meet before transformation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformationRequirements {
    /// Reflections recorded against the belief
    pub min_reflections: i64,
    /// Heartbeats elapsed since the belief was first questioned
    pub min_heartbeats: i64,
    /// Mean trust of accumulated evidence memories
    pub evidence_threshold: f64,
    /// Dampens confidence movement
    pub stability: f64,
    /// Maximum confidence shift one transformation may apply
    pub max_change_per_attempt: f64,
}

impl Default for TransformationRequirements {
    fn default() -> Self {
        Self {
            min_reflections: 3,
            min_heartbeats: 5,
            evidence_threshold: 0.5,
            stability: 0.5,
            max_change_per_attempt: 0.2,
        }
    }
}

fn requirements_from_value(v: &Value, base: TransformationRequirements) -> TransformationRequirements {
    TransformationRequirements {
        min_reflections: v
            .get("min_reflections")
            .and_then(Value::as_i64)
            .unwrap_or(base.min_reflections),
        min_heartbeats: v
            .get("min_heartbeats")
            .and_then(Value::as_i64)
            .unwrap_or(base.min_heartbeats),
        evidence_threshold: v
            .get("evidence_threshold")
            .and_then(Value::as_f64)
            .unwrap_or(base.evidence_threshold),
        stability: v
            .get("stability")
            .and_then(Value::as_f64)
            .unwrap_or(base.stability),
        max_change_per_attempt: v
            .get("max_change_per_attempt")
            .and_then(Value::as_f64)
            .unwrap_or(base.max_change_per_attempt),
    }
}

/// Resolve requirements for a belief: `transformation.<subcategory>` wins,
/// then `transformation.<category>`, then defaults.
pub(crate) fn transformation_requirements_tx(
    conn: &Connection,
    category: &str,
    subcategory: Option<&str>,
) -> Result<TransformationRequirements> {
    let defaults = TransformationRequirements::default();
    let by_category = match config::get_config_tx(conn, &format!("transformation.{category}"))? {
        Some(v) => requirements_from_value(&v, defaults),
        None => defaults,
    };
    if let Some(sub) = subcategory {
        if let Some(v) = config::get_config_tx(conn, &format!("transformation.{sub}"))? {
            return Ok(requirements_from_value(&v, by_category));
        }
    }
    Ok(by_category)
}

// ============================================================================
// PROGRESS REPORTING
// ============================================================================

/// Progress of one active exploration
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransformationProgress {
    /// Belief memory id
    pub belief_id: String,
    /// Belief content
    pub content: String,
    /// Category (and subcategory if set)
    pub category: String,
    /// Subcategory if set
    pub subcategory: Option<String>,
    /// Reflections recorded / required
    pub reflections_current: i64,
    /// Required reflections
    pub reflections_required: i64,
    /// Heartbeats since first questioned
    pub heartbeats_elapsed: i64,
    /// Required heartbeats
    pub heartbeats_required: i64,
    /// Evidence memory count
    pub evidence_count: usize,
    /// Mean trust of evidence memories
    pub evidence_strength: f64,
    /// Required evidence strength
    pub evidence_threshold: f64,
    /// All gates satisfied
    pub ready: bool,
}

fn heartbeat_count_tx(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT heartbeat_count FROM heartbeat_state WHERE id = 1",
        [],
        |row| row.get(0),
    )?)
}

fn evidence_strength_tx(conn: &Connection, evidence_ids: &[String]) -> Result<f64> {
    if evidence_ids.is_empty() {
        return Ok(0.0);
    }
    let mut total = 0.0f64;
    let mut count = 0usize;
    for id in evidence_ids {
        let trust: Option<f64> = rusqlite::OptionalExtension::optional(conn.query_row(
            "SELECT trust_level FROM memories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        ))?;
        if let Some(trust) = trust {
            total += trust;
            count += 1;
        }
    }
    if count == 0 {
        return Ok(0.0);
    }
    Ok(total / count as f64)
}

pub(crate) fn progress_for_tx(conn: &Connection, belief_id: &str) -> Result<TransformationProgress> {
    let memory = get_memory_tx(conn, belief_id)?
        .ok_or_else(|| CoreError::NotFound(format!("memory {belief_id}")))?;
    if memory.kind != MemoryKind::Worldview {
        return Err(CoreError::InvalidInput(format!(
            "memory {belief_id} is {}, not worldview",
            memory.kind
        )));
    }
    let metadata = &memory.metadata;
    let state = normalize_transformation_state(metadata.get("transformation_state"));
    let category = metadata
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or("belief")
        .to_string();
    let subcategory = metadata
        .get("subcategory")
        .and_then(Value::as_str)
        .map(str::to_string);
    let requirements = transformation_requirements_tx(conn, &category, subcategory.as_deref())?;

    let evidence_ids: Vec<String> = state["evidence_memories"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let evidence_strength = evidence_strength_tx(conn, &evidence_ids)?;

    let reflections = state["reflection_count"].as_i64().unwrap_or(0);
    let heartbeats_elapsed = match state["first_questioned_heartbeat"].as_i64() {
        Some(first) => (heartbeat_count_tx(conn)? - first).max(0),
        None => 0,
    };

    let ready = state["active_exploration"].as_bool().unwrap_or(false)
        && reflections >= requirements.min_reflections
        && heartbeats_elapsed >= requirements.min_heartbeats
        && evidence_strength >= requirements.evidence_threshold;

    Ok(TransformationProgress {
        belief_id: belief_id.to_string(),
        content: memory.content,
        category,
        subcategory,
        reflections_current: reflections,
        reflections_required: requirements.min_reflections,
        heartbeats_elapsed,
        heartbeats_required: requirements.min_heartbeats,
        evidence_count: evidence_ids.len(),
        evidence_strength,
        evidence_threshold: requirements.evidence_threshold,
        ready,
    })
}

fn write_state_tx(conn: &Connection, belief_id: &str, state: &Value) -> Result<()> {
    let memory = get_memory_tx(conn, belief_id)?
        .ok_or_else(|| CoreError::NotFound(format!("memory {belief_id}")))?;
    let mut metadata = memory.metadata;
    metadata["transformation_state"] = state.clone();
    conn.execute(
        "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&metadata)?, Utc::now(), belief_id],
    )?;
    Ok(())
}

// ============================================================================
// STORAGE SURFACE
// ============================================================================

impl Storage {
    /// Start a deliberate exploration of a belief. Rejects beliefs whose
    /// `change_requires` gate is not `deliberate_transformation`.
    pub fn begin_belief_exploration(&self, belief_id: &str, goal_id: Option<&str>) -> Result<()> {
        self.with_tx(|tx| {
            let memory = get_memory_tx(tx, belief_id)?
                .ok_or_else(|| CoreError::NotFound(format!("memory {belief_id}")))?;
            if memory.kind != MemoryKind::Worldview {
                return Err(CoreError::InvalidInput(format!(
                    "memory {belief_id} is {}, not worldview",
                    memory.kind
                )));
            }
            let gate = memory
                .metadata
                .get("change_requires")
                .and_then(Value::as_str)
                .unwrap_or("evidence");
            if gate != ChangeRequires::DeliberateTransformation.as_str() {
                return Err(CoreError::StateViolation(format!(
                    "belief {belief_id} does not allow deliberate transformation (gate: {gate})"
                )));
            }
            let mut state = normalize_transformation_state(
                memory.metadata.get("transformation_state"),
            );
            if state["active_exploration"].as_bool().unwrap_or(false) {
                return Err(CoreError::StateViolation(format!(
                    "belief {belief_id} is already under exploration"
                )));
            }
            state["active_exploration"] = json!(true);
            state["exploration_goal_id"] = json!(goal_id);
            state["first_questioned_heartbeat"] = json!(heartbeat_count_tx(tx)?);
            write_state_tx(tx, belief_id, &state)
        })
    }

    /// Record contemplation work against an active exploration
    pub fn record_transformation_effort(
        &self,
        belief_id: &str,
        effort: TransformationEffort,
        note: Option<&str>,
        evidence_memory_id: Option<&str>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let memory = get_memory_tx(tx, belief_id)?
                .ok_or_else(|| CoreError::NotFound(format!("memory {belief_id}")))?;
            let mut state =
                normalize_transformation_state(memory.metadata.get("transformation_state"));
            if !state["active_exploration"].as_bool().unwrap_or(false) {
                return Err(CoreError::StateViolation(format!(
                    "belief {belief_id} has no active exploration"
                )));
            }
            if effort == TransformationEffort::Reflect {
                let n = state["reflection_count"].as_i64().unwrap_or(0);
                state["reflection_count"] = json!(n + 1);
            }
            let n = state["contemplation_actions"].as_i64().unwrap_or(0);
            state["contemplation_actions"] = json!(n + 1);

            if let Some(evidence) = evidence_memory_id {
                if get_memory_tx(tx, evidence)?.is_none() {
                    return Err(CoreError::NotFound(format!("evidence memory {evidence}")));
                }
                let list = state["evidence_memories"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                if !list.iter().any(|v| v.as_str() == Some(evidence)) {
                    let mut list = list;
                    list.push(json!(evidence));
                    state["evidence_memories"] = Value::Array(list);
                }
            }
            if let Some(note) = note {
                tracing::debug!(
                    belief = belief_id,
                    effort = effort.as_str(),
                    note,
                    "transformation effort"
                );
            }
            write_state_tx(tx, belief_id, &state)
        })
    }

    /// Abandon an exploration, resetting the belief's bookkeeping
    pub fn abandon_belief_exploration(&self, belief_id: &str) -> Result<()> {
        self.with_tx(|tx| {
            // Verify existence before silently resetting
            get_memory_tx(tx, belief_id)?
                .ok_or_else(|| CoreError::NotFound(format!("memory {belief_id}")))?;
            write_state_tx(tx, belief_id, &default_transformation_state())
        })
    }

    /// Progress readout for one belief
    pub fn get_transformation_progress(&self, belief_id: &str) -> Result<TransformationProgress> {
        self.with_reader(|conn| progress_for_tx(conn, belief_id))
    }

    /// All beliefs currently under exploration
    pub fn get_active_transformations(&self, limit: usize) -> Result<Vec<TransformationProgress>> {
        self.with_reader(|conn| {
            let ids = active_exploration_ids_tx(conn)?;
            let mut out = Vec::new();
            for id in ids.into_iter().take(limit) {
                out.push(progress_for_tx(conn, &id)?);
            }
            Ok(out)
        })
    }

    /// Beliefs whose exploration satisfies every readiness gate
    pub fn check_transformation_readiness(&self) -> Result<Vec<TransformationProgress>> {
        Ok(self
            .get_active_transformations(usize::MAX)?
            .into_iter()
            .filter(|p| p.ready)
            .collect())
    }

    /// Rewrite a belief after a completed exploration. Requires readiness;
    /// the confidence shift is clamped to `max_change_per_attempt` and a
    /// change_history entry is appended. The exploration state resets.
    pub fn attempt_worldview_transformation(
        &self,
        belief_id: &str,
        new_content: &str,
        change_type: &str,
        new_confidence: Option<f64>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let progress = progress_for_tx(tx, belief_id)?;
            if !progress.ready {
                return Err(CoreError::StateViolation(format!(
                    "belief {belief_id} is not ready for transformation \
                     ({}/{} reflections, {}/{} heartbeats, evidence {:.2}/{:.2})",
                    progress.reflections_current,
                    progress.reflections_required,
                    progress.heartbeats_elapsed,
                    progress.heartbeats_required,
                    progress.evidence_strength,
                    progress.evidence_threshold,
                )));
            }

            let memory = get_memory_tx(tx, belief_id)?
                .ok_or_else(|| CoreError::NotFound(format!("memory {belief_id}")))?;
            let requirements = transformation_requirements_tx(
                tx,
                &progress.category,
                progress.subcategory.as_deref(),
            )?;
            let old_confidence = memory
                .metadata
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.5);
            let confidence = match new_confidence {
                Some(requested) => {
                    let clamped_shift = (requested - old_confidence)
                        .clamp(-requirements.max_change_per_attempt, requirements.max_change_per_attempt);
                    (old_confidence + clamped_shift).clamp(0.0, 1.0)
                }
                None => old_confidence,
            };

            let mut metadata = memory.metadata;
            let mut history = metadata
                .get("change_history")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            history.push(json!({
                "changed_at": Utc::now().to_rfc3339(),
                "change_type": change_type,
                "previous_content": memory.content,
                "previous_confidence": old_confidence,
                "new_confidence": confidence,
            }));
            metadata["change_history"] = Value::Array(history);
            metadata["confidence"] = json!(confidence);
            metadata["origin"] = json!("transformed");
            metadata["transformation_state"] = default_transformation_state();

            tx.execute(
                "UPDATE memories SET content = ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    new_content,
                    serde_json::to_string(&metadata)?,
                    Utc::now(),
                    belief_id
                ],
            )?;
            Ok(())
        })
    }
}

pub(crate) fn active_exploration_ids_tx(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM memories
         WHERE kind = 'worldview' AND status = 'active'
           AND json_extract(metadata, '$.transformation_state.active_exploration') = 1
         ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================
