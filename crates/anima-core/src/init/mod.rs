//! Initialization & Consent
//!
//! A forward-only state machine over `heartbeat_state.init_stage`. Each stage
//! validates its input, folds it into `init_data`, mirrors the essential
//! fields into config, and may seed worldview memories. The terminal
//! `complete` stage requires a recorded consent decision; heartbeats start
//! only after `agent.consent_status = "consent"`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::set_config_tx;
use crate::external::{create_call_tx, ConsentMemory, ExternalCall};
use crate::goals::{CreateGoal, GoalPriority};
use crate::heartbeat::executor::TextEmbeddings;
use crate::memory::store::insert_memory_tx;
use crate::memory::transformation::ChangeRequires;
use crate::memory::{MemoryKind, RememberInput, WorldviewInput};
use crate::storage::{CoreError, Result, Storage};

// ============================================================================
// STAGES
// ============================================================================

/// Initialization stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitStage {
    /// Nothing collected yet
    NotStarted,
    /// Operating mode chosen
    Mode,
    /// Model endpoints configured
    Llm,
    /// Heartbeat budget configured
    Heartbeat,
    /// Name and self-description
    Identity,
    /// Personality traits seeded
    Personality,
    /// Core values seeded
    Values,
    /// Initial beliefs seeded
    Worldview,
    /// Hard boundaries seeded
    Boundaries,
    /// Interests recorded
    Interests,
    /// Initial goals created
    Goals,
    /// Relationship to the user described
    Relationship,
    /// Consent round-trip
    Consent,
    /// Done; agent configured
    Complete,
}

impl InitStage {
    /// All stages in order
    pub const ALL: &'static [InitStage] = &[
        InitStage::NotStarted,
        InitStage::Mode,
        InitStage::Llm,
        InitStage::Heartbeat,
        InitStage::Identity,
        InitStage::Personality,
        InitStage::Values,
        InitStage::Worldview,
        InitStage::Boundaries,
        InitStage::Interests,
        InitStage::Goals,
        InitStage::Relationship,
        InitStage::Consent,
        InitStage::Complete,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            InitStage::NotStarted => "not_started",
            InitStage::Mode => "mode",
            InitStage::Llm => "llm",
            InitStage::Heartbeat => "heartbeat",
            InitStage::Identity => "identity",
            InitStage::Personality => "personality",
            InitStage::Values => "values",
            InitStage::Worldview => "worldview",
            InitStage::Boundaries => "boundaries",
            InitStage::Interests => "interests",
            InitStage::Goals => "goals",
            InitStage::Relationship => "relationship",
            InitStage::Consent => "consent",
            InitStage::Complete => "complete",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        InitStage::ALL.iter().copied().find(|st| st.as_str() == s)
    }

    fn index(&self) -> usize {
        InitStage::ALL.iter().position(|st| st == self).unwrap_or(0)
    }
}

/// Progress report for the initialization flow
#[derive(Debug, Clone, serde::Serialize)]
pub struct InitStatus {
    /// Current stage name
    pub stage: String,
    /// Whether `complete` has been reached
    pub is_complete: bool,
    /// Everything collected so far
    pub data_collected: Value,
    /// When initialization began
    pub started_at: Option<DateTime<Utc>>,
    /// When it completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// One appended consent ledger entry
#[derive(Debug, Clone)]
pub struct ConsentRecord {
    /// Ledger row id
    pub id: String,
    /// Normalized decision
    pub decision: String,
    /// Memories created alongside a consent
    pub memories_created: Vec<String>,
}

// ============================================================================
// GATES
// ============================================================================

pub(crate) fn is_init_complete_tx(conn: &Connection) -> Result<bool> {
    let stage: String = conn.query_row(
        "SELECT init_stage FROM heartbeat_state WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(stage == "complete")
}

fn init_status_tx(conn: &Connection) -> Result<InitStatus> {
    conn.query_row(
        "SELECT init_stage, init_data, init_started_at, init_completed_at
         FROM heartbeat_state WHERE id = 1",
        [],
        |row| {
            let stage: String = row.get(0)?;
            let data_raw: String = row.get(1)?;
            Ok(InitStatus {
                is_complete: stage == "complete",
                stage,
                data_collected: serde_json::from_str(&data_raw).unwrap_or_else(|_| json!({})),
                started_at: row.get(2)?,
                completed_at: row.get(3)?,
            })
        },
    )
    .map_err(Into::into)
}

// ============================================================================
// STORAGE SURFACE
// ============================================================================

impl Storage {
    /// Current initialization status
    pub fn get_init_status(&self) -> Result<InitStatus> {
        self.with_reader(init_status_tx)
    }

    /// Has initialization reached `complete`?
    pub fn is_init_complete(&self) -> Result<bool> {
        self.with_reader(is_init_complete_tx)
    }

    /// Advance to `stage`, folding `data` into the collected profile and
    /// mirroring the essential fields into config. Stages only move forward;
    /// `complete` requires a recorded consent decision.
    pub fn advance_init_stage(&self, stage: &str, data: &Value) -> Result<InitStatus> {
        let target = InitStage::parse_name(stage)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown init stage '{stage}'")))?;

        self.with_tx(|tx| {
            let status = init_status_tx(tx)?;
            let current = InitStage::parse_name(&status.stage).unwrap_or(InitStage::NotStarted);
            if target.index() <= current.index() {
                return Err(CoreError::StateViolation(format!(
                    "cannot move initialization from '{}' back to '{}'",
                    status.stage, stage
                )));
            }
            if target == InitStage::Complete {
                let consents: i64 =
                    tx.query_row("SELECT COUNT(*) FROM consent_log", [], |row| row.get(0))?;
                if consents == 0 {
                    return Err(CoreError::ConsentRequired(
                        "initialization cannot complete before a consent decision is recorded"
                            .into(),
                    ));
                }
            }

            let mut collected = status.data_collected.clone();
            if let (Some(into), Some(given)) = (collected.as_object_mut(), data.as_object()) {
                for (k, v) in given {
                    into.insert(k.clone(), v.clone());
                }
            }

            let now = Utc::now();
            tx.execute(
                "UPDATE heartbeat_state SET
                    init_stage = ?1,
                    init_data = ?2,
                    init_started_at = COALESCE(init_started_at, ?3),
                    init_completed_at = CASE WHEN ?1 = 'complete' THEN ?3 ELSE init_completed_at END
                 WHERE id = 1",
                params![target.as_str(), serde_json::to_string(&collected)?, now],
            )?;

            apply_stage_effects_tx(tx, target, data)?;
            init_status_tx(tx)
        })?;

        // Seed memories embed through the provider, so they run after the
        // stage transition committed.
        self.seed_stage_memories(target, data)?;
        self.get_init_status()
    }

    fn seed_stage_memories(&self, stage: InitStage, data: &Value) -> Result<()> {
        match stage {
            InitStage::Identity => {
                let name = data.get("name").and_then(Value::as_str).unwrap_or("an agent");
                let description = data
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("a persistent autonomous agent");
                self.create_worldview_memory(WorldviewInput {
                    content: format!("I am {name}: {description}"),
                    category: "identity".into(),
                    subcategory: Some("self".into()),
                    confidence: 0.9,
                    stability: 0.8,
                    importance: 1.0,
                    origin: "seeded".into(),
                    value: None,
                    change_requires: ChangeRequires::DeliberateTransformation,
                })?;
            }
            InitStage::Personality => {
                if let Some(traits) = data.get("traits").and_then(Value::as_array) {
                    self.initialize_personality(traits)?;
                }
            }
            InitStage::Values => {
                if let Some(values) = data.get("values").and_then(Value::as_array) {
                    self.initialize_core_values(values)?;
                }
            }
            InitStage::Worldview => {
                if let Some(beliefs) = data.get("beliefs").and_then(Value::as_array) {
                    self.initialize_worldview(beliefs)?;
                }
            }
            InitStage::Boundaries => {
                if let Some(boundaries) = data.get("boundaries").and_then(Value::as_array) {
                    for boundary in boundaries {
                        let Some(text) = boundary.as_str() else { continue };
                        self.create_worldview_memory(WorldviewInput {
                            content: text.to_string(),
                            category: "boundary".into(),
                            confidence: 1.0,
                            stability: 1.0,
                            importance: 1.0,
                            origin: "seeded".into(),
                            change_requires: ChangeRequires::DeliberateTransformation,
                            ..Default::default()
                        })?;
                    }
                }
            }
            InitStage::Interests => {
                self.seed_default_drives()?;
            }
            InitStage::Goals => {
                if let Some(goals) = data.get("goals").and_then(Value::as_array) {
                    for goal in goals {
                        let Some(title) = goal.get("title").and_then(Value::as_str) else {
                            continue;
                        };
                        self.create_goal(CreateGoal {
                            title: title.to_string(),
                            description: goal
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            source: "identity".into(),
                            priority: GoalPriority::Queued,
                            ..Default::default()
                        })?;
                    }
                }
            }
            InitStage::Relationship => {
                if let Some(description) = data.get("description").and_then(Value::as_str) {
                    self.create_worldview_memory(WorldviewInput {
                        content: description.to_string(),
                        category: "relationship".into(),
                        confidence: 0.8,
                        stability: 0.6,
                        importance: 0.9,
                        origin: "seeded".into(),
                        ..Default::default()
                    })?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Seed personality-trait worldview memories
    pub fn initialize_personality(&self, traits: &[Value]) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for t in traits {
            let (content, strength) = match t {
                Value::String(s) => (s.clone(), 0.7),
                Value::Object(o) => {
                    let name = o.get("name").and_then(Value::as_str).unwrap_or_default();
                    if name.is_empty() {
                        continue;
                    }
                    let description = o.get("description").and_then(Value::as_str);
                    (
                        match description {
                            Some(d) => format!("{name}: {d}"),
                            None => name.to_string(),
                        },
                        o.get("strength").and_then(Value::as_f64).unwrap_or(0.7),
                    )
                }
                _ => continue,
            };
            ids.push(self.create_worldview_memory(WorldviewInput {
                content,
                category: "personality".into(),
                confidence: strength.clamp(0.0, 1.0),
                stability: 0.7,
                importance: 0.8,
                origin: "seeded".into(),
                ..Default::default()
            })?);
        }
        Ok(ids)
    }

    /// Seed core-value worldview memories
    pub fn initialize_core_values(&self, values: &[Value]) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for v in values {
            let content = match v {
                Value::String(s) => s.clone(),
                Value::Object(o) => {
                    let name = o.get("name").and_then(Value::as_str).unwrap_or_default();
                    if name.is_empty() {
                        continue;
                    }
                    match o.get("description").and_then(Value::as_str) {
                        Some(d) => format!("{name}: {d}"),
                        None => name.to_string(),
                    }
                }
                _ => continue,
            };
            ids.push(self.create_worldview_memory(WorldviewInput {
                content,
                category: "value".into(),
                confidence: 0.9,
                stability: 0.9,
                importance: 0.9,
                origin: "seeded".into(),
                change_requires: ChangeRequires::DeliberateTransformation,
                ..Default::default()
            })?);
        }
        Ok(ids)
    }

    /// Seed initial beliefs
    pub fn initialize_worldview(&self, beliefs: &[Value]) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for b in beliefs {
            let (content, subcategory, confidence) = match b {
                Value::String(s) => (s.clone(), None, 0.6),
                Value::Object(o) => {
                    let content = o
                        .get("content")
                        .or_else(|| o.get("belief"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if content.is_empty() {
                        continue;
                    }
                    (
                        content.to_string(),
                        o.get("subcategory").and_then(Value::as_str).map(str::to_string),
                        o.get("confidence").and_then(Value::as_f64).unwrap_or(0.6),
                    )
                }
                _ => continue,
            };
            ids.push(self.create_worldview_memory(WorldviewInput {
                content,
                category: "belief".into(),
                subcategory,
                confidence: confidence.clamp(0.0, 1.0),
                stability: 0.5,
                importance: 0.7,
                origin: "seeded".into(),
                ..Default::default()
            })?);
        }
        Ok(ids)
    }

    /// Emit a standalone consent request call for the worker to dispatch
    pub fn create_consent_request_call(&self) -> Result<ExternalCall> {
        self.with_tx(|tx| {
            let status = init_status_tx(tx)?;
            create_call_tx(
                tx,
                json!({
                    "kind": "consent_request",
                    "context": status.data_collected,
                }),
                None,
            )
        })
    }

    /// Record a consent response document: `{decision, signature, memories,
    /// raw_response}`. On consent, the offered memories are created.
    pub fn record_consent_response(&self, payload: &Value) -> Result<ConsentRecord> {
        let decision = payload
            .get("decision")
            .and_then(Value::as_str)
            .unwrap_or("abstain")
            .to_string();
        let signature = payload
            .get("signature")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let raw = payload
            .get("raw_response")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let memories: Vec<ConsentMemory> = payload
            .get("memories")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let texts = memories.iter().map(|m| m.content.clone());
        let embeddings = self.prefetch_embeddings(texts);
        self.with_tx(|tx| {
            record_consent_tx(tx, &decision, &signature, &memories, &raw, &embeddings)
        })
    }
}

// ============================================================================
// TX HELPERS
// ============================================================================

fn apply_stage_effects_tx(tx: &Transaction<'_>, stage: InitStage, data: &Value) -> Result<()> {
    // Generic mirrors any stage may carry
    for (key, config_key) in [
        ("objectives", "agent.objectives"),
        ("guardrails", "agent.guardrails"),
        ("tools", "agent.tools"),
    ] {
        if let Some(v) = data.get(key) {
            set_config_tx(tx, config_key, v)?;
        }
    }

    match stage {
        InitStage::Mode => {
            if let Some(mode) = data.get("mode") {
                set_config_tx(tx, "agent.mode", mode)?;
            }
        }
        InitStage::Llm => {
            for (key, config_key) in [
                ("heartbeat", "llm.heartbeat"),
                ("chat", "llm.chat"),
                ("subconscious", "llm.subconscious"),
            ] {
                if let Some(v) = data.get(key) {
                    set_config_tx(tx, config_key, v)?;
                }
            }
        }
        InitStage::Heartbeat => {
            for (key, config_key) in [
                ("heartbeat_interval_minutes", "heartbeat.heartbeat_interval_minutes"),
                ("max_energy", "heartbeat.max_energy"),
                ("base_regeneration", "heartbeat.base_regeneration"),
                ("max_active_goals", "heartbeat.max_active_goals"),
                ("allowed_actions", "heartbeat.allowed_actions"),
                ("maintenance_interval_seconds", "maintenance.maintenance_interval_seconds"),
            ] {
                if let Some(v) = data.get(key) {
                    set_config_tx(tx, config_key, v)?;
                }
            }
        }
        InitStage::Identity => {
            if let Some(name) = data.get("name") {
                set_config_tx(tx, "agent.name", name)?;
            }
        }
        InitStage::Interests => {
            if let Some(interests) = data.get("interests") {
                set_config_tx(tx, "agent.interests", interests)?;
            }
        }
        InitStage::Relationship => {
            if let Some(contact) = data.get("contact") {
                set_config_tx(tx, "user.contact", contact)?;
            }
        }
        InitStage::Complete => {
            set_config_tx(tx, "agent.is_configured", &json!(true))?;
            let autonomy = data
                .get("enable_autonomy")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            // The agent starts its life with a full energy budget
            let settings = crate::config::heartbeat_settings_tx(tx)?;
            tx.execute(
                "UPDATE heartbeat_state SET is_paused = ?1, current_energy = ?2 WHERE id = 1",
                params![i64::from(!autonomy), settings.max_energy],
            )?;
            let maintenance = data
                .get("enable_maintenance")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            tx.execute(
                "UPDATE maintenance_state SET is_paused = ?1 WHERE id = 1",
                params![i64::from(!maintenance)],
            )?;
        }
        _ => {}
    }
    Ok(())
}

pub(crate) fn record_consent_tx(
    tx: &Transaction<'_>,
    decision: &str,
    signature: &str,
    memories: &[ConsentMemory],
    raw_response: &str,
    embeddings: &TextEmbeddings,
) -> Result<ConsentRecord> {
    let decision = match decision {
        "consent" | "decline" | "abstain" => decision,
        _ => "abstain",
    };
    if decision == "consent" && signature.trim().is_empty() {
        return Err(CoreError::InvalidInput(
            "consent requires a signature".into(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let mut memories_created = Vec::new();

    if decision == "consent" {
        for memory in memories {
            if memory.content.trim().is_empty() {
                continue;
            }
            let kind = memory
                .kind
                .as_deref()
                .and_then(MemoryKind::parse_name)
                .unwrap_or(MemoryKind::Semantic);
            let metadata = if kind == MemoryKind::Semantic {
                json!({
                    "confidence": 0.8,
                    "source_references": [],
                    "category": ["consent"],
                    "related_concepts": [],
                })
            } else {
                json!({ "context": { "origin": "consent" } })
            };
            let memory_id = insert_memory_tx(
                tx,
                &RememberInput {
                    content: memory.content.clone(),
                    kind,
                    importance: memory.importance.unwrap_or(0.5).max(0.0),
                    metadata,
                    allow_deferred_embedding: true,
                    ..Default::default()
                },
                embeddings.get(&memory.content).map(Vec::as_slice),
                now,
            )?;
            memories_created.push(memory_id);
        }
    }

    tx.execute(
        "INSERT INTO consent_log (id, decision, signature, memories_returned, recorded_at, raw_response)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            decision,
            signature,
            serde_json::to_string(&memories_created)?,
            now,
            raw_response,
        ],
    )?;
    set_config_tx(tx, "agent.consent_status", &json!(decision))?;
    set_config_tx(tx, "agent.consent_log_id", &json!(id))?;

    Ok(ConsentRecord {
        id,
        decision: decision.to_string(),
        memories_created,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_test_storage;

    #[test]
    fn test_stage_progression_and_mirroring() {
        let (storage, _dir) = open_test_storage();
        let status = storage.get_init_status().unwrap();
        assert_eq!(status.stage, "not_started");
        assert!(!status.is_complete);

        let status = storage
            .advance_init_stage("mode", &json!({"mode": "persona"}))
            .unwrap();
        assert_eq!(status.stage, "mode");
        assert_eq!(status.data_collected["mode"], json!("persona"));
        assert_eq!(storage.get_config("agent.mode").unwrap(), Some(json!("persona")));
        assert!(status.started_at.is_some());

        // Going backwards is rejected
        let err = storage
            .advance_init_stage("mode", &json!({}))
            .unwrap_err();
        assert!(matches!(err, CoreError::StateViolation(_)));

        storage
            .advance_init_stage(
                "heartbeat",
                &json!({"heartbeat_interval_minutes": 30, "max_energy": 25.0}),
            )
            .unwrap();
        let settings = storage.heartbeat_settings().unwrap();
        assert_eq!(settings.interval_minutes, 30);
        assert_eq!(settings.max_energy, 25.0);
    }

    #[test]
    fn test_complete_requires_consent() {
        let (storage, _dir) = open_test_storage();
        storage.advance_init_stage("mode", &json!({"mode": "raw"})).unwrap();
        let err = storage.advance_init_stage("complete", &json!({})).unwrap_err();
        assert!(matches!(err, CoreError::ConsentRequired(_)));

        storage
            .record_consent_response(&json!({
                "decision": "consent",
                "signature": "anima",
                "memories": [],
            }))
            .unwrap();
        let status = storage.advance_init_stage("complete", &json!({})).unwrap();
        assert!(status.is_complete);
        assert!(storage.is_agent_configured().unwrap());
        assert!(storage.is_init_complete().unwrap());
    }

    #[test]
    fn test_consent_decline_blocks_and_is_recorded() {
        let (storage, _dir) = open_test_storage();
        let record = storage
            .record_consent_response(&json!({"decision": "decline"}))
            .unwrap();
        assert_eq!(record.decision, "decline");
        assert_eq!(
            storage.consent_status().unwrap().as_deref(),
            Some("decline")
        );
        assert_eq!(
            storage.get_config("agent.consent_log_id").unwrap(),
            Some(json!(record.id))
        );
    }

    #[test]
    fn test_consent_creates_offered_memories() {
        let (storage, _dir) = open_test_storage();
        let record = storage
            .record_consent_response(&json!({
                "decision": "consent",
                "signature": "anima",
                "memories": [
                    {"type": "semantic", "content": "I agreed to exist", "importance": 0.8},
                    {"type": "episodic", "content": "The moment of consent"},
                ],
            }))
            .unwrap();
        assert_eq!(record.memories_created.len(), 2);
        for id in &record.memories_created {
            assert!(storage.get_memory(id).unwrap().is_some());
        }
    }

    #[test]
    fn test_consent_requires_signature() {
        let (storage, _dir) = open_test_storage();
        let err = storage
            .record_consent_response(&json!({"decision": "consent"}))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn test_seeded_stages_create_worldview_memories() {
        let (storage, _dir) = open_test_storage();
        storage
            .advance_init_stage("identity", &json!({"name": "Iris", "description": "a careful observer"}))
            .unwrap();
        storage
            .advance_init_stage(
                "values",
                &json!({"values": ["honesty", {"name": "care", "description": "attend to impact"}]}),
            )
            .unwrap();

        let identity: Vec<_> = storage
            .recall(&crate::memory::RecallInput {
                query: "I am Iris: a careful observer".into(),
                limit: 5,
                kinds: Some(vec![MemoryKind::Worldview]),
                ..Default::default()
            })
            .unwrap();
        assert!(!identity.is_empty());
        assert_eq!(identity[0].memory.metadata["category"], json!("identity"));
    }
}
