//! Memory Module - Core types and scoring
//!
//! The memory row is the universal atom of the substrate. Six kinds share one
//! table, differentiated by kind-specific JSON metadata; the graph, clusters,
//! trust accounting, and the heartbeat all hang off these rows.

pub(crate) mod store;
pub mod transformation;
pub mod trust;
pub mod working;

pub use store::{
    EpisodicInput, ProceduralMatch, RecallInput, RecalledMemory, RememberInput, SemanticInput,
    StrategicMatch, WorldviewInput,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// MEMORY KINDS
// ============================================================================

/// Kinds of long-term memory
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Something that happened
    #[default]
    Episodic,
    /// Something known
    Semantic,
    /// How to do something
    Procedural,
    /// A recognized pattern worth acting on
    Strategic,
    /// A belief, value, identity facet, or personality trait
    Worldview,
    /// A goal with lifecycle metadata
    Goal,
}

impl MemoryKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Strategic => "strategic",
            MemoryKind::Worldview => "worldview",
            MemoryKind::Goal => "goal",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "episodic" => Some(MemoryKind::Episodic),
            "semantic" => Some(MemoryKind::Semantic),
            "procedural" => Some(MemoryKind::Procedural),
            "strategic" => Some(MemoryKind::Strategic),
            "worldview" => Some(MemoryKind::Worldview),
            "goal" => Some(MemoryKind::Goal),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY STATUS
// ============================================================================

/// Lifecycle status. Transitions form a DAG:
/// active -> archived -> (deleted), active -> invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    /// Participates in recall and context gathering
    #[default]
    Active,
    /// Kept for the retention window, excluded from recall
    Archived,
    /// Superseded or disproven; excluded from recall, never deleted by age
    Invalidated,
}

impl MemoryStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Archived => "archived",
            MemoryStatus::Invalidated => "invalidated",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MemoryStatus::Active),
            "archived" => Some(MemoryStatus::Archived),
            "invalidated" => Some(MemoryStatus::Invalidated),
            _ => None,
        }
    }

    /// Whether `self -> to` is a legal lifecycle transition
    pub fn can_transition_to(&self, to: MemoryStatus) -> bool {
        matches!(
            (self, to),
            (MemoryStatus::Active, MemoryStatus::Archived)
                | (MemoryStatus::Active, MemoryStatus::Invalidated)
        )
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// SOURCE REFERENCES
// ============================================================================

/// Canonical source descriptor used in `source_attribution` and in
/// `metadata.source_references` of semantic memories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Source class: 'web', 'paper', 'user', 'agent', ...
    pub kind: String,
    /// Stable reference (URL, DOI, conversation id)
    #[serde(rename = "ref")]
    pub reference: String,
    /// Human-readable label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Author, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// When the source was observed
    pub observed_at: DateTime<Utc>,
    /// Trust in this source, clamped to [0, 1]
    pub trust: f64,
    /// Content hash of the observed material
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

// ============================================================================
// MEMORY ROW
// ============================================================================

/// A memory row, hydrated
#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    /// Stable identifier (UUID v4)
    pub id: String,
    /// Memory kind
    pub kind: MemoryKind,
    /// Natural-language content
    pub content: String,
    /// Dense embedding; `None` until populated
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    /// Non-negative importance
    pub importance: f64,
    /// Exponential decay rate applied to importance over time
    pub decay_rate: f64,
    /// Times this memory has been touched
    pub access_count: i64,
    /// Lifecycle status
    pub status: MemoryStatus,
    /// Trust in [0, 1]
    pub trust_level: f64,
    /// Highest-trust source descriptor
    pub source_attribution: Value,
    /// Kind-specific structured fields
    pub metadata: Value,
    /// Transient boost from background searches
    pub activation_boost: f64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Last touch time
    pub last_accessed: DateTime<Utc>,
}

// ============================================================================
// SCORING
// ============================================================================

/// Age in fractional days
pub fn age_in_days(t: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - t).num_milliseconds() as f64 / 86_400_000.0
}

/// Decayed importance:
/// `importance * exp(-decay_rate * min(age_days, 0.5 * age_of_last_access_days))`.
/// Recent access halves the effective age, so touched memories fade slower.
pub fn relevance(
    importance: f64,
    decay_rate: f64,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let age = age_in_days(created_at, now).max(0.0);
    let access_age = age_in_days(last_accessed, now).max(0.0);
    importance * (-decay_rate * age.min(0.5 * access_age)).exp()
}

/// Recency boost in (0, 1], halving roughly weekly
pub fn recency_boost(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age = age_in_days(created_at, now).max(0.0);
    (-age / 7.0).exp()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            MemoryKind::Episodic,
            MemoryKind::Semantic,
            MemoryKind::Procedural,
            MemoryKind::Strategic,
            MemoryKind::Worldview,
            MemoryKind::Goal,
        ] {
            assert_eq!(MemoryKind::parse_name(kind.as_str()), Some(kind));
        }
        assert_eq!(MemoryKind::parse_name("nope"), None);
    }

    #[test]
    fn test_status_transitions_form_a_dag() {
        assert!(MemoryStatus::Active.can_transition_to(MemoryStatus::Archived));
        assert!(MemoryStatus::Active.can_transition_to(MemoryStatus::Invalidated));
        assert!(!MemoryStatus::Archived.can_transition_to(MemoryStatus::Active));
        assert!(!MemoryStatus::Invalidated.can_transition_to(MemoryStatus::Archived));
        assert!(!MemoryStatus::Archived.can_transition_to(MemoryStatus::Invalidated));
    }

    #[test]
    fn test_relevance_decays_with_age() {
        let now = Utc::now();
        let fresh = relevance(0.8, 0.01, now, now, now);
        assert!((fresh - 0.8).abs() < 1e-9);

        let day_old = relevance(0.8, 0.01, now - Duration::days(1), now - Duration::days(1), now);
        assert!(day_old < 0.8);
        assert!(day_old > 0.7);
    }

    #[test]
    fn test_relevance_recent_access_slows_decay() {
        let now = Utc::now();
        let created = now - Duration::days(100);
        let untouched = relevance(0.8, 0.05, created, created, now);
        let touched = relevance(0.8, 0.05, created, now - Duration::days(2), now);
        assert!(touched > untouched);
    }

    #[test]
    fn test_relevance_vanishes_far_past_decay_horizon() {
        let now = Utc::now();
        let created = now - Duration::days(10_000);
        let r = relevance(1.0, 0.01, created, created, now);
        assert!(r < 1e-9);
    }

    #[test]
    fn test_source_ref_serde_uses_ref_key() {
        let s = SourceRef {
            kind: "web".into(),
            reference: "https://example.com".into(),
            label: None,
            author: None,
            observed_at: Utc::now(),
            trust: 0.8,
            content_hash: None,
        };
        let v = serde_json::to_value(&s).unwrap();
        assert!(v.get("ref").is_some());
        assert!(v.get("reference").is_none());
    }
}
