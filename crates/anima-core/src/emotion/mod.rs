//! Emotional State
//!
//! A singleton VAD (valence/arousal/dominance) state plus intensity, with a
//! slower-moving mood. Every memory insertion stamps the current state into
//! its metadata as `emotional_context`; maintenance pulls mood toward the
//! valence of recent experience and the configured baseline.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::config;
use crate::storage::{Result, Storage};

// ============================================================================
// TYPES
// ============================================================================

/// The emotional state singleton
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmotionalState {
    /// Hedonic tone in [-1, 1]
    pub valence: f64,
    /// Activation in [0, 1]
    pub arousal: f64,
    /// Sense of control in [0, 1]
    pub dominance: f64,
    /// Strength of the current emotion in [0, 1]
    pub intensity: f64,
    /// Slow-moving valence
    pub mood_valence: f64,
    /// Slow-moving arousal
    pub mood_arousal: f64,
    /// Named dominant emotion
    pub primary_emotion: String,
    /// Last update, if ever updated
    pub updated_at: Option<DateTime<Utc>>,
}

/// An instantaneous emotional update
#[derive(Debug, Clone)]
pub struct EmotionalUpdate {
    /// Hedonic tone in [-1, 1]
    pub valence: f64,
    /// Activation in [0, 1]
    pub arousal: f64,
    /// Sense of control in [0, 1]
    pub dominance: f64,
    /// Strength in [0, 1]
    pub intensity: f64,
    /// Named dominant emotion
    pub primary_emotion: String,
}

/// A recurring emotion over the recent window
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmotionalPattern {
    /// The named emotion
    pub pattern: String,
    /// How often it appeared
    pub frequency: i64,
    /// Mean valence of the appearances
    pub avg_valence: f64,
}

// ============================================================================
// ROW HELPERS
// ============================================================================

pub(crate) fn emotional_state_tx(conn: &Connection) -> Result<EmotionalState> {
    Ok(conn.query_row(
        "SELECT valence, arousal, dominance, intensity, mood_valence, mood_arousal,
                primary_emotion, updated_at
         FROM emotional_state WHERE id = 1",
        [],
        |row| {
            Ok(EmotionalState {
                valence: row.get(0)?,
                arousal: row.get(1)?,
                dominance: row.get(2)?,
                intensity: row.get(3)?,
                mood_valence: row.get(4)?,
                mood_arousal: row.get(5)?,
                primary_emotion: row.get(6)?,
                updated_at: row.get(7)?,
            })
        },
    )?)
}

/// The context document stamped into every memory insertion
pub(crate) fn current_context_tx(conn: &Connection) -> Result<Value> {
    let state = emotional_state_tx(conn)?;
    Ok(json!({
        "valence": state.valence,
        "arousal": state.arousal,
        "dominance": state.dominance,
        "intensity": state.intensity,
        "primary_emotion": state.primary_emotion,
    }))
}

/// Pull mood toward the valence of recent episodic experience, blended with
/// the configured baseline. Returns the number of memories considered.
pub(crate) fn update_mood_from_recent_tx(conn: &Connection) -> Result<usize> {
    let baseline = config::get_config_tx(conn, "emotion.baseline")?;
    let baseline_valence = baseline
        .as_ref()
        .and_then(|b| b.get("valence").and_then(Value::as_f64))
        .unwrap_or(0.0);
    let baseline_arousal = baseline
        .as_ref()
        .and_then(|b| b.get("arousal").and_then(Value::as_f64))
        .unwrap_or(0.3);

    let cutoff = Utc::now() - Duration::hours(24);
    let mut stmt = conn.prepare(
        "SELECT metadata FROM memories
         WHERE kind = 'episodic' AND status = 'active' AND created_at >= ?1
         ORDER BY created_at DESC LIMIT 100",
    )?;
    let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;

    let mut total = 0.0f64;
    let mut count = 0usize;
    for row in rows {
        let metadata_raw = row?;
        if let Ok(metadata) = serde_json::from_str::<Value>(&metadata_raw) {
            if let Some(v) = metadata.get("emotional_valence").and_then(Value::as_f64) {
                total += v;
                count += 1;
            }
        }
    }

    let state = emotional_state_tx(conn)?;
    let target_valence = if count > 0 {
        0.7 * (total / count as f64) + 0.3 * baseline_valence
    } else {
        baseline_valence
    };
    let mood_valence = (state.mood_valence + 0.25 * (target_valence - state.mood_valence))
        .clamp(-1.0, 1.0);
    let mood_arousal = (state.mood_arousal + 0.25 * (baseline_arousal - state.mood_arousal))
        .clamp(0.0, 1.0);

    conn.execute(
        "UPDATE emotional_state SET mood_valence = ?1, mood_arousal = ?2, updated_at = ?3
         WHERE id = 1",
        params![mood_valence, mood_arousal, Utc::now()],
    )?;
    Ok(count)
}

// ============================================================================
// STORAGE SURFACE
// ============================================================================

impl Storage {
    /// Current emotional state
    pub fn emotional_state(&self) -> Result<EmotionalState> {
        self.with_reader(emotional_state_tx)
    }

    /// Replace the instantaneous emotional state (mood is untouched)
    pub fn update_emotional_state(&self, update: &EmotionalUpdate) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE emotional_state SET
                    valence = ?1, arousal = ?2, dominance = ?3, intensity = ?4,
                    primary_emotion = ?5, updated_at = ?6
                 WHERE id = 1",
                params![
                    update.valence.clamp(-1.0, 1.0),
                    update.arousal.clamp(0.0, 1.0),
                    update.dominance.clamp(0.0, 1.0),
                    update.intensity.clamp(0.0, 1.0),
                    update.primary_emotion,
                    Utc::now(),
                ],
            )?;
            Ok(())
        })
    }

    /// Frequency of named emotions stamped on recent memories
    pub fn recent_emotional_patterns(&self, limit: usize) -> Result<Vec<EmotionalPattern>> {
        self.with_reader(|conn| {
            let cutoff = Utc::now() - Duration::days(7);
            let mut stmt = conn.prepare(
                "SELECT metadata FROM memories
                 WHERE status = 'active' AND created_at >= ?1
                 ORDER BY created_at DESC LIMIT 500",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;

            let mut buckets: std::collections::BTreeMap<String, (i64, f64)> =
                std::collections::BTreeMap::new();
            for row in rows {
                let metadata_raw = row?;
                let Ok(metadata) = serde_json::from_str::<Value>(&metadata_raw) else {
                    continue;
                };
                let Some(context) = metadata.get("emotional_context") else {
                    continue;
                };
                let Some(emotion) = context.get("primary_emotion").and_then(Value::as_str) else {
                    continue;
                };
                let valence = context.get("valence").and_then(Value::as_f64).unwrap_or(0.0);
                let entry = buckets.entry(emotion.to_string()).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += valence;
            }

            let mut out: Vec<EmotionalPattern> = buckets
                .into_iter()
                .map(|(pattern, (frequency, total))| EmotionalPattern {
                    pattern,
                    avg_valence: total / frequency as f64,
                    frequency,
                })
                .collect();
            out.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.pattern.cmp(&b.pattern)));
            out.truncate(limit);
            Ok(out)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EpisodicInput, RememberInput};
    use crate::test_support::open_test_storage;
    use serde_json::json;

    #[test]
    fn test_default_state_is_neutral() {
        let (storage, _dir) = open_test_storage();
        let state = storage.emotional_state().unwrap();
        assert_eq!(state.valence, 0.0);
        assert_eq!(state.primary_emotion, "neutral");
        assert!(state.updated_at.is_none());
    }

    #[test]
    fn test_update_clamps_ranges() {
        let (storage, _dir) = open_test_storage();
        storage
            .update_emotional_state(&EmotionalUpdate {
                valence: 3.0,
                arousal: -1.0,
                dominance: 0.5,
                intensity: 2.0,
                primary_emotion: "joy".into(),
            })
            .unwrap();
        let state = storage.emotional_state().unwrap();
        assert_eq!(state.valence, 1.0);
        assert_eq!(state.arousal, 0.0);
        assert_eq!(state.intensity, 1.0);
        assert_eq!(state.primary_emotion, "joy");
    }

    #[test]
    fn test_insertions_are_stamped_with_current_emotion() {
        let (storage, _dir) = open_test_storage();
        storage
            .update_emotional_state(&EmotionalUpdate {
                valence: 0.6,
                arousal: 0.4,
                dominance: 0.5,
                intensity: 0.7,
                primary_emotion: "curiosity".into(),
            })
            .unwrap();
        let id = storage
            .remember(RememberInput {
                content: "stamped".into(),
                ..Default::default()
            })
            .unwrap();
        let memory = storage.get_memory(&id).unwrap().unwrap();
        let context = &memory.metadata["emotional_context"];
        assert_eq!(context["primary_emotion"], json!("curiosity"));
        assert_eq!(context["valence"], json!(0.6));
    }

    #[test]
    fn test_mood_moves_toward_recent_valence() {
        let (storage, _dir) = open_test_storage();
        for i in 0..5 {
            storage
                .create_episodic_memory(EpisodicInput {
                    content: format!("a good thing happened {i}"),
                    importance: 0.4,
                    emotional_valence: 0.9,
                    ..Default::default()
                })
                .unwrap();
        }
        let before = storage.emotional_state().unwrap().mood_valence;
        let considered = storage
            .with_writer(|conn| update_mood_from_recent_tx(conn))
            .unwrap();
        assert_eq!(considered, 5);
        let after = storage.emotional_state().unwrap().mood_valence;
        assert!(after > before);
    }

    #[test]
    fn test_emotional_patterns_grouped() {
        let (storage, _dir) = open_test_storage();
        storage
            .update_emotional_state(&EmotionalUpdate {
                valence: 0.5,
                arousal: 0.5,
                dominance: 0.5,
                intensity: 0.5,
                primary_emotion: "wonder".into(),
            })
            .unwrap();
        for i in 0..3 {
            storage
                .remember(RememberInput {
                    content: format!("wondering {i}"),
                    ..Default::default()
                })
                .unwrap();
        }
        let patterns = storage.recent_emotional_patterns(5).unwrap();
        assert_eq!(patterns[0].pattern, "wonder");
        assert_eq!(patterns[0].frequency, 3);
        assert!((patterns[0].avg_valence - 0.5).abs() < 1e-9);
    }
}
