//! Decision Context
//!
//! Everything the external decision call gets to see about the agent's
//! current situation, composed from the store in one read pass.

use chrono::{Datelike, Timelike, Utc};
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::config::{self, HeartbeatSettings};
use crate::drives::urgent_drives_tx;
use crate::emotion::emotional_state_tx;
use crate::goals::{goal_counts_tx, goal_issues_tx, list_goals_tx, GoalPriority};
use crate::heartbeat::executor::ActionKind;
use crate::heartbeat::{current_energy_tx, heartbeat_count_tx};
use crate::memory::store::{memory_from_row, MEMORY_COLUMNS};
use crate::memory::{recency_boost, Memory};
use crate::storage::{Result, Storage};

fn memory_brief(m: &Memory) -> Value {
    json!({
        "id": m.id,
        "kind": m.kind.as_str(),
        "content": m.content,
        "importance": m.importance,
    })
}

fn recent_memories_tx(conn: &Connection, limit: usize) -> Result<Vec<Memory>> {
    let now = Utc::now();
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE status = 'active'
         ORDER BY created_at DESC LIMIT 200"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], memory_from_row)?;
    let mut scored: Vec<(f64, Memory)> = Vec::new();
    for row in rows {
        let memory = row?;
        let score = recency_boost(memory.created_at, now) * memory.importance;
        scored.push((score, memory));
    }
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    Ok(scored.into_iter().take(limit).map(|(_, m)| m).collect())
}

fn worldview_snapshot_tx(conn: &Connection, categories: &[&str], limit: usize) -> Result<Vec<Value>> {
    let placeholders: Vec<String> = (1..=categories.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, content, json_extract(metadata, '$.category'),
                COALESCE(json_extract(metadata, '$.confidence'), 0.5)
         FROM memories
         WHERE kind = 'worldview' AND status = 'active'
           AND json_extract(metadata, '$.category') IN ({})
         ORDER BY COALESCE(json_extract(metadata, '$.confidence'), 0.5) DESC, id ASC
         LIMIT {}",
        placeholders.join(", "),
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(categories.iter()), |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "belief": row.get::<_, String>(1)?,
            "category": row.get::<_, Option<String>>(2)?,
            "confidence": row.get::<_, f64>(3)?,
        }))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Concepts tied to identity and personality worldview memories, strongest
/// aggregate INSTANCE_OF links first.
fn self_model_tx(conn: &Connection, limit: usize) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT c.key, SUM(e.strength) AS total
         FROM graph_edges e
         JOIN graph_nodes mn ON mn.id = e.src AND mn.kind = 'memory'
         JOIN graph_nodes c ON c.id = e.dst AND c.kind = 'concept'
         JOIN memories m ON m.id = mn.key
         WHERE e.kind = 'INSTANCE_OF' AND m.kind = 'worldview'
           AND json_extract(m.metadata, '$.category') IN ('identity', 'personality')
         GROUP BY c.key
         ORDER BY total DESC, c.key ASC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(json!({
            "kind": "associated",
            "concept": row.get::<_, String>(0)?,
            "strength": row.get::<_, f64>(1)?,
        }))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Compose the decision context document
pub(crate) fn build_decision_context_tx(
    conn: &Connection,
    settings: &HeartbeatSettings,
    heartbeat_id: &str,
) -> Result<Value> {
    let now = Utc::now();

    let recent: Vec<Value> = recent_memories_tx(conn, 10)?
        .iter()
        .map(memory_brief)
        .collect();

    let active = list_goals_tx(conn, GoalPriority::Active, 10)?;
    let queued = list_goals_tx(conn, GoalPriority::Queued, 10)?;
    let counts = goal_counts_tx(conn)?;
    let issues = goal_issues_tx(conn, settings)?;
    let goal_brief = |g: &crate::goals::Goal| {
        json!({
            "id": g.memory.id,
            "title": g.title,
            "due_at": g.due_at.map(|d| d.to_rfc3339()),
        })
    };

    let identity = worldview_snapshot_tx(conn, &["identity", "personality"], 5)?;
    let worldview = worldview_snapshot_tx(conn, &["belief", "value", "boundary"], 8)?;
    let relationships: Vec<Value> = worldview_snapshot_tx(conn, &["relationship"], 5)?
        .into_iter()
        .map(|w| {
            json!({
                "entity": w["belief"],
                "strength": w["confidence"],
            })
        })
        .collect();

    let contradictions: Vec<Value> = {
        let mut stmt = conn.prepare(
            "SELECT a.key, b.key, ma.content, mb.content FROM graph_edges e
             JOIN graph_nodes a ON a.id = e.src AND a.kind = 'memory'
             JOIN graph_nodes b ON b.id = e.dst AND b.kind = 'memory'
             JOIN memories ma ON ma.id = a.key
             JOIN memories mb ON mb.id = b.key
             WHERE e.kind = 'CONTRADICTS'
             ORDER BY e.created_at DESC, e.id DESC LIMIT 5",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(json!({
                "memory_a": row.get::<_, String>(0)?,
                "memory_b": row.get::<_, String>(1)?,
                "content_a": row.get::<_, String>(2)?,
                "content_b": row.get::<_, String>(3)?,
            }))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let emotional_patterns: Vec<Value> = {
        // Inline aggregation mirrors Storage::recent_emotional_patterns
        let cutoff = now - chrono::Duration::days(7);
        let mut stmt = conn.prepare(
            "SELECT json_extract(metadata, '$.emotional_context.primary_emotion') AS emotion,
                    COUNT(*) AS freq
             FROM memories
             WHERE status = 'active' AND created_at >= ?1
               AND json_extract(metadata, '$.emotional_context.primary_emotion') IS NOT NULL
             GROUP BY emotion ORDER BY freq DESC, emotion ASC LIMIT 5",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok(json!({
                "pattern": row.get::<_, String>(0)?,
                "frequency": row.get::<_, i64>(1)?,
            }))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let (active_transformations, transformations_ready) = {
        let ids = crate::memory::transformation::active_exploration_ids_tx(conn)?;
        let mut active = Vec::new();
        let mut ready = Vec::new();
        for id in ids.into_iter().take(5) {
            let progress = crate::memory::transformation::progress_for_tx(conn, &id)?;
            let doc = serde_json::to_value(&progress)?;
            if progress.ready {
                ready.push(doc.clone());
            }
            active.push(doc);
        }
        (active, ready)
    };

    let emotional_state = emotional_state_tx(conn)?;
    let drives = urgent_drives_tx(conn)?;
    let energy = current_energy_tx(conn)?;
    let heartbeat_number = heartbeat_count_tx(conn)? + 1;

    let pending_events: i64 = conn.query_row(
        "SELECT COUNT(*) FROM external_calls WHERE status IN ('pending', 'in_flight')",
        [],
        |row| row.get(0),
    )?;

    let allowed = match &settings.allowed_actions {
        Some(list) => list.clone(),
        None => ActionKind::ALL.iter().map(|a| a.as_str().to_string()).collect(),
    };
    let mut action_costs = serde_json::Map::new();
    for action in ActionKind::ALL {
        let name = action.as_str();
        if allowed.iter().any(|a| a == name) {
            action_costs.insert(name.to_string(), json!(action.effective_cost(settings)));
        }
    }

    let narrative = config::get_config_tx(conn, "agent.narrative")?
        .unwrap_or_else(|| json!({ "current_chapter": { "name": "Foundations" } }));

    let last_user_interaction = config::get_config_tx(conn, "user.last_interaction_at")?;

    Ok(json!({
        "heartbeat_id": heartbeat_id,
        "heartbeat_number": heartbeat_number,
        "agent": {
            "objectives": config::get_config_tx(conn, "agent.objectives")?.unwrap_or(json!([])),
            "guardrails": config::get_config_tx(conn, "agent.guardrails")?.unwrap_or(json!([])),
            "tools": config::get_config_tx(conn, "agent.tools")?.unwrap_or(json!([])),
            "budget": {
                "max_energy": settings.max_energy,
                "base_regeneration": settings.base_regeneration,
                "heartbeat_interval_minutes": settings.interval_minutes,
                "max_active_goals": settings.max_active_goals,
            },
        },
        "environment": {
            "timestamp": now.to_rfc3339(),
            "day_of_week": now.weekday().to_string(),
            "hour_of_day": now.hour(),
            "pending_events": pending_events,
            "last_user_interaction": last_user_interaction,
        },
        "goals": {
            "active": active.iter().map(goal_brief).collect::<Vec<_>>(),
            "queued": queued.iter().map(goal_brief).collect::<Vec<_>>(),
            "counts": counts
                .iter()
                .map(|(p, n)| (p.as_str().to_string(), json!(n)))
                .collect::<serde_json::Map<_, _>>(),
            "issues": serde_json::to_value(&issues)?,
        },
        "recent_memories": recent,
        "identity": identity,
        "worldview": worldview,
        "self_model": self_model_tx(conn, 8)?,
        "narrative": narrative,
        "relationships": relationships,
        "contradictions": contradictions,
        "emotional_patterns": emotional_patterns,
        "active_transformations": active_transformations,
        "transformations_ready": transformations_ready,
        "emotional_state": {
            "valence": emotional_state.valence,
            "arousal": emotional_state.arousal,
            "intensity": emotional_state.intensity,
            "primary_emotion": emotional_state.primary_emotion,
            "mood_valence": emotional_state.mood_valence,
        },
        "urgent_drives": serde_json::to_value(&drives)?,
        "energy": { "current": energy, "max": settings.max_energy },
        "allowed_actions": allowed,
        "action_costs": Value::Object(action_costs),
    }))
}

impl Storage {
    /// The full decision context, as handed to the decision call. Exposed so
    /// operators can inspect what the agent currently sees.
    pub fn decision_context_preview(&self) -> Result<Value> {
        let settings = self.heartbeat_settings()?;
        self.with_reader(|conn| build_decision_context_tx(conn, &settings, "preview"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
