//! Goals
//!
//! Goals are memories of kind `goal` whose lifecycle lives in metadata
//! (`priority` doubles as the lifecycle phase). Each goal also owns a
//! GoalNode under the GoalsRoot singleton, with SUBGOAL_OF edges for
//! hierarchy and ORIGINATED_FROM edges back to the memories that spawned it.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::HeartbeatSettings;
use crate::graph::{ensure_node_tx, find_node_tx, upsert_edge_tx, EdgeKind, NodeKind};
use crate::memory::store::{get_memory_tx, insert_memory_tx, memory_from_row, MEMORY_COLUMNS};
use crate::memory::{Memory, MemoryKind, MemoryStatus, RememberInput};
use crate::storage::{CoreError, Result, Storage};

// ============================================================================
// TYPES
// ============================================================================

/// Goal lifecycle phase, stored as `metadata.priority`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GoalPriority {
    /// Waiting to be picked up
    #[default]
    Queued,
    /// Deliberately parked
    Backburner,
    /// Being pursued
    Active,
    /// Done
    Completed,
    /// Given up
    Abandoned,
}

impl GoalPriority {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalPriority::Queued => "queued",
            GoalPriority::Backburner => "backburner",
            GoalPriority::Active => "active",
            GoalPriority::Completed => "completed",
            GoalPriority::Abandoned => "abandoned",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(GoalPriority::Queued),
            "backburner" => Some(GoalPriority::Backburner),
            "active" => Some(GoalPriority::Active),
            "completed" => Some(GoalPriority::Completed),
            "abandoned" => Some(GoalPriority::Abandoned),
            _ => None,
        }
    }

    /// Whether the goal is still open
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            GoalPriority::Queued | GoalPriority::Backburner | GoalPriority::Active
        )
    }
}

/// Input for creating a goal
#[derive(Debug, Clone, Default)]
pub struct CreateGoal {
    /// Short title
    pub title: String,
    /// Longer description
    pub description: Option<String>,
    /// Where it came from: 'curiosity', 'user_request', 'identity', 'derived', 'external'
    pub source: String,
    /// Initial lifecycle phase
    pub priority: GoalPriority,
    /// Parent goal memory id
    pub parent_goal_id: Option<String>,
    /// Memory this goal originated from
    pub originated_from: Option<String>,
    /// Deadline
    pub due_at: Option<DateTime<Utc>>,
}

/// A hydrated goal
#[derive(Debug, Clone)]
pub struct Goal {
    /// Backing memory
    pub memory: Memory,
    /// Title from metadata
    pub title: String,
    /// Lifecycle phase
    pub priority: GoalPriority,
    /// Deadline, if set
    pub due_at: Option<DateTime<Utc>>,
}

/// A requested change to a goal, as produced by heartbeat decisions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalChange {
    /// Target goal memory id
    pub goal_id: String,
    /// 'completed', 'abandoned', or 'priority_change'
    pub change: String,
    /// Why
    #[serde(default)]
    pub reason: Option<String>,
    /// New phase for 'priority_change'
    #[serde(default)]
    pub new_priority: Option<GoalPriority>,
}

/// A problem with the current goal set, surfaced to the decision context
#[derive(Debug, Clone, Serialize)]
pub struct GoalIssue {
    /// Offending goal id (absent for set-wide issues)
    pub goal_id: Option<String>,
    /// Title for display
    pub title: String,
    /// What is wrong
    pub issue: String,
}

/// A goal memory's content: title, with the description folded in when given
pub(crate) fn goal_content(title: &str, description: Option<&str>) -> String {
    match description {
        Some(d) if !d.is_empty() => format!("{title}: {d}"),
        _ => title.to_string(),
    }
}

fn goal_from_memory(memory: Memory) -> Goal {
    let title = memory
        .metadata
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(&memory.content)
        .to_string();
    let priority = memory
        .metadata
        .get("priority")
        .and_then(Value::as_str)
        .and_then(GoalPriority::parse_name)
        .unwrap_or_default();
    let due_at = memory
        .metadata
        .get("due_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Goal {
        title,
        priority,
        due_at,
        memory,
    }
}

// ============================================================================
// STORAGE SURFACE
// ============================================================================

impl Storage {
    /// Create a goal memory plus its GoalNode under GoalsRoot
    pub fn create_goal(&self, input: CreateGoal) -> Result<String> {
        if input.title.trim().is_empty() {
            return Err(CoreError::InvalidInput("goal title is empty".into()));
        }
        let content = goal_content(&input.title, input.description.as_deref());
        let embedding = self.get_embedding(&content).ok();
        self.with_tx(|tx| create_goal_tx(tx, &input, &content, embedding.as_deref()))
    }

    /// Goals in a given phase, most recently updated first
    pub fn list_goals(&self, priority: GoalPriority, limit: usize) -> Result<Vec<Goal>> {
        self.with_reader(|conn| list_goals_tx(conn, priority, limit))
    }

    /// Count of goals per phase
    pub fn goal_counts(&self) -> Result<Vec<(GoalPriority, i64)>> {
        self.with_reader(goal_counts_tx)
    }

    /// Apply one goal change. Completing or abandoning archives the goal
    /// memory; a priority change rewrites the phase.
    pub fn apply_goal_change(&self, change: &GoalChange) -> Result<()> {
        self.with_tx(|tx| apply_goal_change_tx(tx, change))
    }

    /// Append a progress note to a goal
    pub fn record_goal_progress(&self, goal_id: &str, note: &str) -> Result<()> {
        self.with_tx(|tx| {
            let memory = get_memory_tx(tx, goal_id)?
                .ok_or_else(|| CoreError::NotFound(format!("goal {goal_id}")))?;
            let mut metadata = memory.metadata;
            let mut progress = metadata
                .get("progress")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            progress.push(json!({
                "at": Utc::now().to_rfc3339(),
                "note": note,
            }));
            metadata["progress"] = Value::Array(progress);
            tx.execute(
                "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&metadata)?, Utc::now(), goal_id],
            )?;
            Ok(())
        })
    }

    /// Direct subgoals of a goal
    pub fn list_subgoals(&self, goal_id: &str) -> Result<Vec<Goal>> {
        self.with_reader(|conn| {
            let Some(parent) = find_node_tx(conn, NodeKind::Goal, goal_id)? else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT n.key FROM graph_edges e
                 JOIN graph_nodes n ON n.id = e.src
                 WHERE e.dst = ?1 AND e.kind = 'SUBGOAL_OF' AND n.kind = 'goal'
                 ORDER BY n.key",
            )?;
            let rows = stmt.query_map(params![parent], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                let id = row?;
                if let Some(memory) = get_memory_tx(conn, &id)? {
                    out.push(goal_from_memory(memory));
                }
            }
            Ok(out)
        })
    }
}

// ============================================================================
// TX HELPERS
// ============================================================================

pub(crate) fn create_goal_tx(
    tx: &Transaction<'_>,
    input: &CreateGoal,
    content: &str,
    embedding: Option<&[f32]>,
) -> Result<String> {
    let metadata = json!({
        "title": input.title,
        "description": input.description,
        "priority": input.priority.as_str(),
        "source": if input.source.is_empty() { "derived" } else { input.source.as_str() },
        "progress": [],
        "due_at": input.due_at.map(|d| d.to_rfc3339()),
    });
    let remember = RememberInput {
        content: content.to_string(),
        kind: MemoryKind::Goal,
        importance: 0.6,
        metadata,
        ..Default::default()
    };
    let goal_id = insert_memory_tx(tx, &remember, embedding, Utc::now())?;

    let goal_node = ensure_node_tx(tx, NodeKind::Goal, &goal_id, Some(&input.title))?;
    let parent_node = match &input.parent_goal_id {
        Some(parent_id) => find_node_tx(tx, NodeKind::Goal, parent_id)?
            .ok_or_else(|| CoreError::NotFound(format!("parent goal {parent_id}")))?,
        None => ensure_node_tx(tx, NodeKind::GoalsRoot, "root", Some("goals"))?,
    };
    upsert_edge_tx(tx, goal_node, parent_node, EdgeKind::SubgoalOf, 1.0, None)?;

    if let Some(origin) = &input.originated_from {
        let origin_node = find_node_tx(tx, NodeKind::Memory, origin)?
            .ok_or_else(|| CoreError::NotFound(format!("origin memory {origin}")))?;
        upsert_edge_tx(tx, goal_node, origin_node, EdgeKind::OriginatedFrom, 1.0, None)?;
    }
    Ok(goal_id)
}

pub(crate) fn list_goals_tx(
    conn: &Connection,
    priority: GoalPriority,
    limit: usize,
) -> Result<Vec<Goal>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories
         WHERE kind = 'goal' AND json_extract(metadata, '$.priority') = ?1
         ORDER BY updated_at DESC, id ASC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![priority.as_str(), limit as i64], memory_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(goal_from_memory(row?));
    }
    Ok(out)
}

pub(crate) fn goal_counts_tx(conn: &Connection) -> Result<Vec<(GoalPriority, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT json_extract(metadata, '$.priority'), COUNT(*)
         FROM memories WHERE kind = 'goal'
         GROUP BY json_extract(metadata, '$.priority')",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (raw, count) = row?;
        if let Some(priority) = raw.as_deref().and_then(GoalPriority::parse_name) {
            out.push((priority, count));
        }
    }
    out.sort_by_key(|(p, _)| p.as_str());
    Ok(out)
}

pub(crate) fn apply_goal_change_tx(tx: &Transaction<'_>, change: &GoalChange) -> Result<()> {
    let memory = get_memory_tx(tx, &change.goal_id)?
        .ok_or_else(|| CoreError::NotFound(format!("goal {}", change.goal_id)))?;
    if memory.kind != MemoryKind::Goal {
        return Err(CoreError::InvalidInput(format!(
            "memory {} is {}, not a goal",
            change.goal_id, memory.kind
        )));
    }

    let new_priority = match change.change.as_str() {
        "completed" => GoalPriority::Completed,
        "abandoned" => GoalPriority::Abandoned,
        "priority_change" => change.new_priority.ok_or_else(|| {
            CoreError::InvalidInput("priority_change without new_priority".into())
        })?,
        other => {
            return Err(CoreError::InvalidInput(format!(
                "unknown goal change '{other}'"
            )))
        }
    };

    let mut metadata = memory.metadata;
    metadata["priority"] = json!(new_priority.as_str());
    let mut progress = metadata
        .get("progress")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    progress.push(json!({
        "at": Utc::now().to_rfc3339(),
        "change": change.change,
        "reason": change.reason,
    }));
    metadata["progress"] = Value::Array(progress);

    tx.execute(
        "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&metadata)?, Utc::now(), change.goal_id],
    )?;

    if !new_priority.is_open() && memory.status == MemoryStatus::Active {
        crate::memory::store::set_memory_status_tx(tx, &change.goal_id, MemoryStatus::Archived)?;
    }
    Ok(())
}

/// Problems with the current goal set, for the decision context
pub(crate) fn goal_issues_tx(
    conn: &Connection,
    settings: &HeartbeatSettings,
) -> Result<Vec<GoalIssue>> {
    let mut issues = Vec::new();
    let active = list_goals_tx(conn, GoalPriority::Active, 100)?;
    if active.len() > settings.max_active_goals {
        issues.push(GoalIssue {
            goal_id: None,
            title: "goal load".to_string(),
            issue: format!(
                "{} active goals exceed the limit of {}",
                active.len(),
                settings.max_active_goals
            ),
        });
    }
    let now = Utc::now();
    for goal in &active {
        if now - goal.memory.updated_at > Duration::days(14) {
            issues.push(GoalIssue {
                goal_id: Some(goal.memory.id.clone()),
                title: goal.title.clone(),
                issue: "no progress in 14 days".to_string(),
            });
        }
        if let Some(due) = goal.due_at {
            if due < now {
                issues.push(GoalIssue {
                    goal_id: Some(goal.memory.id.clone()),
                    title: goal.title.clone(),
                    issue: "past its deadline".to_string(),
                });
            }
        }
    }
    Ok(issues)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_test_storage;

    fn quick_goal(storage: &Storage, title: &str, priority: GoalPriority) -> String {
        storage
            .create_goal(CreateGoal {
                title: title.into(),
                source: "curiosity".into(),
                priority,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_create_goal_builds_graph() {
        let (storage, _dir) = open_test_storage();
        let parent = quick_goal(&storage, "learn sailing", GoalPriority::Active);
        let child = storage
            .create_goal(CreateGoal {
                title: "buy a compass".into(),
                source: "derived".into(),
                parent_goal_id: Some(parent.clone()),
                ..Default::default()
            })
            .unwrap();

        assert!(storage.find_graph_node(NodeKind::Goal, &parent).unwrap().is_some());
        assert!(storage.find_graph_node(NodeKind::GoalsRoot, "root").unwrap().is_some());

        let subgoals = storage.list_subgoals(&parent).unwrap();
        assert_eq!(subgoals.len(), 1);
        assert_eq!(subgoals[0].memory.id, child);
    }

    #[test]
    fn test_completed_change_archives_goal() {
        let (storage, _dir) = open_test_storage();
        let goal = quick_goal(&storage, "finish the report", GoalPriority::Active);
        storage
            .apply_goal_change(&GoalChange {
                goal_id: goal.clone(),
                change: "completed".into(),
                reason: Some("done".into()),
                new_priority: None,
            })
            .unwrap();

        let memory = storage.get_memory(&goal).unwrap().unwrap();
        assert_eq!(memory.metadata["priority"], serde_json::json!("completed"));
        assert_eq!(memory.status, MemoryStatus::Archived);
        let progress = memory.metadata["progress"].as_array().unwrap();
        assert_eq!(progress.len(), 1);
    }

    #[test]
    fn test_priority_change_requires_target() {
        let (storage, _dir) = open_test_storage();
        let goal = quick_goal(&storage, "stretch", GoalPriority::Queued);
        let err = storage
            .apply_goal_change(&GoalChange {
                goal_id: goal.clone(),
                change: "priority_change".into(),
                reason: None,
                new_priority: None,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        storage
            .apply_goal_change(&GoalChange {
                goal_id: goal.clone(),
                change: "priority_change".into(),
                reason: None,
                new_priority: Some(GoalPriority::Active),
            })
            .unwrap();
        let listed = storage.list_goals(GoalPriority::Active, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].memory.id, goal);
    }

    #[test]
    fn test_goal_counts_and_issues() {
        let (storage, _dir) = open_test_storage();
        for i in 0..4 {
            quick_goal(&storage, &format!("active {i}"), GoalPriority::Active);
        }
        quick_goal(&storage, "parked", GoalPriority::Backburner);

        let counts = storage.goal_counts().unwrap();
        let active_count = counts
            .iter()
            .find(|(p, _)| *p == GoalPriority::Active)
            .map(|(_, n)| *n)
            .unwrap();
        assert_eq!(active_count, 4);

        let settings = storage.heartbeat_settings().unwrap();
        let issues = storage
            .with_reader(|conn| goal_issues_tx(conn, &settings))
            .unwrap();
        assert!(issues.iter().any(|i| i.issue.contains("exceed the limit")));
    }
}
