//! Property Graph
//!
//! An adjunct index co-stored with the memory table: typed nodes and edges in
//! two SQLite tables. Memories, concepts, clusters, episodes, and goals are
//! one logical store with a write discipline (row, then node, then edges;
//! deletion reversed) and a maintenance sweep that repairs divergence.

pub mod episodes;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::memory::store::{memory_from_row, MEMORY_COLUMNS};
use crate::memory::Memory;
use crate::storage::{CoreError, Result, Storage};

// ============================================================================
// NODE / EDGE KINDS
// ============================================================================

/// Graph node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// One per memory row, keyed by memory id
    Memory,
    /// Keyed by concept name
    Concept,
    /// Keyed by cluster id
    Cluster,
    /// Keyed by episode id
    Episode,
    /// Keyed by goal memory id
    Goal,
    /// Singleton root for the goal tree
    GoalsRoot,
}

impl NodeKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Memory => "memory",
            NodeKind::Concept => "concept",
            NodeKind::Cluster => "cluster",
            NodeKind::Episode => "episode",
            NodeKind::Goal => "goal",
            NodeKind::GoalsRoot => "goals_root",
        }
    }
}

/// Graph edge kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Generic relatedness
    RelatesTo,
    /// Temporal or logical succession
    LeadsTo,
    /// The two endpoints conflict
    Contradicts,
    /// Source endpoint is evidence for the target
    Supports,
    /// Procedure implements a goal or strategy
    Implements,
    /// Loose association
    Associated,
    /// Source endpoint caused the target
    Causes,
    /// Memory -> concept
    InstanceOf,
    /// Memory -> cluster, carries membership_strength
    MemberOf,
    /// Goal -> parent goal
    SubgoalOf,
    /// Goal -> memory it originated from
    OriginatedFrom,
    /// Memory -> episode, carries sequence_order
    SequencedIn,
}

impl EdgeKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::RelatesTo => "RELATES_TO",
            EdgeKind::LeadsTo => "LEADS_TO",
            EdgeKind::Contradicts => "CONTRADICTS",
            EdgeKind::Supports => "SUPPORTS",
            EdgeKind::Implements => "IMPLEMENTS",
            EdgeKind::Associated => "ASSOCIATED",
            EdgeKind::Causes => "CAUSES",
            EdgeKind::InstanceOf => "INSTANCE_OF",
            EdgeKind::MemberOf => "MEMBER_OF",
            EdgeKind::SubgoalOf => "SUBGOAL_OF",
            EdgeKind::OriginatedFrom => "ORIGINATED_FROM",
            EdgeKind::SequencedIn => "SEQUENCED_IN",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "RELATES_TO" => Some(EdgeKind::RelatesTo),
            "LEADS_TO" => Some(EdgeKind::LeadsTo),
            "CONTRADICTS" => Some(EdgeKind::Contradicts),
            "SUPPORTS" => Some(EdgeKind::Supports),
            "IMPLEMENTS" => Some(EdgeKind::Implements),
            "ASSOCIATED" => Some(EdgeKind::Associated),
            "CAUSES" => Some(EdgeKind::Causes),
            "INSTANCE_OF" => Some(EdgeKind::InstanceOf),
            "MEMBER_OF" => Some(EdgeKind::MemberOf),
            "SUBGOAL_OF" => Some(EdgeKind::SubgoalOf),
            "ORIGINATED_FROM" => Some(EdgeKind::OriginatedFrom),
            "SEQUENCED_IN" => Some(EdgeKind::SequencedIn),
            _ => None,
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// NODE / EDGE PRIMITIVES
// ============================================================================

/// Find a node id by (kind, key)
pub(crate) fn find_node_tx(conn: &Connection, kind: NodeKind, key: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM graph_nodes WHERE kind = ?1 AND key = ?2",
            params![kind.as_str(), key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Find or create a node
pub(crate) fn ensure_node_tx(
    conn: &Connection,
    kind: NodeKind,
    key: &str,
    label: Option<&str>,
) -> Result<i64> {
    if let Some(id) = find_node_tx(conn, kind, key)? {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO graph_nodes (kind, key, label, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![kind.as_str(), key, label, Utc::now()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Ensure the MemoryNode for a memory row exists; `label` is the memory kind
pub(crate) fn sync_memory_node_tx(conn: &Connection, memory_id: &str, label: &str) -> Result<i64> {
    ensure_node_tx(conn, NodeKind::Memory, memory_id, Some(label))
}

/// Remove a memory's node; edges cascade with it
pub(crate) fn detach_memory_node_tx(conn: &Connection, memory_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM graph_nodes WHERE kind = 'memory' AND key = ?1",
        params![memory_id],
    )?;
    Ok(())
}

/// Create or update an edge. An existing (src, dst, kind) edge has its
/// strength and properties replaced.
pub(crate) fn upsert_edge_tx(
    conn: &Connection,
    src: i64,
    dst: i64,
    kind: EdgeKind,
    strength: f64,
    properties: Option<&Value>,
) -> Result<i64> {
    let props = match properties {
        Some(v) => serde_json::to_string(v)?,
        None => "{}".to_string(),
    };
    conn.execute(
        "INSERT INTO graph_edges (src, dst, kind, strength, properties, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(src, dst, kind) DO UPDATE SET
             strength = excluded.strength,
             properties = excluded.properties",
        params![src, dst, kind.as_str(), strength, props, Utc::now()],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM graph_edges WHERE src = ?1 AND dst = ?2 AND kind = ?3",
        params![src, dst, kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn memory_node_or_err(conn: &Connection, memory_id: &str) -> Result<i64> {
    find_node_tx(conn, NodeKind::Memory, memory_id)?
        .ok_or_else(|| CoreError::NotFound(format!("graph node for memory {memory_id}")))
}

fn hydrate_memory(conn: &Connection, memory_id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![memory_id], memory_from_row)
        .optional()?)
}

// ============================================================================
// TRAVERSALS
// ============================================================================

/// A memory connected through a typed edge
#[derive(Debug, Clone)]
pub struct LinkedMemory {
    /// The memory at the far end
    pub memory: Memory,
    /// Edge strength (membership strength, confidence, ...)
    pub strength: f64,
    /// Hops from the origin (1 for direct edges)
    pub depth: u32,
}

/// A contradiction pair surfaced for the decision context
#[derive(Debug, Clone)]
pub struct Contradiction {
    /// One side
    pub memory_a: Memory,
    /// The other side
    pub memory_b: Memory,
    /// Confidence of the contradiction edge
    pub confidence: f64,
}

impl Storage {
    /// Public lookup used by callers that need to check graph consistency
    pub fn find_graph_node(&self, kind: NodeKind, key: &str) -> Result<Option<i64>> {
        self.with_reader(|conn| find_node_tx(conn, kind, key))
    }

    /// Create a typed relationship between two existing memories
    pub fn create_memory_relationship(
        &self,
        from_memory: &str,
        to_memory: &str,
        kind: EdgeKind,
        strength: f64,
        properties: Option<Value>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let src = memory_node_or_err(tx, from_memory)?;
            let dst = memory_node_or_err(tx, to_memory)?;
            upsert_edge_tx(tx, src, dst, kind, strength, properties.as_ref())?;
            Ok(())
        })
    }

    /// Link a memory to a named concept via INSTANCE_OF
    pub fn link_memory_to_concept(
        &self,
        memory_id: &str,
        concept: &str,
        strength: f64,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let src = memory_node_or_err(tx, memory_id)?;
            let dst = ensure_node_tx(tx, NodeKind::Concept, concept, Some(concept))?;
            upsert_edge_tx(tx, src, dst, EdgeKind::InstanceOf, strength, None)?;
            Ok(())
        })
    }

    /// Memories linked to a concept, strongest edges first
    pub fn find_by_concept(&self, concept: &str, limit: usize) -> Result<Vec<LinkedMemory>> {
        self.with_reader(|conn| {
            let Some(concept_node) = find_node_tx(conn, NodeKind::Concept, concept)? else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT n.key, e.strength FROM graph_edges e
                 JOIN graph_nodes n ON n.id = e.src
                 WHERE e.dst = ?1 AND e.kind = 'INSTANCE_OF' AND n.kind = 'memory'
                 ORDER BY e.strength DESC, n.key ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![concept_node, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (memory_id, strength) = row?;
                if let Some(memory) = hydrate_memory(conn, &memory_id)? {
                    out.push(LinkedMemory {
                        memory,
                        strength,
                        depth: 1,
                    });
                }
            }
            Ok(out)
        })
    }

    /// Bounded reverse traversal of CAUSES: what led to `target`?
    pub fn find_causes(&self, target_memory: &str, max_depth: u32) -> Result<Vec<LinkedMemory>> {
        self.with_reader(|conn| {
            let Some(target) = find_node_tx(conn, NodeKind::Memory, target_memory)? else {
                return Ok(Vec::new());
            };
            let mut frontier = vec![target];
            let mut seen = std::collections::HashSet::from([target]);
            let mut out = Vec::new();

            for depth in 1..=max_depth.max(1) {
                let mut next = Vec::new();
                for node in &frontier {
                    let mut stmt = conn.prepare(
                        "SELECT e.src, n.key, e.strength FROM graph_edges e
                         JOIN graph_nodes n ON n.id = e.src
                         WHERE e.dst = ?1 AND e.kind = 'CAUSES' AND n.kind = 'memory'
                         ORDER BY n.key ASC",
                    )?;
                    let rows = stmt.query_map(params![node], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                        ))
                    })?;
                    for row in rows {
                        let (src, memory_id, strength) = row?;
                        if !seen.insert(src) {
                            continue;
                        }
                        if let Some(memory) = hydrate_memory(conn, &memory_id)? {
                            out.push(LinkedMemory {
                                memory,
                                strength,
                                depth,
                            });
                        }
                        next.push(src);
                    }
                }
                if next.is_empty() {
                    break;
                }
                frontier = next;
            }
            Ok(out)
        })
    }

    /// Memories contradicting `memory_id` (either edge direction)
    pub fn find_contradictions(&self, memory_id: &str) -> Result<Vec<LinkedMemory>> {
        self.with_reader(|conn| {
            let Some(node) = find_node_tx(conn, NodeKind::Memory, memory_id)? else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT n.key, e.strength FROM graph_edges e
                 JOIN graph_nodes n
                   ON n.id = CASE WHEN e.src = ?1 THEN e.dst ELSE e.src END
                 WHERE (e.src = ?1 OR e.dst = ?1) AND e.kind = 'CONTRADICTS'
                   AND n.kind = 'memory'
                 ORDER BY e.strength DESC, n.key ASC",
            )?;
            let rows = stmt.query_map(params![node], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (other_id, strength) = row?;
                if other_id == memory_id {
                    continue;
                }
                if let Some(memory) = hydrate_memory(conn, &other_id)? {
                    out.push(LinkedMemory {
                        memory,
                        strength,
                        depth: 1,
                    });
                }
            }
            Ok(out)
        })
    }

    /// Inbound SUPPORTS evidence for a worldview memory
    pub fn find_supporting_evidence(&self, worldview_id: &str) -> Result<Vec<LinkedMemory>> {
        self.with_reader(|conn| supporting_evidence_tx(conn, worldview_id))
    }

    /// Recent contradiction pairs for the decision context
    pub fn list_recent_contradictions(&self, limit: usize) -> Result<Vec<Contradiction>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT a.key, b.key, e.strength FROM graph_edges e
                 JOIN graph_nodes a ON a.id = e.src
                 JOIN graph_nodes b ON b.id = e.dst
                 WHERE e.kind = 'CONTRADICTS' AND a.kind = 'memory' AND b.kind = 'memory'
                 ORDER BY e.created_at DESC, e.id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (a, b, confidence) = row?;
                let (Some(memory_a), Some(memory_b)) =
                    (hydrate_memory(conn, &a)?, hydrate_memory(conn, &b)?)
                else {
                    continue;
                };
                out.push(Contradiction {
                    memory_a,
                    memory_b,
                    confidence,
                });
            }
            Ok(out)
        })
    }
}

pub(crate) fn supporting_evidence_tx(
    conn: &Connection,
    worldview_id: &str,
) -> Result<Vec<LinkedMemory>> {
    let Some(node) = find_node_tx(conn, NodeKind::Memory, worldview_id)? else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(
        "SELECT n.key, e.strength FROM graph_edges e
         JOIN graph_nodes n ON n.id = e.src
         WHERE e.dst = ?1 AND e.kind = 'SUPPORTS' AND n.kind = 'memory'
         ORDER BY e.strength DESC, n.key ASC",
    )?;
    let rows = stmt.query_map(params![node], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (memory_id, strength) = row?;
        if let Some(memory) = hydrate_memory(conn, &memory_id)? {
            out.push(LinkedMemory {
                memory,
                strength,
                depth: 1,
            });
        }
    }
    Ok(out)
}

// ============================================================================
// INVARIANT SWEEP
// ============================================================================

/// Repair table/graph divergence: drop memory nodes whose row is gone and
/// create nodes for rows that lost theirs. Returns (dropped, created).
pub(crate) fn repair_graph_tx(conn: &Connection) -> Result<(usize, usize)> {
    let dropped = conn.execute(
        "DELETE FROM graph_nodes
         WHERE kind = 'memory' AND key NOT IN (SELECT id FROM memories)",
        [],
    )?;

    let mut created = 0usize;
    let missing: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, kind FROM memories
             WHERE id NOT IN (SELECT key FROM graph_nodes WHERE kind = 'memory')",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for (memory_id, kind) in missing {
        sync_memory_node_tx(conn, &memory_id, &kind)?;
        created += 1;
    }
    Ok((dropped, created))
}

// ============================================================================
// TESTS
// ============================================================================
