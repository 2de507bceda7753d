//! Clusters
//!
//! Thematic groupings over the memory space. A cluster row owns a centroid
//! embedding; membership is MEMBER_OF edges in the graph carrying a
//! `membership_strength`. Membership changes mark the cluster dirty so
//! maintenance recomputes centroids lazily.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::embeddings::{cosine_similarity, mean_vector, Embedding};
use crate::graph::{ensure_node_tx, find_node_tx, upsert_edge_tx, EdgeKind, NodeKind};
use crate::memory::store::{memory_from_row, MEMORY_COLUMNS};
use crate::memory::Memory;
use crate::storage::{CoreError, Result, Storage};

// ============================================================================
// TYPES
// ============================================================================

/// Cluster classification
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    /// Topical grouping
    Theme,
    /// Emotional tone grouping
    Emotion,
    /// Time-window grouping
    Temporal,
    /// Person-centric grouping
    Person,
    /// Recurring behavioral pattern
    Pattern,
    /// Catch-all
    Mixed,
}

impl ClusterType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Theme => "theme",
            ClusterType::Emotion => "emotion",
            ClusterType::Temporal => "temporal",
            ClusterType::Person => "person",
            ClusterType::Pattern => "pattern",
            ClusterType::Mixed => "mixed",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "theme" => Some(ClusterType::Theme),
            "emotion" => Some(ClusterType::Emotion),
            "temporal" => Some(ClusterType::Temporal),
            "person" => Some(ClusterType::Person),
            "pattern" => Some(ClusterType::Pattern),
            "mixed" => Some(ClusterType::Mixed),
            _ => None,
        }
    }
}

/// A cluster row
#[derive(Debug, Clone)]
pub struct Cluster {
    /// Stable identifier
    pub id: String,
    /// Classification
    pub cluster_type: ClusterType,
    /// Display name
    pub name: String,
    /// Centroid embedding, if set
    pub centroid: Option<Vec<f32>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

/// A cluster member with its membership strength
#[derive(Debug, Clone)]
pub struct ClusterMember {
    /// The member memory
    pub memory: Memory,
    /// MEMBER_OF edge strength in [0, 1]
    pub membership_strength: f64,
}

fn cluster_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cluster> {
    let type_raw: String = row.get(1)?;
    let centroid_bytes: Option<Vec<u8>> = row.get(3)?;
    Ok(Cluster {
        id: row.get(0)?,
        cluster_type: ClusterType::parse_name(&type_raw).unwrap_or(ClusterType::Mixed),
        name: row.get(2)?,
        centroid: centroid_bytes.and_then(|b| Embedding::from_bytes(&b).map(|e| e.vector)),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const CLUSTER_COLUMNS: &str = "id, cluster_type, name, centroid, created_at, updated_at";

// ============================================================================
// STORAGE SURFACE
// ============================================================================

impl Storage {
    /// Create a cluster. Without an explicit centroid the cluster starts
    /// centred on its name's embedding so query search works immediately.
    pub fn create_memory_cluster(
        &self,
        name: &str,
        cluster_type: ClusterType,
        centroid: Option<Vec<f32>>,
    ) -> Result<String> {
        let centroid = match centroid {
            Some(v) => Some(v),
            None => self.get_embedding(name).ok(),
        };
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO clusters (id, cluster_type, name, centroid, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    id,
                    cluster_type.as_str(),
                    name,
                    centroid.as_ref().map(|v| Embedding::new(v.clone()).to_bytes()),
                    now,
                ],
            )?;
            ensure_node_tx(tx, NodeKind::Cluster, &id, Some(name))?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Fetch one cluster
    pub fn get_cluster(&self, id: &str) -> Result<Option<Cluster>> {
        self.with_reader(|conn| {
            let sql = format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], cluster_from_row).optional()?)
        })
    }

    /// Create or update a MEMBER_OF edge with the given strength
    pub fn link_memory_to_cluster(
        &self,
        memory_id: &str,
        cluster_id: &str,
        strength: f64,
    ) -> Result<()> {
        self.with_tx(|tx| link_memory_to_cluster_tx(tx, memory_id, cluster_id, strength))
    }

    /// Assign a memory to its `k` nearest clusters by centroid similarity,
    /// creating MEMBER_OF edges with `membership_strength = similarity`.
    /// Returns the (cluster id, strength) pairs created.
    pub fn assign_memory_to_clusters(
        &self,
        memory_id: &str,
        k: usize,
    ) -> Result<Vec<(String, f64)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.with_tx(|tx| {
            let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
            let memory = tx
                .query_row(&sql, params![memory_id], memory_from_row)
                .optional()?
                .ok_or_else(|| CoreError::NotFound(format!("memory {memory_id}")))?;
            let Some(embedding) = memory.embedding else {
                return Ok(Vec::new());
            };

            let mut sims: Vec<(String, f64)> = Vec::new();
            {
                let sql = format!("SELECT {CLUSTER_COLUMNS} FROM clusters");
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map([], cluster_from_row)?;
                for row in rows {
                    let cluster = row?;
                    let Some(centroid) = cluster.centroid else { continue };
                    let sim = cosine_similarity(&embedding, &centroid);
                    if sim.is_finite() && sim > 0.0 {
                        sims.push((cluster.id, f64::from(sim)));
                    }
                }
            }
            sims.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            sims.truncate(k);

            for (cluster_id, strength) in &sims {
                link_memory_to_cluster_tx(tx, memory_id, cluster_id, *strength)?;
            }
            Ok(sims)
        })
    }

    /// Recompute a cluster's centroid as the mean of its members' embeddings.
    /// An empty cluster keeps its prior centroid.
    pub fn recalculate_cluster_centroid(&self, cluster_id: &str) -> Result<()> {
        self.with_tx(|tx| recalculate_centroid_tx(tx, cluster_id))
    }

    /// Clusters ranked by centroid similarity to a query
    pub fn search_clusters_by_query(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(Cluster, f32)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.get_embedding(query)?;
        self.with_reader(|conn| {
            let sql = format!("SELECT {CLUSTER_COLUMNS} FROM clusters");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], cluster_from_row)?;
            let mut out: Vec<(Cluster, f32)> = Vec::new();
            for row in rows {
                let cluster = row?;
                let Some(centroid) = &cluster.centroid else { continue };
                let sim = cosine_similarity(centroid, &query_embedding);
                if sim.is_finite() {
                    out.push((cluster, sim));
                }
            }
            out.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.id.cmp(&b.0.id))
            });
            out.truncate(limit);
            Ok(out)
        })
    }

    /// Strongest members of a cluster, used to give recall thematic texture
    pub fn get_cluster_sample_memories(
        &self,
        cluster_id: &str,
        k: usize,
    ) -> Result<Vec<ClusterMember>> {
        self.with_reader(|conn| {
            let members = cluster_members_tx(conn, cluster_id)?;
            Ok(members.into_iter().take(k).collect())
        })
    }

    /// All members of a cluster ordered by membership strength
    pub fn get_cluster_members(&self, cluster_id: &str) -> Result<Vec<ClusterMember>> {
        self.with_reader(|conn| cluster_members_tx(conn, cluster_id))
    }

    /// Relate two clusters with a typed, weighted edge
    pub fn link_cluster_relationship(
        &self,
        cluster_a: &str,
        cluster_b: &str,
        relation: &str,
        strength: f64,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let a = find_node_tx(tx, NodeKind::Cluster, cluster_a)?
                .ok_or_else(|| CoreError::NotFound(format!("cluster {cluster_a}")))?;
            let b = find_node_tx(tx, NodeKind::Cluster, cluster_b)?
                .ok_or_else(|| CoreError::NotFound(format!("cluster {cluster_b}")))?;
            upsert_edge_tx(
                tx,
                a,
                b,
                EdgeKind::Associated,
                strength,
                Some(&json!({ "relation": relation })),
            )?;
            Ok(())
        })
    }

    /// Clusters related to the given one (either edge direction)
    pub fn find_related_clusters(&self, cluster_id: &str) -> Result<Vec<(String, String, f64)>> {
        self.with_reader(|conn| {
            let Some(node) = find_node_tx(conn, NodeKind::Cluster, cluster_id)? else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT n.key, e.properties, e.strength FROM graph_edges e
                 JOIN graph_nodes n
                   ON n.id = CASE WHEN e.src = ?1 THEN e.dst ELSE e.src END
                 WHERE (e.src = ?1 OR e.dst = ?1) AND e.kind = 'ASSOCIATED'
                   AND n.kind = 'cluster'
                 ORDER BY e.strength DESC, n.key ASC",
            )?;
            let rows = stmt.query_map(params![node], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (other, props_raw, strength) = row?;
                if other == cluster_id {
                    continue;
                }
                let relation = serde_json::from_str::<serde_json::Value>(&props_raw)
                    .ok()
                    .and_then(|v| {
                        v.get("relation")
                            .and_then(serde_json::Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "associated".to_string());
                out.push((other, relation, strength));
            }
            Ok(out)
        })
    }
}

pub(crate) fn link_memory_to_cluster_tx(
    conn: &Connection,
    memory_id: &str,
    cluster_id: &str,
    strength: f64,
) -> Result<()> {
    let memory_node = find_node_tx(conn, NodeKind::Memory, memory_id)?
        .ok_or_else(|| CoreError::NotFound(format!("graph node for memory {memory_id}")))?;
    let cluster_node = find_node_tx(conn, NodeKind::Cluster, cluster_id)?
        .ok_or_else(|| CoreError::NotFound(format!("cluster {cluster_id}")))?;
    upsert_edge_tx(
        conn,
        memory_node,
        cluster_node,
        EdgeKind::MemberOf,
        strength.clamp(0.0, 1.0),
        None,
    )?;
    conn.execute(
        "UPDATE clusters SET dirty = 1 WHERE id = ?1",
        params![cluster_id],
    )?;
    Ok(())
}

pub(crate) fn cluster_members_tx(conn: &Connection, cluster_id: &str) -> Result<Vec<ClusterMember>> {
    let Some(node) = find_node_tx(conn, NodeKind::Cluster, cluster_id)? else {
        return Err(CoreError::NotFound(format!("cluster {cluster_id}")));
    };
    let mut stmt = conn.prepare(
        "SELECT n.key, e.strength FROM graph_edges e
         JOIN graph_nodes n ON n.id = e.src
         WHERE e.dst = ?1 AND e.kind = 'MEMBER_OF' AND n.kind = 'memory'
         ORDER BY e.strength DESC, n.key ASC",
    )?;
    let rows = stmt.query_map(params![node], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (memory_id, membership_strength) = row?;
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
        if let Some(memory) = conn
            .query_row(&sql, params![memory_id], memory_from_row)
            .optional()?
        {
            out.push(ClusterMember {
                memory,
                membership_strength,
            });
        }
    }
    Ok(out)
}

pub(crate) fn recalculate_centroid_tx(conn: &Connection, cluster_id: &str) -> Result<()> {
    let members = cluster_members_tx(conn, cluster_id)?;
    let vectors: Vec<Vec<f32>> = members
        .into_iter()
        .filter_map(|m| m.memory.embedding)
        .collect();
    // An empty cluster keeps its prior centroid
    if let Some(mean) = mean_vector(&vectors) {
        conn.execute(
            "UPDATE clusters SET centroid = ?1, updated_at = ?2, dirty = 0 WHERE id = ?3",
            params![Embedding::new(mean).to_bytes(), Utc::now(), cluster_id],
        )?;
    } else {
        conn.execute(
            "UPDATE clusters SET dirty = 0 WHERE id = ?1",
            params![cluster_id],
        )?;
    }
    Ok(())
}

/// Ids of clusters whose membership changed since their last recentroid
pub(crate) fn dirty_cluster_ids_tx(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM clusters WHERE dirty = 1 ORDER BY id")?;
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
