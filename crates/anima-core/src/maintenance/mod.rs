//! Subconscious Maintenance Engine
//!
//! Keeps the substrate healthy between heartbeats: expiry, promotion, decay,
//! trust resync, worldview confidence, cluster recentroid, archival, pruning,
//! and a graph/table invariant sweep. Every step is idempotent and bounded;
//! a step that fails is logged and skipped, never halting the pass.
//!
//! A lower-frequency subconscious decider emits a `reflect` external call
//! whose application feeds insights and graph structure back into the store.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::cluster;
use crate::config;
use crate::emotion;
use crate::external::{create_call_tx, ExternalCall};
use crate::graph;
use crate::memory::store::{memory_from_row, set_memory_status_tx, MEMORY_COLUMNS};
use crate::memory::working;
use crate::memory::{relevance, trust, MemoryStatus};
use crate::storage::{Result, Storage};

// ============================================================================
// STATS
// ============================================================================

/// What one maintenance pass did
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MaintenanceStats {
    /// Expired working-memory rows removed
    pub working_expired: usize,
    /// Working-memory items promoted to episodic
    pub working_promoted: usize,
    /// Queued background searches worked through
    pub background_searches_processed: usize,
    /// Memories still carrying an activation boost after decay
    pub boosts_remaining: usize,
    /// Stale activation probes removed
    pub activations_cleaned: usize,
    /// Embedding cache entries evicted by age
    pub embeddings_evicted: usize,
    /// Null-embedding memories whose vectors were populated
    pub embeddings_backfilled: usize,
    /// Memories considered for the mood update
    pub mood_samples: usize,
    /// Memories whose trust was resynced
    pub trust_resynced: usize,
    /// Worldview memories whose confidence was updated
    pub worldview_updated: usize,
    /// Clusters recentroided
    pub clusters_recentroided: usize,
    /// Memories archived
    pub memories_archived: usize,
    /// Archived memories deleted past retention
    pub memories_deleted: usize,
    /// Graph nodes dropped by the invariant sweep
    pub graph_nodes_dropped: usize,
    /// Graph nodes recreated by the invariant sweep
    pub graph_nodes_created: usize,
    /// Steps that raised and were skipped
    pub steps_failed: usize,
}

// ============================================================================
// PASS
// ============================================================================

/// Relevance below which an untouched memory is an archival candidate
const ARCHIVE_RELEVANCE_THRESHOLD: f64 = 0.1;

/// Days a memory must go untouched before archival is considered
const ARCHIVE_UNTOUCHED_DAYS: i64 = 30;

impl Storage {
    /// Run a maintenance pass if the agent is ready and the interval elapsed
    pub fn run_maintenance_if_due(&self) -> Result<Option<MaintenanceStats>> {
        let due = self.with_reader(|conn| {
            if config::is_agent_terminated_tx(conn)? {
                return Ok(false);
            }
            if !config::is_agent_configured_tx(conn)? || !crate::init::is_init_complete_tx(conn)? {
                return Ok(false);
            }
            let paused: i64 = conn.query_row(
                "SELECT is_paused FROM maintenance_state WHERE id = 1",
                [],
                |row| row.get(0),
            )?;
            if paused != 0 {
                return Ok(false);
            }
            let settings = config::maintenance_settings_tx(conn)?;
            let last: Option<chrono::DateTime<Utc>> = conn.query_row(
                "SELECT last_maintenance_run_at FROM maintenance_state WHERE id = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(match last {
                Some(last) => {
                    Utc::now() - last >= Duration::seconds(settings.maintenance_interval_seconds)
                }
                None => true,
            })
        })?;
        if !due {
            return Ok(None);
        }
        Ok(Some(self.run_maintenance_pass()?))
    }

    /// One full pass, unconditionally
    pub fn run_maintenance_pass(&self) -> Result<MaintenanceStats> {
        let settings = self.maintenance_settings()?;
        let mut stats = MaintenanceStats::default();

        self.with_writer(|conn| {
            conn.execute(
                "UPDATE maintenance_state SET last_maintenance_run_at = ?1 WHERE id = 1",
                params![Utc::now()],
            )?;
            Ok(())
        })?;

        // 1. Expire working memory
        match self.with_writer(working::expire_working_memory_tx) {
            Ok(n) => stats.working_expired = n,
            Err(e) => skip_step(&mut stats, "expire_working_memory", &e),
        }

        // 2. Promote repeatedly-accessed working memory to episodic
        match self.promote_hot_working_memory(settings.promotion_access_count) {
            Ok(n) => stats.working_promoted = n,
            Err(e) => skip_step(&mut stats, "promote_working_memory", &e),
        }

        // Work through queued background searches before their boosts decay
        match self.process_background_searches(16, 30) {
            Ok(n) => stats.background_searches_processed = n,
            Err(e) => skip_step(&mut stats, "process_background_searches", &e),
        }

        // 3. Decay activation boosts
        let decay_step = self
            .get_config("maintenance.activation_decay")?
            .and_then(|v| v.as_f64())
            .unwrap_or(0.02);
        match self.decay_activation_boosts(decay_step) {
            Ok(n) => stats.boosts_remaining = n,
            Err(e) => skip_step(&mut stats, "decay_activation_boosts", &e),
        }

        // 4. Clean up stale activation probes and aged embedding cache rows
        match self.cleanup_activations() {
            Ok(n) => stats.activations_cleaned = n,
            Err(e) => skip_step(&mut stats, "cleanup_activations", &e),
        }
        let cache_max_age = self
            .get_config("maintenance.embedding_cache_max_age_days")?
            .and_then(|v| v.as_i64())
            .unwrap_or(90);
        match self.cleanup_embedding_cache(cache_max_age) {
            Ok(n) => stats.embeddings_evicted = n,
            Err(e) => skip_step(&mut stats, "cleanup_embedding_cache", &e),
        }

        // Backfill memories accepted with a null embedding sentinel
        match self.backfill_missing_embeddings(32) {
            Ok(n) => stats.embeddings_backfilled = n,
            Err(e) => skip_step(&mut stats, "backfill_embeddings", &e),
        }

        // 5. Update mood from recent experience
        match self.with_writer(emotion::update_mood_from_recent_tx) {
            Ok(n) => stats.mood_samples = n,
            Err(e) => skip_step(&mut stats, "update_mood", &e),
        }

        // 6. Resync trust for memories whose sources changed
        match self.resync_dirty_trust() {
            Ok(n) => stats.trust_resynced = n,
            Err(e) => skip_step(&mut stats, "resync_trust", &e),
        }

        // 7. Update worldview confidences from influence edges
        match self.update_influenced_worldviews() {
            Ok(n) => stats.worldview_updated = n,
            Err(e) => skip_step(&mut stats, "update_worldviews", &e),
        }

        // 8. Recentroid clusters whose membership changed
        match self.recentroid_dirty_clusters() {
            Ok(n) => stats.clusters_recentroided = n,
            Err(e) => skip_step(&mut stats, "recentroid_clusters", &e),
        }

        // 9. Archive stale, irrelevant memories
        match self.archive_stale_memories() {
            Ok(n) => stats.memories_archived = n,
            Err(e) => skip_step(&mut stats, "archive_stale", &e),
        }

        // 10. Delete archived memories past retention
        match self.delete_expired_archives(settings.retention_days) {
            Ok(n) => stats.memories_deleted = n,
            Err(e) => skip_step(&mut stats, "delete_expired", &e),
        }

        // Invariant sweep: repair graph/table divergence
        match self.with_tx(|tx| graph::repair_graph_tx(tx)) {
            Ok((dropped, created)) => {
                stats.graph_nodes_dropped = dropped;
                stats.graph_nodes_created = created;
            }
            Err(e) => skip_step(&mut stats, "graph_sweep", &e),
        }

        tracing::info!(?stats, "maintenance pass complete");
        Ok(stats)
    }

    /// Populate embeddings for memories that were accepted with the null
    /// sentinel while the provider was down. Bounded per pass.
    fn backfill_missing_embeddings(&self, limit: usize) -> Result<usize> {
        let candidates: Vec<(String, String)> = self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content FROM memories
                 WHERE embedding IS NULL AND status = 'active'
                 ORDER BY created_at ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })?;

        let mut populated = 0usize;
        for (id, content) in candidates {
            let Ok(vector) = self.get_embedding(&content) else {
                break; // provider still down; try again next pass
            };
            self.with_writer(|conn| {
                conn.execute(
                    "UPDATE memories SET embedding = ?1, updated_at = ?2 WHERE id = ?3",
                    params![
                        crate::embeddings::Embedding::new(vector.clone()).to_bytes(),
                        Utc::now(),
                        id
                    ],
                )?;
                Ok(())
            })?;
            populated += 1;
        }
        Ok(populated)
    }

    fn promote_hot_working_memory(&self, min_access_count: i64) -> Result<usize> {
        let candidates =
            self.with_reader(|conn| working::promotion_candidates_tx(conn, min_access_count))?;
        let mut promoted = 0usize;
        for id in candidates {
            let importance = self
                .get_working_memory(&id)?
                .map(|w| w.importance.max(0.4))
                .unwrap_or(0.4);
            match self.with_tx(|tx| working::promote_tx(tx, &id, importance)) {
                Ok(_) => promoted += 1,
                Err(e) => tracing::warn!(item = %id, "promotion failed: {}", e),
            }
        }
        Ok(promoted)
    }

    fn resync_dirty_trust(&self) -> Result<usize> {
        let dirty: Vec<String> = self.with_reader(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM memories WHERE trust_dirty = 1 ORDER BY id LIMIT 200")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })?;
        let mut resynced = 0usize;
        for id in dirty {
            match self.with_tx(|tx| trust::sync_memory_trust_tx(tx, &id)) {
                Ok(()) => resynced += 1,
                Err(e) => tracing::warn!(memory = %id, "trust resync failed: {}", e),
            }
        }
        Ok(resynced)
    }

    fn update_influenced_worldviews(&self) -> Result<usize> {
        let ids: Vec<String> = self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT m.id FROM memories m
                 JOIN graph_nodes n ON n.kind = 'memory' AND n.key = m.id
                 JOIN graph_edges e ON e.dst = n.id AND e.kind IN ('SUPPORTS', 'CONTRADICTS')
                 WHERE m.kind = 'worldview' AND m.status = 'active'
                 ORDER BY m.id LIMIT 100",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })?;
        let mut updated = 0usize;
        for id in ids {
            match self.with_tx(|tx| trust::update_worldview_confidence_tx(tx, &id)) {
                Ok(()) => updated += 1,
                Err(e) => tracing::warn!(worldview = %id, "confidence update failed: {}", e),
            }
        }
        Ok(updated)
    }

    fn recentroid_dirty_clusters(&self) -> Result<usize> {
        let dirty = self.with_reader(|conn| cluster::dirty_cluster_ids_tx(conn))?;
        let mut done = 0usize;
        for id in dirty {
            match self.with_tx(|tx| cluster::recalculate_centroid_tx(tx, &id)) {
                Ok(()) => done += 1,
                Err(e) => tracing::warn!(cluster = %id, "recentroid failed: {}", e),
            }
        }
        Ok(done)
    }

    fn archive_stale_memories(&self) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now - Duration::days(ARCHIVE_UNTOUCHED_DAYS);
        let candidates: Vec<String> = self.with_reader(|conn| {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories
                 WHERE status = 'active' AND last_accessed < ?1
                 ORDER BY last_accessed ASC LIMIT 500"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff], memory_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                let memory = row?;
                let score = relevance(
                    memory.importance,
                    memory.decay_rate,
                    memory.created_at,
                    memory.last_accessed,
                    now,
                );
                if score < ARCHIVE_RELEVANCE_THRESHOLD {
                    out.push(memory.id);
                }
            }
            Ok(out)
        })?;
        let mut archived = 0usize;
        for id in candidates {
            match self.with_tx(|tx| set_memory_status_tx(tx, &id, MemoryStatus::Archived)) {
                Ok(()) => archived += 1,
                Err(e) => tracing::warn!(memory = %id, "archive failed: {}", e),
            }
        }
        Ok(archived)
    }

    fn delete_expired_archives(&self, retention_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let expired: Vec<String> = self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM memories
                 WHERE status = 'archived' AND created_at < ?1
                 ORDER BY id LIMIT 500",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })?;
        let mut deleted = 0usize;
        for id in expired {
            match self.with_tx(|tx| crate::memory::store::delete_memory_tx(tx, &id)) {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(memory = %id, "deletion failed: {}", e),
            }
        }
        Ok(deleted)
    }
}

fn skip_step(stats: &mut MaintenanceStats, step: &str, error: &crate::storage::CoreError) {
    stats.steps_failed += 1;
    tracing::warn!(step, "maintenance step skipped: {}", error);
}

// ============================================================================
// SUBCONSCIOUS DECIDER
// ============================================================================

/// Context document handed to the subconscious `reflect` call
pub(crate) fn subconscious_context_tx(conn: &Connection) -> Result<Value> {
    let recent: Vec<Value> = {
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE status = 'active'
             ORDER BY created_at DESC LIMIT 20"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], memory_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let memory = row?;
            out.push(json!({
                "id": memory.id,
                "kind": memory.kind.as_str(),
                "content": memory.content,
                "importance": memory.importance,
                "trust_level": memory.trust_level,
            }));
        }
        out
    };

    let active_transformations: Vec<Value> = {
        let ids = crate::memory::transformation::active_exploration_ids_tx(conn)?;
        let mut out = Vec::new();
        for id in ids.into_iter().take(5) {
            let progress = crate::memory::transformation::progress_for_tx(conn, &id)?;
            out.push(serde_json::to_value(&progress)?);
        }
        out
    };

    let contradictions: Vec<Value> = {
        let mut stmt = conn.prepare(
            "SELECT a.key, b.key FROM graph_edges e
             JOIN graph_nodes a ON a.id = e.src AND a.kind = 'memory'
             JOIN graph_nodes b ON b.id = e.dst AND b.kind = 'memory'
             WHERE e.kind = 'CONTRADICTS'
             ORDER BY e.created_at DESC, e.id DESC LIMIT 10",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(json!({
                "memory_a": row.get::<_, String>(0)?,
                "memory_b": row.get::<_, String>(1)?,
            }))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let state = emotion::emotional_state_tx(conn)?;

    Ok(json!({
        "recent_memories": recent,
        "active_transformations": active_transformations,
        "contradictions": contradictions,
        "emotional_state": {
            "valence": state.valence,
            "arousal": state.arousal,
            "mood_valence": state.mood_valence,
            "primary_emotion": state.primary_emotion,
        },
    }))
}

pub(crate) fn mark_subconscious_run_tx(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE maintenance_state SET
            last_subconscious_heartbeat = (SELECT heartbeat_count FROM heartbeat_state WHERE id = 1),
            last_subconscious_run_at = ?1
         WHERE id = 1",
        params![Utc::now()],
    )?;
    Ok(())
}

impl Storage {
    /// Gate for the low-frequency subconscious decider
    pub fn should_run_subconscious_decider(&self) -> Result<bool> {
        self.with_reader(|conn| {
            let settings = config::maintenance_settings_tx(conn)?;
            if !settings.subconscious_enabled {
                return Ok(false);
            }
            if config::is_agent_terminated_tx(conn)? {
                return Ok(false);
            }
            if !config::is_agent_configured_tx(conn)? || !crate::init::is_init_complete_tx(conn)? {
                return Ok(false);
            }
            if config::consent_status_tx(conn)?.as_deref() != Some("consent") {
                return Ok(false);
            }
            let (paused, last_heartbeat, last_run): (i64, i64, Option<chrono::DateTime<Utc>>) =
                conn.query_row(
                    "SELECT is_paused, last_subconscious_heartbeat, last_subconscious_run_at
                     FROM maintenance_state WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
            if paused != 0 {
                return Ok(false);
            }
            let heartbeat_count = crate::heartbeat::heartbeat_count_tx(conn)?;
            if heartbeat_count - last_heartbeat < 1 {
                return Ok(false);
            }
            Ok(match last_run {
                Some(last) => {
                    Utc::now() - last >= Duration::seconds(settings.subconscious_interval_seconds)
                }
                None => true,
            })
        })
    }

    /// Emit the subconscious `reflect` call. Returns `None` if one is already
    /// waiting so polls do not pile up duplicates.
    pub fn start_subconscious_reflection(&self) -> Result<Option<ExternalCall>> {
        self.with_tx(|tx| {
            let waiting: i64 = tx.query_row(
                "SELECT COUNT(*) FROM external_calls
                 WHERE status IN ('pending', 'in_flight')
                   AND parent_heartbeat_id IS NULL
                   AND json_extract(input, '$.kind') = 'reflect'",
                [],
                |row| row.get(0),
            )?;
            if waiting > 0 {
                return Ok(None);
            }
            let context = subconscious_context_tx(tx)?;
            let call = create_call_tx(
                tx,
                json!({ "kind": "reflect", "context": context }),
                None,
            )?;
            Ok(Some(call))
        })
    }

    /// Bookkeeping after a subconscious pass was applied
    pub fn mark_subconscious_run(&self) -> Result<()> {
        self.with_writer(mark_subconscious_run_tx)
    }

    /// JSON snapshot of the maintenance singleton
    pub fn maintenance_state_snapshot(&self) -> Result<Value> {
        self.with_reader(|conn| {
            Ok(conn.query_row(
                "SELECT is_paused, last_maintenance_run_at, last_subconscious_heartbeat,
                        last_subconscious_run_at
                 FROM maintenance_state WHERE id = 1",
                [],
                |row| {
                    Ok(json!({
                        "is_paused": row.get::<_, i64>(0)? != 0,
                        "last_maintenance_run_at": row
                            .get::<_, Option<chrono::DateTime<Utc>>>(1)?
                            .map(|t| t.to_rfc3339()),
                        "last_subconscious_heartbeat": row.get::<_, i64>(2)?,
                        "last_subconscious_run_at": row
                            .get::<_, Option<chrono::DateTime<Utc>>>(3)?
                            .map(|t| t.to_rfc3339()),
                    }))
                },
            )?)
        })
    }

    /// Pause or resume maintenance
    pub fn set_maintenance_paused(&self, paused: bool) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE maintenance_state SET is_paused = ?1 WHERE id = 1",
                params![i64::from(paused)],
            )?;
            Ok(())
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
