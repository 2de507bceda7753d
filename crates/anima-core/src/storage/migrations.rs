//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, graph, clusters, heartbeat, external calls",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Activation probes, background searches, drives",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Trust resync and cluster recentroid dirty flags",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
-- Flat key -> JSON configuration store
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- The universal memory atom
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,  -- 'episodic', 'semantic', 'procedural', 'strategic', 'worldview', 'goal'
    content TEXT NOT NULL,
    embedding BLOB,      -- little-endian f32, fixed process-wide dimension; NULL until populated
    importance REAL NOT NULL DEFAULT 0.5 CHECK (importance >= 0.0),
    decay_rate REAL NOT NULL DEFAULT 0.01 CHECK (decay_rate >= 0.0),
    access_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',  -- 'active', 'archived', 'invalidated'
    trust_level REAL NOT NULL DEFAULT 0.5 CHECK (trust_level >= 0.0 AND trust_level <= 1.0),
    source_attribution TEXT NOT NULL DEFAULT '{}',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_last_accessed ON memories(last_accessed);

-- Short-lived memory with explicit expiry
CREATE TABLE IF NOT EXISTS working_memory (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    embedding BLOB,
    importance REAL NOT NULL DEFAULT 0.3,
    trust_level REAL NOT NULL DEFAULT 0.5,
    source_attribution TEXT NOT NULL DEFAULT '{}',
    metadata TEXT NOT NULL DEFAULT '{}',
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    expiry TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_working_memory_expiry ON working_memory(expiry);

-- Property graph co-stored with memories
CREATE TABLE IF NOT EXISTS graph_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,  -- 'memory', 'concept', 'cluster', 'episode', 'goal', 'goals_root'
    key TEXT NOT NULL,   -- memory id, concept name, cluster id, episode id, goal memory id, 'root'
    label TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (kind, key)
);

CREATE TABLE IF NOT EXISTS graph_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    src INTEGER NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    dst INTEGER NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    strength REAL NOT NULL DEFAULT 1.0,
    properties TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    UNIQUE (src, dst, kind)
);

CREATE INDEX IF NOT EXISTS idx_edges_src ON graph_edges(src, kind);
CREATE INDEX IF NOT EXISTS idx_edges_dst ON graph_edges(dst, kind);

-- Clusters; membership lives in the graph as MEMBER_OF edges
CREATE TABLE IF NOT EXISTS clusters (
    id TEXT PRIMARY KEY,
    cluster_type TEXT NOT NULL,  -- 'theme', 'emotion', 'temporal', 'person', 'pattern', 'mixed'
    name TEXT NOT NULL,
    centroid BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Ordered episodes; membership lives in the graph as SEQUENCED_IN edges
CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    summary TEXT NOT NULL DEFAULT '',
    summary_embedding BLOB,
    created_at TEXT NOT NULL
);

-- Heartbeat singleton
CREATE TABLE IF NOT EXISTS heartbeat_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    current_energy REAL NOT NULL DEFAULT 0.0,
    heartbeat_count INTEGER NOT NULL DEFAULT 0,
    is_paused INTEGER NOT NULL DEFAULT 1,
    init_stage TEXT NOT NULL DEFAULT 'not_started',
    init_data TEXT NOT NULL DEFAULT '{}',
    init_started_at TEXT,
    init_completed_at TEXT
);

INSERT OR IGNORE INTO heartbeat_state (id) VALUES (1);

-- Maintenance singleton
CREATE TABLE IF NOT EXISTS maintenance_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    is_paused INTEGER NOT NULL DEFAULT 0,
    last_maintenance_run_at TEXT,
    last_subconscious_heartbeat INTEGER NOT NULL DEFAULT 0,
    last_subconscious_run_at TEXT
);

INSERT OR IGNORE INTO maintenance_state (id) VALUES (1);

-- Emotional state singleton (VAD + intensity + slow-moving mood)
CREATE TABLE IF NOT EXISTS emotional_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    valence REAL NOT NULL DEFAULT 0.0,
    arousal REAL NOT NULL DEFAULT 0.3,
    dominance REAL NOT NULL DEFAULT 0.5,
    intensity REAL NOT NULL DEFAULT 0.3,
    mood_valence REAL NOT NULL DEFAULT 0.0,
    mood_arousal REAL NOT NULL DEFAULT 0.3,
    primary_emotion TEXT NOT NULL DEFAULT 'neutral',
    updated_at TEXT
);

INSERT OR IGNORE INTO emotional_state (id) VALUES (1);

-- Append-only heartbeat audit, doubling as suspended-executor state
CREATE TABLE IF NOT EXISTS heartbeat_log (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    decision TEXT,
    pending_actions TEXT,
    actions_taken TEXT NOT NULL DEFAULT '[]',
    goal_changes TEXT NOT NULL DEFAULT '[]',
    last_will TEXT,
    memory_id TEXT,
    energy_before REAL NOT NULL DEFAULT 0.0,
    energy_after REAL,
    reason_if_skipped TEXT,
    aborted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_heartbeat_log_ended ON heartbeat_log(ended_at);

-- External call ledger
CREATE TABLE IF NOT EXISTS external_calls (
    id TEXT PRIMARY KEY,
    call_type TEXT NOT NULL,  -- 'think'
    input TEXT NOT NULL,
    parent_heartbeat_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',  -- 'pending', 'in_flight', 'applied', 'failed'
    attempts INTEGER NOT NULL DEFAULT 0,
    output TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_external_calls_status ON external_calls(status);
CREATE INDEX IF NOT EXISTS idx_external_calls_parent ON external_calls(parent_heartbeat_id);

-- Outbox: side-effects destined for delivery outside the core
CREATE TABLE IF NOT EXISTS outbox_messages (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,  -- 'user', 'tool'
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',  -- 'pending', 'delivered', 'failed'
    attempts INTEGER NOT NULL DEFAULT 0,
    heartbeat_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox_messages(status);

-- Immutable consent ledger
CREATE TABLE IF NOT EXISTS consent_log (
    id TEXT PRIMARY KEY,
    decision TEXT NOT NULL,  -- 'consent', 'decline', 'abstain'
    signature TEXT NOT NULL DEFAULT '',
    memories_returned TEXT NOT NULL DEFAULT '[]',
    recorded_at TEXT NOT NULL,
    raw_response TEXT NOT NULL DEFAULT ''
);

-- Idempotent re-ingestion receipts
CREATE TABLE IF NOT EXISTS ingestion_receipts (
    source_file TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    memory_id TEXT NOT NULL,
    inserted_at TEXT NOT NULL,
    UNIQUE (source_file, chunk_index, content_hash)
);

-- Persistent content-hash-keyed embedding cache
CREATE TABLE IF NOT EXISTS embedding_cache (
    content_hash TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL,
    last_used TEXT NOT NULL
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Feeling-of-knowing probes, background searches, drives
const MIGRATION_V2_UP: &str = r#"
-- Quick index probes with a short TTL
CREATE TABLE IF NOT EXISTS memory_activations (
    id TEXT PRIMARY KEY,
    query TEXT NOT NULL,
    estimated_matches INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activations_expires ON memory_activations(expires_at);

-- Queue of deferred deep scans
CREATE TABLE IF NOT EXISTS background_searches (
    id TEXT PRIMARY KEY,
    query TEXT NOT NULL,
    embedding BLOB,
    status TEXT NOT NULL DEFAULT 'pending',  -- 'pending', 'processed'
    created_at TEXT NOT NULL,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_background_searches_status ON background_searches(status);

-- Small boost applied by background search hits, decayed by maintenance
ALTER TABLE memories ADD COLUMN activation_boost REAL NOT NULL DEFAULT 0.0;

-- Homeostatic drives surfaced as urgency in the decision context
CREATE TABLE IF NOT EXISTS drives (
    name TEXT PRIMARY KEY,
    level REAL NOT NULL DEFAULT 0.0,
    threshold REAL NOT NULL DEFAULT 1.0,
    accrual_rate REAL NOT NULL DEFAULT 0.05,
    updated_at TEXT NOT NULL
);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Dirty flags so maintenance only resyncs what changed
const MIGRATION_V3_UP: &str = r#"
-- Set whenever metadata.source_references is rewritten; cleared by trust resync
ALTER TABLE memories ADD COLUMN trust_dirty INTEGER NOT NULL DEFAULT 0;

-- Set whenever MEMBER_OF edges change; cleared by recentroid
ALTER TABLE clusters ADD COLUMN dirty INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS idx_memories_trust_dirty ON memories(trust_dirty);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
