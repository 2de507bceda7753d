//! # Anima Core
//!
//! Cognitive substrate for a persistent autonomous agent. One SQLite database
//! holds everything the agent is; two worker loops (heartbeat, maintenance)
//! drive it forward, coordinating only through the store:
//!
//! - **Heartbeat state machine**: bounded reasoning cycles that regenerate
//!   energy, gather a decision context, suspend on external compute, apply
//!   actions transactionally, and finalize with an auditable memory
//! - **Cognitive memory engine**: six typed memory kinds over one table,
//!   dense-vector recall with deterministic ranking, a property graph of
//!   typed relationships, clusters with lazy centroids, and trust/provenance
//!   accounting over normalized source references
//! - **Subconscious maintenance**: expiry, promotion, decay, mood, trust
//!   resync, recentroiding, archival, retention pruning, and an invariant
//!   sweep, plus a low-frequency reflective decider
//! - **External call ledger**: every request to out-of-process compute is a
//!   row; results apply in one transaction each and re-application is a no-op
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use anima_core::{RecallInput, RememberInput, Storage};
//!
//! let storage = Storage::new(None, embedder)?;
//!
//! let id = storage.remember(RememberInput {
//!     content: "The harbor was quiet this morning".to_string(),
//!     ..Default::default()
//! })?;
//!
//! let results = storage.recall(&RecallInput {
//!     query: "quiet mornings".to_string(),
//!     limit: 5,
//!     ..Default::default()
//! })?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod activation;
pub mod cluster;
pub mod config;
pub mod drives;
pub mod embeddings;
pub mod emotion;
pub mod external;
pub mod goals;
pub mod graph;
pub mod heartbeat;
pub mod ingest;
pub mod init;
pub mod maintenance;
pub mod memory;
pub mod outbox;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Storage layer
pub use storage::{CoreError, MemoryStats, Result, Storage};

// Memory types
pub use memory::{
    age_in_days, recency_boost, relevance, EpisodicInput, Memory, MemoryKind, MemoryStatus,
    ProceduralMatch, RecallInput, RecalledMemory, RememberInput, SemanticInput, SourceRef,
    StrategicMatch, WorldviewInput,
};
pub use memory::transformation::{
    default_transformation_state, normalize_transformation_state, ChangeRequires,
    TransformationEffort, TransformationProgress, TransformationRequirements,
};
pub use memory::trust::{
    compute_semantic_trust, dedupe_source_references, normalize_source_reference,
    normalize_source_references, source_reinforcement_score, TruthProfile,
};
pub use memory::working::WorkingMemory;

// Embedding seam
pub use embeddings::{
    content_hash, cosine_similarity, Embedding, EmbeddingError, EmbeddingProvider,
    EMBEDDING_DIMENSIONS,
};

// Graph
pub use graph::episodes::EpisodeSummary;
pub use graph::{Contradiction, EdgeKind, LinkedMemory, NodeKind};

// Clusters
pub use cluster::{Cluster, ClusterMember, ClusterType};

// Goals
pub use goals::{CreateGoal, Goal, GoalChange, GoalIssue, GoalPriority};

// Emotion
pub use emotion::{EmotionalPattern, EmotionalState, EmotionalUpdate};

// Drives
pub use drives::{Drive, UrgentDrive};

// Heartbeat
pub use heartbeat::executor::ActionKind;
pub use heartbeat::{
    ActionRecord, ActionRequest, Decision, ExecutionOutcome, HeartbeatRow, HeartbeatStart,
};

// External calls
pub use external::{
    ApplyOutcome, CallOutput, CallStatus, ConsentMemory, ContradictionNote,
    DiscoveredRelationship, ExternalCall, GoalDraft, IdentityUpdate, Insight, ReflectOutcome,
    SelfUpdate, WorldviewInfluence, WorldviewUpdate,
};

// Maintenance
pub use maintenance::MaintenanceStats;

// Initialization & consent
pub use init::{ConsentRecord, InitStage, InitStatus};

// Outbox
pub use outbox::{OutboxKind, OutboxMessage};

// Ingestion
pub use ingest::{CancellationRegistry, CancellationToken, IngestionReceipt};

// Activation
pub use activation::ActivationProbe;

// Configuration bundles
pub use config::{HeartbeatSettings, MaintenanceSettings, RecallWeights};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        ActionKind, CallOutput, CoreError, Decision, EmbeddingProvider, ExecutionOutcome,
        ExternalCall, GoalPriority, Memory, MemoryKind, MemoryStats, MemoryStatus, RecallInput,
        RememberInput, Result, Storage,
    };
}
