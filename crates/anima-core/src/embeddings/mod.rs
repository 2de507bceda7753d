//! Embedding Seam
//!
//! The substrate never generates embeddings itself. It talks to an external
//! provider through the [`EmbeddingProvider`] trait and caches results by
//! content hash, both in-process (LRU) and in the `embedding_cache` table.

use sha2::{Digest, Sha256};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Process-wide embedding dimension. Every vector stored anywhere in the
/// substrate (memories, working memory, centroids, episode summaries) has
/// exactly this many components.
pub const EMBEDDING_DIMENSIONS: usize = 256;

/// Maximum text length sent to the provider (truncated beyond this)
pub const MAX_TEXT_LENGTH: usize = 8192;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum EmbeddingError {
    /// Provider unreachable or returned a non-success status
    ProviderUnavailable(String),
    /// Provider returned a vector of the wrong dimension
    InvalidDimensions(usize, usize),
    /// Invalid input (empty text)
    InvalidInput(String),
}

impl std::fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingError::ProviderUnavailable(e) => write!(f, "Embedding provider unavailable: {}", e),
            EmbeddingError::InvalidDimensions(expected, got) => {
                write!(f, "Invalid dimensions: expected {}, got {}", expected, got)
            }
            EmbeddingError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
        }
    }
}

impl std::error::Error for EmbeddingError {}

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A dense embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The embedding vector
    pub vector: Vec<f32>,
    /// Dimensions of the vector
    pub dimensions: usize,
}

impl Embedding {
    /// Create a new embedding from a vector
    pub fn new(vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        Self { vector, dimensions }
    }

    /// Convert to bytes for storage (little-endian f32)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }

    /// Compute cosine similarity with another embedding
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.vector, &other.vector)
    }
}

/// Cosine similarity between two vectors.
///
/// A zero vector (or a dimension mismatch) yields NaN; callers that rank by
/// similarity must filter non-finite scores rather than treating them as 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::NAN;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return f32::NAN;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Mean of a set of vectors, all of dimension [`EMBEDDING_DIMENSIONS`].
/// Returns `None` for an empty set.
pub fn mean_vector(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();
    let mut acc = vec![0.0f32; dim];
    for v in vectors {
        if v.len() != dim {
            return None;
        }
        for (a, x) in acc.iter_mut().zip(v.iter()) {
            *a += x;
        }
    }
    let n = vectors.len() as f32;
    for a in &mut acc {
        *a /= n;
    }
    Some(acc)
}

/// SHA-256 content hash used to key the embedding cache and ingestion receipts
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// External embedding provider contract.
///
/// Implementations live outside the core (the worker ships an HTTP client);
/// tests use deterministic stubs. Retry policy is the implementor's concern,
/// driven by `embedding.retry_seconds` / `embedding.retry_interval_seconds`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text. Must return a vector of exactly
    /// [`EMBEDDING_DIMENSIONS`] components.
    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Cheap liveness probe
    fn check_health(&self) -> bool;
}

// ============================================================================
// TESTS
// ============================================================================
