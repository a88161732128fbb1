//! HNSW Index Service
//!
//! A long-lived task owning one HNSW index over the int8 embedding
//! projection, keyed by engram id. The index is derived state: it must
//! always be rebuildable from the row store, and callers treat an
//! unavailable index as "not running" - the retrieval planner downgrades
//! transparently, never surfacing an error to the user.

#[cfg(feature = "vector-search")]
mod hnsw;
mod service;

#[cfg(feature = "vector-search")]
pub use hnsw::VectorIndex;
pub use service::{IndexHandle, IndexService, IndexStats};

use chrono::{DateTime, Utc};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Index error types
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum IndexError {
    /// The index never initialized or the service is not running
    Unavailable(String),
    /// Too few vectors for approximate search to be trustworthy
    BelowThreshold {
        /// Current vector count
        size: usize,
        /// Configured minimum
        threshold: usize,
    },
    /// Failed to create the index
    Creation(String),
    /// Failed to add or remove a vector
    Mutation(String),
    /// Failed to search
    Search(String),
    /// Failed to persist or load the index
    Persistence(String),
    /// Dimension mismatch
    InvalidDimensions(usize, usize),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::Unavailable(e) => write!(f, "Index unavailable: {}", e),
            IndexError::BelowThreshold { size, threshold } => {
                write!(f, "Index below threshold: {} < {}", size, threshold)
            }
            IndexError::Creation(e) => write!(f, "Index creation failed: {}", e),
            IndexError::Mutation(e) => write!(f, "Index mutation failed: {}", e),
            IndexError::Search(e) => write!(f, "Index search failed: {}", e),
            IndexError::Persistence(e) => write!(f, "Index persistence failed: {}", e),
            IndexError::InvalidDimensions(expected, got) => {
                write!(f, "Invalid dimensions: expected {}, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for IndexError {}

/// Index result type
pub type Result<T> = std::result::Result<T, IndexError>;

/// A snapshot of index state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Indexed vector count
    pub size: usize,
    /// Reserved capacity
    pub capacity: usize,
    /// Vector dimensions
    pub dimensions: usize,
    /// Unsaved changes pending
    pub dirty: bool,
    /// Last successful save
    pub last_saved_at: Option<DateTime<Utc>>,
}
