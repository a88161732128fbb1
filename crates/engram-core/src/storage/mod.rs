//! Storage - SQLite row store for engrams
//!
//! Writer/reader connection split with every mutation routed through the
//! WriteSerializer. Embedding generation and LLM calls never run inside
//! the serialized section; the writer completes in bounded time.

mod fts;
mod migrations;
mod serializer;
mod sqlite;

pub use fts::sanitize_fts_query;
pub use serializer::WriteSerializer;
pub use sqlite::{EngramStore, Int8Row, RowFilter};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found
    #[error("Engram not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
    /// Substrate contention outlasted the retry budget
    #[error("Writer busy: {0}")]
    Busy(String),
    /// Operation refused on a protected row
    #[error("Row is protected: {0}")]
    Protected(String),
    /// Content rejected by validation
    #[error("Invalid content: {0}")]
    InvalidContent(String),
    /// A forbidden primitive (e.g. importance = 0 as deletion)
    #[error("Forbidden operation: {0}")]
    Forbidden(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;
