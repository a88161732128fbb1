//! Crate-level error type
//!
//! Per-module errors (vector, storage, index, llm) stay local in their
//! modules; this aggregate is what the service-level operations surface.
//! Only content/validation failures are meant for end users - everything
//! else degrades silently with telemetry.
//!
//! Three degraded conditions never reach this type at all, because they
//! are not propagated as errors: budget exhaustion is recorded on each
//! cycle process result, chain cycles are logged and truncated during
//! traversal, and rate-limited Hebbian pairs are silently dropped with
//! a counter.

use crate::index::IndexError;
use crate::llm::LlmError;
use crate::storage::StorageError;
use crate::vector::VectorError;

/// Service-level memory error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Content rejected: empty, oversized, test-pattern in prod, too generic
    #[error("Invalid content: {0}")]
    ContentInvalid(String),
    /// Embedding collaborator unreachable or returned nothing usable
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    /// Quantization failure (rare; insert degrades to storing f32)
    #[error("Quantization failed: {0}")]
    Quantization(#[from] VectorError),
    /// HNSW index not running or below threshold
    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),
    /// Substrate contention outlasted the retry budget
    #[error("Writer busy: {0}")]
    WriterBusy(String),
    /// Schema or changeset failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    /// Underlying storage error
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for MemoryError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidContent(msg) => MemoryError::ContentInvalid(msg),
            StorageError::Busy(msg) => MemoryError::WriterBusy(msg),
            StorageError::Protected(id) => {
                MemoryError::ValidationFailed(format!("row {} is protected", id))
            }
            StorageError::Forbidden(msg) => MemoryError::ValidationFailed(msg),
            other => MemoryError::Storage(other),
        }
    }
}

impl From<IndexError> for MemoryError {
    fn from(e: IndexError) -> Self {
        MemoryError::IndexUnavailable(e.to_string())
    }
}

impl From<LlmError> for MemoryError {
    fn from(e: LlmError) -> Self {
        MemoryError::EmbeddingUnavailable(e.to_string())
    }
}

/// Crate-level result type
pub type Result<T> = std::result::Result<T, MemoryError>;
