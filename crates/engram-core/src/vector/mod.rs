//! Vector Math and Quantization
//!
//! The three embedding projections every engram carries:
//! - int8: byte-per-dimension with a per-vector scale/offset
//! - binary: one bit per dimension, derived from the int8 form
//! - f32: the original, kept only when quantization fails
//!
//! Plus the distance kernels the retrieval strategies are built on:
//! cosine over int8 and Hamming popcount over packed bits.

mod hamming;
mod quant;

pub use hamming::{hamming_distance, to_binary, top_k_hamming, HammingTopK};
pub use quant::{cosine_int8, dequantize_int8, quantize_int8};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector math error types
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorError {
    /// Two vectors had different dimensions
    DimMismatch(usize, usize),
    /// Empty input vector
    Empty,
}

impl std::fmt::Display for VectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorError::DimMismatch(expected, got) => {
                write!(f, "Dimension mismatch: expected {}, got {}", expected, got)
            }
            VectorError::Empty => write!(f, "Empty input vector"),
        }
    }
}

impl std::error::Error for VectorError {}

/// Vector math result type
pub type Result<T> = std::result::Result<T, VectorError>;
