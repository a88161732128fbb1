//! # Engram Core
//!
//! A persistent, self-maintaining associative memory engine for AI
//! agents:
//!
//! - **Layered retrieval**: exact int8 cosine, binary Hamming prefilter
//!   with rescore, and HNSW (USearch) above a corpus threshold
//! - **Quantized storage**: every engram carries an int8 projection
//!   (per-vector scale/offset) and a derived 1-bit binary projection
//! - **Access-driven lifecycle**: batched counters, the spacing effect
//!   on decay rates, and auto-protection of hot memories
//! - **Temporal supersession**: update/correction/refinement chains
//!   with cycle-safe traversal
//! - **Hebbian association**: co-activation builds weighted edges in a
//!   parallel graph under an hourly rate cap
//! - **Background cognition**: an idle-triggered, LLM-budget-bounded
//!   cycle for consolidation, synthesis, and pattern promotion
//!
//! The LLM itself is an external collaborator: bring any
//! [`LanguageModel`] implementation (completion + embedding) and the
//! engine does the rest locally over SQLite.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::prelude::*;
//! use std::sync::Arc;
//!
//! let config = MemoryConfig::from_env()?;
//! let service = MemoryService::open(config, Arc::new(my_model))?;
//!
//! // Store a memory
//! let outcome = service
//!     .remember(EngramDraft::new("Phoenix 1.7 uses verified routes"), None)
//!     .await?;
//!
//! // Recall
//! let hits = service
//!     .recall("verified routes", &SearchOptions::default())
//!     .await;
//! ```
//!
//! ## Feature Flags
//!
//! - `vector-search` (default): HNSW approximate search with USearch
//! - `bundled-sqlite` (default): compile SQLite into the binary

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod access;
pub mod cognition;
pub mod config;
pub mod error;
pub mod graph;
pub mod hebbian;
pub mod index;
pub mod lifecycle;
pub mod llm;
pub mod memory;
pub mod pattern;
pub mod retrieval;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod temporal;
pub mod vector;

#[cfg(test)]
pub(crate) mod test_support;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Core data model
pub use memory::{
    Category, Context, Engram, EngramDraft, Interaction, RecentFilter, ScoredEngram,
    SearchOptions, SearchStrategy, SupersessionType,
};

// Errors
pub use error::{MemoryError, Result};

// Configuration
pub use config::{MemoryConfig, ROOT_ENV_VAR};

// The assembled service
pub use service::{Collaborators, MemoryService, RememberOutcome};

// LLM collaborator surface
pub use llm::{CompleteOptions, LanguageModel, LlmError, LlmGate, LlmResult};

// Storage layer
pub use storage::{EngramStore, StorageError, WriteSerializer};

// Vector math
pub use vector::{
    cosine_int8, dequantize_int8, hamming_distance, quantize_int8, to_binary, top_k_hamming,
    VectorError,
};

// Index service
pub use index::{IndexError, IndexHandle, IndexService, IndexStats};

// Retrieval
pub use retrieval::Retriever;

// Access tracking + Hebbian linking
pub use access::{AccessTracker, CoActivation, TrackerHandle};
pub use hebbian::{HebbianLinker, LinkerHandle, LinkerStats, HEBBIAN_SOURCE};

// Associative graph
pub use graph::{
    edge_types, memory_node_name, node_types, EdgeSpec, Graph, GraphEdge, GraphNode,
};

// Temporal chains
pub use temporal::{ChainDecision, ChainManager, Novelty};

// Forgetting + maintenance
pub use lifecycle::{DbMaintenance, Forgetter, SweepReport};

// Background cognition
pub use cognition::{
    ActivityMonitor, CognitionCycle, CognitionDeps, CycleReport, CycleStats, LlmBudget,
    ProcessOutcome, ProcessResult,
};

// Patterns + promotion
pub use pattern::{
    CandidateFilter, Pattern, PatternPromoter, PatternStatus, PatternStore, PatternType,
    ProcedurePromoter, PromotionOutcome, TripleSink,
};

// Telemetry
pub use telemetry::{CapturedEvent, RecordingSink, Telemetry, TelemetrySink, TracingSink};

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
        Category, CompleteOptions, Context, Engram, EngramDraft, LanguageModel, MemoryConfig,
        MemoryError, MemoryService, RememberOutcome, Result, ScoredEngram, SearchOptions,
        SearchStrategy, SupersessionType,
    };
}
