//! Memory module - Core types and data structures
//!
//! The engram row model, search options and results, session context
//! injection, and the interaction working-memory record.

mod engram;

pub use engram::{
    Category, Engram, EngramDraft, SupersessionType, VALIDITY_EXPIRED,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// SESSION CONTEXT
// ============================================================================

/// Session context injected along write paths.
///
/// When present, its fields merge into engram metadata under the keys
/// `session_id`, `agent_type` and `model_id` - without overwriting any
/// caller-provided values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    /// Current session id
    pub session_id: Option<String>,
    /// Kind of agent producing the write
    pub agent_type: Option<String>,
    /// Model identifier producing the write
    pub model_id: Option<String>,
}

impl Context {
    /// Merge context keys into a metadata bag; caller keys win.
    pub fn merge_into(&self, metadata: &mut Map<String, Value>) {
        let pairs = [
            ("session_id", &self.session_id),
            ("agent_type", &self.agent_type),
            ("model_id", &self.model_id),
        ];
        for (key, value) in pairs {
            if let Some(value) = value {
                metadata
                    .entry(key.to_string())
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }
    }
}

// ============================================================================
// SEARCH OPTIONS
// ============================================================================

/// Retrieval strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Let the planner choose by corpus size, filters and index state
    #[default]
    Auto,
    /// Full scan with int8 cosine on every candidate
    Exact,
    /// Hamming prefilter over binary embeddings, then int8 rescore
    BinaryRescore,
    /// Approximate HNSW candidates, then int8 rescore
    Hnsw,
}

impl std::fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SearchStrategy::Auto => "auto",
            SearchStrategy::Exact => "exact",
            SearchStrategy::BinaryRescore => "binary_rescore",
            SearchStrategy::Hnsw => "hnsw",
        };
        write!(f, "{}", s)
    }
}

/// Options for a recall query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SearchOptions {
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Minimum cosine similarity
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Strategy, normally Auto
    #[serde(default)]
    pub strategy: SearchStrategy,
    /// Weight of recency in the fused score, in [0, 1]
    #[serde(default)]
    pub recency_boost: f32,
    /// Restrict to one category (forces the exact strategy under Auto)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    /// Restrict to one project
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Include superseded rows
    #[serde(default)]
    pub include_superseded: bool,
    /// Include archived rows
    #[serde(default)]
    pub include_archived: bool,
}

fn default_limit() -> usize {
    10
}

fn default_min_similarity() -> f32 {
    0.3
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_similarity: 0.3,
            strategy: SearchStrategy::Auto,
            recency_boost: 0.0,
            category: None,
            project_id: None,
            include_superseded: false,
            include_archived: false,
        }
    }
}

/// A retrieval hit with its fused score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredEngram {
    /// The matched engram
    pub engram: Engram,
    /// Cosine similarity against the query
    pub similarity: f32,
    /// Fused similarity + recency score the results are ranked by
    pub score: f32,
}

/// Filter for recent-row queries.
#[derive(Debug, Clone, Default)]
pub struct RecentFilter {
    /// Maximum rows
    pub limit: usize,
    /// Restrict to one category
    pub category: Option<Category>,
    /// Restrict to one project
    pub project_id: Option<String>,
    /// Only rows at or above this importance
    pub min_importance: Option<f32>,
}

impl RecentFilter {
    /// Most recent `limit` live rows, unrestricted.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

// ============================================================================
// INTERACTIONS (working memory)
// ============================================================================

/// One tool interaction, kept as working memory for curation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// Unique identifier
    pub id: String,
    /// Conversation thread
    pub thread_id: String,
    /// Tool that ran
    pub tool_name: String,
    /// Arguments, serialized
    pub arguments: String,
    /// Outcome summary, capped at 10 KiB
    pub result_summary: String,
    /// Execution time
    pub duration_ms: i64,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Whether a consolidation pass already absorbed it
    pub consolidated: bool,
}

// ============================================================================
// TESTS
// ============================================================================
