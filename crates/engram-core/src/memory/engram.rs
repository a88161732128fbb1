//! Engram - The unit of memory
//!
//! Each engram carries content, three embedding projections (stored at
//! the row level, not on this struct), lifecycle state for access-driven
//! decay and protection, a supersession link, and a validity window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved validity-source token set by the expiration sweep
pub const VALIDITY_EXPIRED: &str = "expired";

// ============================================================================
// CATEGORIES
// ============================================================================

/// Engram categories
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A discrete fact
    #[default]
    Fact,
    /// Something the agent did
    Action,
    /// Something the agent noticed
    Observation,
    /// A plan or intended approach
    Plan,
    /// A user or agent preference
    Preference,
    /// A higher-level summary produced by consolidation
    Consolidated,
    /// A stable anchor for a named entity
    EntityAnchor,
    /// A correction of earlier content
    Correction,
}

impl Category {
    /// String form used in storage and filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Fact => "fact",
            Category::Action => "action",
            Category::Observation => "observation",
            Category::Plan => "plan",
            Category::Preference => "preference",
            Category::Consolidated => "consolidated",
            Category::EntityAnchor => "entity_anchor",
            Category::Correction => "correction",
        }
    }

    /// Parse from a string name, defaulting to `Fact`.
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "fact" => Category::Fact,
            "action" => Category::Action,
            "observation" => Category::Observation,
            "plan" => Category::Plan,
            "preference" => Category::Preference,
            "consolidated" => Category::Consolidated,
            "entity_anchor" => Category::EntityAnchor,
            "correction" => Category::Correction,
            _ => Category::Fact,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// SUPERSESSION
// ============================================================================

/// How a newer engram replaced an older one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupersessionType {
    /// The newer content updates the older
    Update,
    /// The newer content corrects the older
    Correction,
    /// The newer content is a merged refinement
    Refinement,
}

impl SupersessionType {
    /// String form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SupersessionType::Update => "update",
            SupersessionType::Correction => "correction",
            SupersessionType::Refinement => "refinement",
        }
    }

    /// Parse from a string name.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "update" => Some(SupersessionType::Update),
            "correction" => Some(SupersessionType::Correction),
            "refinement" => Some(SupersessionType::Refinement),
            _ => None,
        }
    }
}

impl std::fmt::Display for SupersessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ENGRAM
// ============================================================================

/// A stored memory row.
///
/// The embedding projections live in the row store alongside these
/// fields; they are large and are fetched only by the retrieval paths.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Engram {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// The memory content (UTF-8, capped at 100 KiB)
    pub content: String,
    /// Category
    pub category: Category,

    // ========== Lifecycle ==========
    /// Importance in [0, 1]
    pub importance: f32,
    /// Decay rate; each access multiplies it by 0.95 (spacing effect)
    pub decay_rate: f32,
    /// Total tracked accesses
    pub access_count: i64,
    /// Last tracked access
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Protected rows are never archived or deleted by sweeps
    pub protected: bool,
    /// Archived rows are excluded from default retrieval but kept
    pub archived: bool,

    // ========== Supersession chain ==========
    /// When a newer engram replaced this one
    pub superseded_at: Option<DateTime<Utc>>,
    /// The engram this one replaced
    pub supersedes_id: Option<String>,
    /// How the replacement happened
    pub supersession_type: Option<SupersessionType>,

    // ========== Validity window ==========
    /// When this knowledge became valid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// When this knowledge stops being valid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    /// Free-text provenance; "expired" is reserved for the sweep
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validity_source: Option<String>,

    // ========== Provenance ==========
    /// Key/value bag (session_id, agent_type, model_id when injected)
    pub metadata: Map<String, Value>,
    /// Tags
    pub tags: Vec<String>,
    /// Owning project, if any
    pub project_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Default for Engram {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            content: String::new(),
            category: Category::Fact,
            importance: 0.5,
            decay_rate: 0.01,
            access_count: 0,
            last_accessed_at: None,
            protected: false,
            archived: false,
            superseded_at: None,
            supersedes_id: None,
            supersession_type: None,
            valid_from: None,
            valid_until: None,
            validity_source: None,
            metadata: Map::new(),
            tags: vec![],
            project_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Engram {
    /// Whether a newer engram replaced this one.
    pub fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }

    /// Whether the row is visible to default retrieval.
    pub fn is_live(&self) -> bool {
        !self.archived && !self.is_superseded()
    }

    /// Whether this engram was valid at the given time.
    pub fn is_valid_at(&self, time: DateTime<Utc>) -> bool {
        let after_start = self.valid_from.is_none_or(|t| time >= t);
        let before_end = self.valid_until.is_none_or(|t| time <= t);
        after_start && before_end
    }

    /// Whether the validity window has lapsed without being marked.
    pub fn needs_expiration_mark(&self, now: DateTime<Utc>) -> bool {
        !self.protected
            && self.valid_until.is_some_and(|t| t < now)
            && self.validity_source.as_deref() != Some(VALIDITY_EXPIRED)
    }
}

// ============================================================================
// DRAFTS
// ============================================================================

/// Input for storing a new engram.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngramDraft {
    /// The content to remember
    pub content: String,
    /// Category
    #[serde(default)]
    pub category: Category,
    /// Importance in [0, 1]
    #[serde(default = "default_importance")]
    pub importance: f32,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Caller metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Owning project
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// When this knowledge becomes valid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// When this knowledge stops being valid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    /// Validity provenance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validity_source: Option<String>,
}

fn default_importance() -> f32 {
    0.5
}

impl Default for EngramDraft {
    fn default() -> Self {
        Self {
            content: String::new(),
            category: Category::Fact,
            importance: 0.5,
            tags: vec![],
            metadata: Map::new(),
            project_id: None,
            valid_from: None,
            valid_until: None,
            validity_source: None,
        }
    }
}

impl EngramDraft {
    /// Draft with just content, everything else defaulted.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Set the category.
    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Set the importance.
    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
