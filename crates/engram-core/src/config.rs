//! Configuration
//!
//! One root directory (ENGRAM_ROOT, or the platform data dir) holds the
//! row store, the vector index blob, the maintenance state file and the
//! backup directory. Every tunable the components consume lives here as
//! an explicit field.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

/// Environment variable naming the root directory
pub const ROOT_ENV_VAR: &str = "ENGRAM_ROOT";

/// Memory system configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Root directory for all on-disk state
    pub root_dir: PathBuf,
    /// Expected embedding dimensions
    pub dimensions: usize,

    // ========== Retrieval ==========
    /// Minimum indexed vectors before HNSW answers searches
    pub hnsw_threshold: usize,
    /// Minimum binary-embedded rows before the binary prefilter is worth it
    pub binary_threshold: usize,
    /// Rows per chunk when streaming binary scans
    pub scan_chunk_size: usize,

    // ========== Temporal chains ==========
    /// Similarity at or above which new content is redundant
    pub redundant_floor: f32,
    /// Similarity at or above which novelty is ambiguous (LLM decides)
    pub ambiguous_floor: f32,

    // ========== Forgetting ==========
    /// Age in days after which sub-0.7-importance rows are archived
    pub default_ttl_days: i64,
    /// Age in days after which sub-0.5-importance rows are archived
    pub low_importance_ttl_days: i64,
    /// Live-row cap enforced by the hourly sweep
    pub max_count: usize,

    // ========== Access tracking ==========
    /// Pending ids that force a flush
    pub access_flush_size: usize,
    /// Wall-clock flush interval
    pub access_flush_interval: Duration,
    /// Co-activation pairing window
    pub coactivation_window: Duration,

    // ========== Hebbian linking ==========
    /// New edges allowed per rolling hour
    pub hebbian_hourly_cap: usize,

    // ========== Background cognition ==========
    /// Quiet time required before a cycle may start
    pub idle_threshold: Duration,
    /// Minimum spacing between completed cycles
    pub cycle_spacing: Duration,
    /// Scheduler poll interval
    pub scheduler_tick: Duration,
    /// LLM completion calls allowed per cycle
    pub llm_calls_per_cycle: u32,
    /// Minimum gap between budgeted calls inside a cycle
    pub llm_call_gap: Duration,

    // ========== LLM gate ==========
    /// Per-call timeout; a timed-out call is missing, never a success
    pub llm_timeout: Duration,

    // ========== Index persistence ==========
    /// Auto-save interval while the index is dirty
    pub index_save_interval: Duration,

    // ========== Validation ==========
    /// Maximum content size in bytes
    pub max_content_bytes: usize,
    /// Reject obvious test/dummy strings (on for release builds)
    pub reject_test_patterns: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            dimensions: 768,
            hnsw_threshold: 1000,
            binary_threshold: 500,
            scan_chunk_size: 10_000,
            redundant_floor: 0.95,
            ambiguous_floor: 0.85,
            default_ttl_days: 30,
            low_importance_ttl_days: 7,
            max_count: 100_000,
            access_flush_size: 100,
            access_flush_interval: Duration::from_secs(5),
            coactivation_window: Duration::from_secs(30),
            hebbian_hourly_cap: 500,
            idle_threshold: Duration::from_secs(30),
            cycle_spacing: Duration::from_secs(3600),
            scheduler_tick: Duration::from_secs(120),
            llm_calls_per_cycle: 10,
            llm_call_gap: Duration::from_secs(10),
            llm_timeout: Duration::from_secs(30),
            index_save_interval: Duration::from_secs(300),
            max_content_bytes: 100 * 1024,
            reject_test_patterns: !cfg!(debug_assertions),
        }
    }
}

impl MemoryConfig {
    /// Resolve the root from ENGRAM_ROOT, falling back to the platform
    /// data directory.
    pub fn from_env() -> std::io::Result<Self> {
        let root = match std::env::var(ROOT_ENV_VAR) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                let proj_dirs = ProjectDirs::from("dev", "engram", "core").ok_or_else(|| {
                    std::io::Error::other("could not determine project directories")
                })?;
                proj_dirs.data_dir().to_path_buf()
            }
        };
        Ok(Self::with_root(root))
    }

    /// Use an explicit root directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root.into(),
            ..Default::default()
        }
    }

    /// Create the root directory tree (root + backups).
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root_dir)?;
        std::fs::create_dir_all(self.backup_dir())?;
        Ok(())
    }

    /// Path to the SQLite row store.
    pub fn db_path(&self) -> PathBuf {
        self.root_dir.join("engram.db")
    }

    /// Path to the HNSW index blob.
    pub fn index_path(&self) -> PathBuf {
        self.root_dir.join("engram.usearch")
    }

    /// Path to the maintenance state file.
    pub fn maintenance_path(&self) -> PathBuf {
        self.root_dir.join("maintenance.json")
    }

    /// Backup directory.
    pub fn backup_dir(&self) -> PathBuf {
        self.root_dir.join("backups")
    }
}

// ============================================================================
// TESTS
// ============================================================================
