//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

use rusqlite::Connection;

use super::Result;

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Engram rows, embedding projections, FTS5",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Associative graph nodes and edges",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Patterns and interaction working memory",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: engrams + embeddings + FTS5
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS engrams (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'fact',

    -- Lifecycle
    importance REAL NOT NULL DEFAULT 0.5,
    decay_rate REAL NOT NULL DEFAULT 0.01,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    protected INTEGER NOT NULL DEFAULT 0,
    archived INTEGER NOT NULL DEFAULT 0,

    -- Supersession chain
    superseded_at TEXT,
    supersedes_id TEXT,
    supersession_type TEXT,

    -- Validity window
    valid_from TEXT,
    valid_until TEXT,
    validity_source TEXT,

    -- Provenance
    metadata TEXT NOT NULL DEFAULT '{}',
    tags TEXT NOT NULL DEFAULT '[]',
    project_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    -- Embedding projections (int8 + derived binary; f32 only as fallback)
    emb_int8 BLOB,
    emb_scale REAL,
    emb_offset REAL,
    emb_bin BLOB,
    emb_f32 BLOB
);

CREATE INDEX IF NOT EXISTS idx_engrams_category ON engrams(category);
CREATE INDEX IF NOT EXISTS idx_engrams_created ON engrams(created_at);
CREATE INDEX IF NOT EXISTS idx_engrams_importance ON engrams(importance);
CREATE INDEX IF NOT EXISTS idx_engrams_archived ON engrams(archived);
CREATE INDEX IF NOT EXISTS idx_engrams_superseded ON engrams(superseded_at);
CREATE INDEX IF NOT EXISTS idx_engrams_valid_until ON engrams(valid_until);
CREATE INDEX IF NOT EXISTS idx_engrams_project ON engrams(project_id);
CREATE INDEX IF NOT EXISTS idx_engrams_supersedes ON engrams(supersedes_id);

-- FTS5 over (id, content, category), kept in sync by triggers
CREATE VIRTUAL TABLE IF NOT EXISTS engram_fts USING fts5(
    id,
    content,
    category,
    content='engrams',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS engrams_ai AFTER INSERT ON engrams BEGIN
    INSERT INTO engram_fts(rowid, id, content, category)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.category);
END;

CREATE TRIGGER IF NOT EXISTS engrams_ad AFTER DELETE ON engrams BEGIN
    INSERT INTO engram_fts(engram_fts, rowid, id, content, category)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.category);
END;

CREATE TRIGGER IF NOT EXISTS engrams_au AFTER UPDATE OF content, category ON engrams BEGIN
    INSERT INTO engram_fts(engram_fts, rowid, id, content, category)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.category);
    INSERT INTO engram_fts(rowid, id, content, category)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.category);
END;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

/// V2: associative graph
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS graph_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_type TEXT NOT NULL,
    name TEXT NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    UNIQUE(node_type, name)
);

CREATE TABLE IF NOT EXISTS graph_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_node_id INTEGER NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    target_node_id INTEGER NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    edge_type TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 0.5,
    properties TEXT NOT NULL DEFAULT '{}',
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON graph_edges(source_node_id, edge_type);
CREATE INDEX IF NOT EXISTS idx_edges_target ON graph_edges(target_node_id, edge_type);
CREATE INDEX IF NOT EXISTS idx_nodes_type ON graph_nodes(node_type);
"#;

/// V3: patterns + interactions
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    pattern_type TEXT NOT NULL,
    description TEXT NOT NULL,
    components TEXT NOT NULL DEFAULT '[]',
    trigger_conditions TEXT NOT NULL DEFAULT '[]',
    occurrences INTEGER NOT NULL DEFAULT 0,
    success_rate REAL NOT NULL DEFAULT 0.0,
    strength REAL NOT NULL DEFAULT 0.0,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_patterns_status ON patterns(status);
CREATE INDEX IF NOT EXISTS idx_patterns_type ON patterns(pattern_type);

CREATE TABLE IF NOT EXISTS interactions (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL DEFAULT '',
    result_summary TEXT NOT NULL DEFAULT '',
    duration_ms INTEGER NOT NULL DEFAULT 0,
    timestamp TEXT NOT NULL,
    consolidated INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_interactions_thread ON interactions(thread_id);
CREATE INDEX IF NOT EXISTS idx_interactions_consolidated ON interactions(consolidated);
"#;

/// Apply all pending migrations.
pub fn apply_migrations(conn: &Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    let mut applied = 0;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
        tx.commit()?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied migration"
        );
        applied += 1;
    }

    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================
