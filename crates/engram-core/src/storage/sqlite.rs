//! Engram Store
//!
//! Row-level CRUD over the SQLite substrate. Reads go through a
//! dedicated reader connection; every mutation goes through the
//! WriteSerializer. Embeddings are stored in three projections on the
//! row itself: int8 (+ scale/offset), the derived binary form, and the
//! original f32 only when quantization fails.

use std::path::Path;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::memory::{
    Category, Context, Engram, EngramDraft, Interaction, RecentFilter, SearchOptions,
    SupersessionType,
};
use crate::telemetry::Telemetry;
use crate::vector::{quantize_int8, to_binary};

use super::{fts, migrations, Result, StorageError, WriteSerializer};

// ============================================================================
// VALIDATION
// ============================================================================

/// Obvious test/dummy strings rejected in production builds
const TEST_PATTERNS: &[&str] = &[
    "test",
    "testing",
    "test memory",
    "test content",
    "hello world",
    "foo bar",
    "lorem ipsum",
    "asdf",
    "dummy",
    "sample text",
];

/// Content too generic to ever be retrieved usefully
static GENERIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^user\s+(frequently\s+)?interacts?\b",
        r"(?i)^(the\s+)?user\s+(often\s+)?(likes|uses|prefers|does)\s+(things|stuff|items)\b",
        r"(?i)^(general|misc(ellaneous)?)\s+(info|information|notes?)$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Importance at or above which rows auto-protect on insert
const AUTO_PROTECT_IMPORTANCE: f32 = 0.85;

/// Decay-rate floor enforced by access updates
const DECAY_RATE_FLOOR: f64 = 0.0001;

/// Spacing-effect multiplier per access
const DECAY_SPACING_FACTOR: f64 = 0.95;

/// Interaction summary cap
const MAX_SUMMARY_BYTES: usize = 10 * 1024;

// ============================================================================
// ROW FILTER
// ============================================================================

/// Visibility and scoping filter shared by the retrieval scans.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    /// Restrict to one category
    pub category: Option<Category>,
    /// Restrict to one project
    pub project_id: Option<String>,
    /// Include superseded rows
    pub include_superseded: bool,
    /// Include archived rows
    pub include_archived: bool,
}

impl RowFilter {
    /// Derive from search options.
    pub fn from_options(opts: &SearchOptions) -> Self {
        Self {
            category: opts.category,
            project_id: opts.project_id.clone(),
            include_superseded: opts.include_superseded,
            include_archived: opts.include_archived,
        }
    }

    /// Render as SQL conditions plus bound values, in order.
    fn conditions(&self) -> (Vec<&'static str>, Vec<SqlValue>) {
        let mut conds = Vec::new();
        let mut values = Vec::new();
        if !self.include_archived {
            conds.push("archived = 0");
        }
        if !self.include_superseded {
            conds.push("superseded_at IS NULL");
        }
        if let Some(cat) = self.category {
            conds.push("category = ?");
            values.push(SqlValue::Text(cat.as_str().to_string()));
        }
        if let Some(project) = &self.project_id {
            conds.push("project_id = ?");
            values.push(SqlValue::Text(project.clone()));
        }
        (conds, values)
    }
}

// ============================================================================
// SCAN ROWS
// ============================================================================

/// One row's int8 projection, as the retrieval strategies consume it.
#[derive(Debug, Clone)]
pub struct Int8Row {
    /// Engram id
    pub id: String,
    /// Quantized embedding bytes
    pub bytes: Vec<i8>,
    /// Row creation time (for recency fusion)
    pub created_at: DateTime<Utc>,
}

/// Column list shared by every engram SELECT
const ENGRAM_COLUMNS: &str = "id, content, category, importance, decay_rate, access_count, \
     last_accessed_at, protected, archived, superseded_at, supersedes_id, supersession_type, \
     valid_from, valid_until, validity_source, metadata, tags, project_id, created_at, updated_at";

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed engram store.
pub struct EngramStore {
    writer: WriteSerializer,
    reader: Mutex<Connection>,
    telemetry: Telemetry,
    config: MemoryConfig,
}

impl EngramStore {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (and migrate) the store at the configured path.
    pub fn open(config: &MemoryConfig, telemetry: Telemetry) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open_at(config.db_path().as_path(), config, telemetry)
    }

    /// Open at an explicit path (tests use a temp dir).
    pub fn open_at(path: &Path, config: &MemoryConfig, telemetry: Telemetry) -> Result<Self> {
        let writer_conn = Connection::open(path)?;
        Self::configure_connection(&writer_conn)?;
        migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: WriteSerializer::new(writer_conn),
            reader: Mutex::new(reader_conn),
            telemetry: telemetry.clone(),
            config: config.clone(),
        })
    }

    /// Run a read-only closure on the reader connection.
    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| StorageError::Init("reader lock poisoned".to_string()))?;
        Ok(f(&conn)?)
    }

    /// Run a mutation through the serializer.
    pub(crate) fn write<T>(
        &self,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        self.writer.run(f)
    }

    /// Run a multi-statement mutation in one serialized transaction.
    pub(crate) fn write_tx<T>(
        &self,
        f: impl Fn(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        self.writer.transaction(f)
    }

    // ========================================================================
    // VALIDATION
    // ========================================================================

    /// Validate content against the insert rules.
    pub fn validate_content(&self, content: &str) -> Result<()> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(StorageError::InvalidContent("content is empty".to_string()));
        }
        if content.len() > self.config.max_content_bytes {
            return Err(StorageError::InvalidContent(format!(
                "content exceeds {} bytes",
                self.config.max_content_bytes
            )));
        }
        if self.config.reject_test_patterns {
            let lowered = trimmed.to_lowercase();
            if TEST_PATTERNS.contains(&lowered.as_str()) {
                return Err(StorageError::InvalidContent(
                    "test content rejected".to_string(),
                ));
            }
        }
        if GENERIC_PATTERNS.iter().any(|p| p.is_match(trimmed)) {
            return Err(StorageError::InvalidContent(
                "content too generic to be useful".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // INSERT
    // ========================================================================

    /// Insert a new engram with its embedding.
    ///
    /// Validates, quantizes (falling back to f32 storage when the vector
    /// is not finite), auto-protects high-importance and entity-anchor
    /// rows, and emits the `stored` event.
    pub fn insert(
        &self,
        draft: &EngramDraft,
        embedding: &[f32],
        ctx: Option<&Context>,
    ) -> Result<Engram> {
        self.insert_inner(draft, embedding, ctx, None)
    }

    /// Insert a new engram that supersedes an existing one, marking the
    /// old row in the same transaction.
    pub fn insert_superseding(
        &self,
        draft: &EngramDraft,
        embedding: &[f32],
        ctx: Option<&Context>,
        supersedes: &str,
        kind: SupersessionType,
    ) -> Result<Engram> {
        self.insert_inner(draft, embedding, ctx, Some((supersedes, kind)))
    }

    fn insert_inner(
        &self,
        draft: &EngramDraft,
        embedding: &[f32],
        ctx: Option<&Context>,
        supersedes: Option<(&str, SupersessionType)>,
    ) -> Result<Engram> {
        self.validate_content(&draft.content)?;
        if embedding.is_empty() {
            return Err(StorageError::InvalidContent(
                "embedding must not be empty".to_string(),
            ));
        }

        // Quantize before entering the serialized section.
        let finite = embedding.iter().all(|x| x.is_finite());
        let (int8, scale, offset, bin, f32_fallback) = if finite {
            match quantize_int8(embedding) {
                Ok((bytes, scale, offset)) => {
                    let bin = to_binary(&bytes)
                        .map_err(|e| StorageError::Init(e.to_string()))?;
                    (Some(bytes), Some(scale), Some(offset), Some(bin), None)
                }
                Err(e) => {
                    tracing::warn!("quantization failed ({}), storing f32 only", e);
                    (None, None, None, None, Some(f32_to_bytes(embedding)))
                }
            }
        } else {
            tracing::warn!("non-finite embedding, storing f32 only");
            (None, None, None, None, Some(f32_to_bytes(embedding)))
        };

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let importance = draft.importance.clamp(0.0, 1.0);
        let protected =
            importance >= AUTO_PROTECT_IMPORTANCE || draft.category == Category::EntityAnchor;

        let mut metadata = draft.metadata.clone();
        if let Some(ctx) = ctx {
            ctx.merge_into(&mut metadata);
        }
        let metadata_json = Value::Object(metadata).to_string();
        let tags_json = serde_json::to_string(&draft.tags).unwrap_or_else(|_| "[]".to_string());
        let int8_blob = int8.map(|bytes| bytes.iter().map(|&b| b as u8).collect::<Vec<u8>>());

        self.write_tx(|tx| {
            tx.execute(
                "INSERT INTO engrams (
                    id, content, category, importance, decay_rate,
                    protected, supersedes_id,
                    valid_from, valid_until, validity_source,
                    metadata, tags, project_id, created_at, updated_at,
                    emb_int8, emb_scale, emb_offset, emb_bin, emb_f32
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    ?6, ?7,
                    ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20
                )",
                params![
                    id,
                    draft.content,
                    draft.category.as_str(),
                    importance,
                    0.01f64,
                    protected,
                    supersedes.map(|(old, _)| old),
                    draft.valid_from,
                    draft.valid_until,
                    draft.validity_source,
                    metadata_json,
                    tags_json,
                    draft.project_id,
                    now,
                    now,
                    int8_blob,
                    scale,
                    offset,
                    bin,
                    f32_fallback,
                ],
            )?;

            if let Some((old_id, kind)) = supersedes {
                tx.execute(
                    "UPDATE engrams SET superseded_at = ?1, supersession_type = ?2,
                            updated_at = ?1
                     WHERE id = ?3",
                    params![now, kind.as_str(), old_id],
                )?;
            }
            Ok(())
        })?;

        self.telemetry.emit(
            "stored",
            json!({ "content_bytes": draft.content.len() }),
            json!({
                "id": id,
                "category": draft.category.as_str(),
                "project_id": draft.project_id,
                "tags": draft.tags,
            }),
        );

        self.get(&id)?.ok_or(StorageError::NotFound(id))
    }

    // ========================================================================
    // READ
    // ========================================================================

    /// Fetch one engram by id.
    pub fn get(&self, id: &str) -> Result<Option<Engram>> {
        let sql = format!("SELECT {} FROM engrams WHERE id = ?1", ENGRAM_COLUMNS);
        self.read(|conn| {
            conn.query_row(&sql, [id], row_to_engram).optional()
        })
    }

    /// Fetch several engrams by id (order unspecified).
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Engram>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM engrams WHERE id IN ({})",
            ENGRAM_COLUMNS,
            placeholders(ids.len())
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_engram)?;
            rows.collect()
        })
    }

    /// Recent live rows, newest first.
    pub fn get_recent(&self, filter: &RecentFilter) -> Result<Vec<Engram>> {
        let mut sql = format!(
            "SELECT {} FROM engrams WHERE archived = 0 AND superseded_at IS NULL",
            ENGRAM_COLUMNS
        );
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(cat) = filter.category {
            sql.push_str(" AND category = ?");
            values.push(SqlValue::Text(cat.as_str().to_string()));
        }
        if let Some(project) = &filter.project_id {
            sql.push_str(" AND project_id = ?");
            values.push(SqlValue::Text(project.clone()));
        }
        if let Some(min) = filter.min_importance {
            sql.push_str(" AND importance >= ?");
            values.push(SqlValue::Real(min as f64));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        values.push(SqlValue::Integer(filter.limit.max(1) as i64));

        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_engram)?;
            rows.collect()
        })
    }

    /// Live row count.
    pub fn count_live(&self) -> Result<usize> {
        self.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM engrams WHERE archived = 0 AND superseded_at IS NULL",
                [],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as usize)
    }

    /// Rows matching the filter that carry a binary embedding.
    pub fn count_binary(&self, filter: &RowFilter) -> Result<usize> {
        let (conds, values) = filter.conditions();
        let mut sql = "SELECT COUNT(*) FROM engrams WHERE emb_bin IS NOT NULL".to_string();
        for cond in conds {
            sql.push_str(" AND ");
            sql.push_str(cond);
        }
        self.read(|conn| {
            conn.query_row(&sql, params_from_iter(values.iter()), |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as usize)
    }

    // ========================================================================
    // EMBEDDING SCANS
    // ========================================================================

    /// All int8 rows matching the filter (the exact strategy's scan).
    pub fn scan_int8(&self, filter: &RowFilter) -> Result<Vec<Int8Row>> {
        let (conds, values) = filter.conditions();
        let mut sql =
            "SELECT id, emb_int8, created_at FROM engrams WHERE emb_int8 IS NOT NULL".to_string();
        for cond in conds {
            sql.push_str(" AND ");
            sql.push_str(cond);
        }
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_int8)?;
            rows.collect()
        })
    }

    /// One keyset-paginated chunk of binary rows: `(rowid, id, bits)`
    /// with `rowid > after`, ascending.
    pub fn scan_binary_chunk(
        &self,
        filter: &RowFilter,
        after: i64,
        chunk: usize,
    ) -> Result<Vec<(i64, String, Vec<u8>)>> {
        let (conds, mut values) = filter.conditions();
        let mut sql =
            "SELECT rowid, id, emb_bin FROM engrams WHERE emb_bin IS NOT NULL AND rowid > ?"
                .to_string();
        let mut ordered: Vec<SqlValue> = vec![SqlValue::Integer(after)];
        for cond in conds {
            sql.push_str(" AND ");
            sql.push_str(cond);
        }
        ordered.append(&mut values);
        sql.push_str(" ORDER BY rowid LIMIT ?");
        ordered.push(SqlValue::Integer(chunk as i64));

        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ordered.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;
            rows.collect()
        })
    }

    /// Int8 rows for a set of ids (the rescore stage).
    pub fn int8_by_ids(&self, ids: &[String]) -> Result<Vec<Int8Row>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT id, emb_int8, created_at FROM engrams
             WHERE emb_int8 IS NOT NULL AND id IN ({})",
            placeholders(ids.len())
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_int8)?;
            rows.collect()
        })
    }

    /// One chunk of live int8 rows for index rebuild:
    /// `(rowid, id, bytes, scale, offset)`.
    pub fn rebuild_chunk(
        &self,
        after: i64,
        chunk: usize,
    ) -> Result<Vec<(i64, String, Vec<i8>, f32, f32)>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid, id, emb_int8, emb_scale, emb_offset FROM engrams
                 WHERE emb_int8 IS NOT NULL AND archived = 0 AND superseded_at IS NULL
                   AND rowid > ?1
                 ORDER BY rowid LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after, chunk as i64], |row| {
                let bytes: Vec<u8> = row.get(2)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    bytes.iter().map(|&b| b as i8).collect(),
                    row.get::<_, f64>(3)? as f32,
                    row.get::<_, f64>(4)? as f32,
                ))
            })?;
            rows.collect()
        })
    }

    /// The engram that superseded this one, if any (earliest successor
    /// when several claim the same ancestor).
    pub fn successor_of(&self, id: &str) -> Result<Option<Engram>> {
        let sql = format!(
            "SELECT {} FROM engrams WHERE supersedes_id = ?1 ORDER BY created_at ASC LIMIT 1",
            ENGRAM_COLUMNS
        );
        self.read(|conn| conn.query_row(&sql, [id], row_to_engram).optional())
    }

    /// Live rows carrying a tag, newest first.
    pub fn find_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Engram>> {
        let needle = format!("%\"{}\"%", tag);
        let sql = format!(
            "SELECT {} FROM engrams
             WHERE archived = 0 AND superseded_at IS NULL AND tags LIKE ?1
             ORDER BY created_at DESC LIMIT ?2",
            ENGRAM_COLUMNS
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![needle, limit as i64], row_to_engram)?;
            rows.collect()
        })
    }

    // ========================================================================
    // TEXT SEARCH
    // ========================================================================

    /// BM25-ranked text search with sigmoid-normalized scores.
    pub fn search_text(
        &self,
        query: &str,
        category: Option<Category>,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| StorageError::Init("reader lock poisoned".to_string()))?;
        fts::search_text(&conn, query, category, limit)
    }

    // ========================================================================
    // LIFECYCLE MUTATIONS
    // ========================================================================

    /// Update importance. Zero is a forbidden primitive - deletion must
    /// go through archive.
    pub fn update_importance(&self, id: &str, importance: f32) -> Result<()> {
        if importance <= 0.0 {
            return Err(StorageError::Forbidden(
                "importance 0 is not a deletion mechanism; archive instead".to_string(),
            ));
        }
        let importance = importance.min(1.0);
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE engrams SET importance = ?1, updated_at = ?2 WHERE id = ?3",
                params![importance, Utc::now(), id],
            )
        })?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Update the validity provenance string.
    pub fn update_validity_source(&self, id: &str, source: &str) -> Result<()> {
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE engrams SET validity_source = ?1, updated_at = ?2 WHERE id = ?3",
                params![source, Utc::now(), id],
            )
        })?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Mark `old_id` as superseded by `new_id`.
    pub fn supersede(&self, old_id: &str, new_id: &str, kind: SupersessionType) -> Result<()> {
        let now = Utc::now();
        self.write_tx(|tx| {
            tx.execute(
                "UPDATE engrams SET superseded_at = ?1, supersession_type = ?2, updated_at = ?1
                 WHERE id = ?3",
                params![now, kind.as_str(), old_id],
            )?;
            tx.execute(
                "UPDATE engrams SET supersedes_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![old_id, now, new_id],
            )?;
            Ok(())
        })
    }

    /// Archive a row. Refused for protected rows.
    pub fn archive(&self, id: &str) -> Result<()> {
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE engrams SET archived = 1, updated_at = ?1 WHERE id = ?2 AND protected = 0",
                params![Utc::now(), id],
            )
        })?;
        if changed == 0 {
            return match self.get(id)? {
                Some(_) => Err(StorageError::Protected(id.to_string())),
                None => Err(StorageError::NotFound(id.to_string())),
            };
        }
        Ok(())
    }

    /// Hard-delete a row. Administrative path only; refused for
    /// protected rows.
    pub fn purge(&self, id: &str) -> Result<()> {
        let changed = self.write(|conn| {
            conn.execute("DELETE FROM engrams WHERE id = ?1 AND protected = 0", [id])
        })?;
        if changed == 0 {
            return match self.get(id)? {
                Some(_) => Err(StorageError::Protected(id.to_string())),
                None => Err(StorageError::NotFound(id.to_string())),
            };
        }
        Ok(())
    }

    /// Set the protected flag directly.
    pub fn set_protected(&self, id: &str, protected: bool) -> Result<()> {
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE engrams SET protected = ?1, updated_at = ?2 WHERE id = ?3",
                params![protected, Utc::now(), id],
            )
        })?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // ACCESS UPDATES (called by the access tracker on flush)
    // ========================================================================

    /// Apply one access-count increment group: bump counters, refresh
    /// `last_accessed_at`, and tighten `decay_rate` by the spacing
    /// factor (clamped at the floor).
    pub fn apply_access_batch(&self, ids: &[String], increment: u32) -> Result<usize> {
        if ids.is_empty() || increment == 0 {
            return Ok(0);
        }
        let factor = DECAY_SPACING_FACTOR.powi(increment as i32);
        let sql = format!(
            "UPDATE engrams SET
                access_count = access_count + ?1,
                last_accessed_at = ?2,
                decay_rate = MAX(?3, decay_rate * ?4)
             WHERE id IN ({})",
            placeholders_from(5, ids.len())
        );
        self.write(|conn| {
            let mut values: Vec<SqlValue> = vec![
                SqlValue::Integer(increment as i64),
                SqlValue::Text(Utc::now().to_rfc3339()),
                SqlValue::Real(DECAY_RATE_FLOOR),
                SqlValue::Real(factor),
            ];
            values.extend(ids.iter().map(|id| SqlValue::Text(id.clone())));
            conn.execute(&sql, params_from_iter(values.iter()))
        })
    }

    /// Auto-protect hot rows among the flushed set.
    pub fn apply_auto_protect(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE engrams SET protected = 1, updated_at = ?1
             WHERE protected = 0 AND access_count >= 10 AND importance >= 0.5
               AND id IN ({})",
            placeholders_from(2, ids.len())
        );
        self.write(|conn| {
            let mut values: Vec<SqlValue> = vec![SqlValue::Text(Utc::now().to_rfc3339())];
            values.extend(ids.iter().map(|id| SqlValue::Text(id.clone())));
            conn.execute(&sql, params_from_iter(values.iter()))
        })
    }

    // ========================================================================
    // INTERACTIONS (working memory)
    // ========================================================================

    /// Record one tool interaction. The result summary is truncated to
    /// its cap at a char boundary.
    pub fn record_interaction(
        &self,
        thread_id: &str,
        tool_name: &str,
        arguments: &str,
        result_summary: &str,
        duration_ms: i64,
    ) -> Result<Interaction> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut summary = result_summary.to_string();
        if summary.len() > MAX_SUMMARY_BYTES {
            let mut cut = MAX_SUMMARY_BYTES;
            while !summary.is_char_boundary(cut) {
                cut -= 1;
            }
            summary.truncate(cut);
        }

        self.write(|conn| {
            conn.execute(
                "INSERT INTO interactions
                    (id, thread_id, tool_name, arguments, result_summary, duration_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, thread_id, tool_name, arguments, summary, duration_ms, now],
            )
        })?;

        Ok(Interaction {
            id,
            thread_id: thread_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments: arguments.to_string(),
            result_summary: summary,
            duration_ms,
            timestamp: now,
            consolidated: false,
        })
    }

    /// Recent interactions, newest first.
    pub fn recent_interactions(
        &self,
        limit: usize,
        only_unconsolidated: bool,
    ) -> Result<Vec<Interaction>> {
        let sql = if only_unconsolidated {
            "SELECT id, thread_id, tool_name, arguments, result_summary, duration_ms,
                    timestamp, consolidated
             FROM interactions WHERE consolidated = 0
             ORDER BY timestamp DESC LIMIT ?1"
        } else {
            "SELECT id, thread_id, tool_name, arguments, result_summary, duration_ms,
                    timestamp, consolidated
             FROM interactions ORDER BY timestamp DESC LIMIT ?1"
        };
        self.read(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok(Interaction {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    tool_name: row.get(2)?,
                    arguments: row.get(3)?,
                    result_summary: row.get(4)?,
                    duration_ms: row.get(5)?,
                    timestamp: row.get(6)?,
                    consolidated: row.get(7)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Mark interactions as absorbed by consolidation.
    pub fn mark_consolidated(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE interactions SET consolidated = 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        self.write(|conn| conn.execute(&sql, params_from_iter(ids.iter())))
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn row_to_engram(row: &rusqlite::Row<'_>) -> rusqlite::Result<Engram> {
    let category: String = row.get(2)?;
    let supersession_type: Option<String> = row.get(11)?;
    let metadata: String = row.get(15)?;
    let tags: String = row.get(16)?;

    Ok(Engram {
        id: row.get(0)?,
        content: row.get(1)?,
        category: Category::parse_name(&category),
        importance: row.get::<_, f64>(3)? as f32,
        decay_rate: row.get::<_, f64>(4)? as f32,
        access_count: row.get(5)?,
        last_accessed_at: row.get(6)?,
        protected: row.get(7)?,
        archived: row.get(8)?,
        superseded_at: row.get(9)?,
        supersedes_id: row.get(10)?,
        supersession_type: supersession_type
            .as_deref()
            .and_then(SupersessionType::parse_name),
        valid_from: row.get(12)?,
        valid_until: row.get(13)?,
        validity_source: row.get(14)?,
        metadata: serde_json::from_str::<Map<String, Value>>(&metadata).unwrap_or_default(),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        project_id: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn row_to_int8(row: &rusqlite::Row<'_>) -> rusqlite::Result<Int8Row> {
    let bytes: Vec<u8> = row.get(1)?;
    Ok(Int8Row {
        id: row.get(0)?,
        bytes: bytes.iter().map(|&b| b as i8).collect(),
        created_at: row.get(2)?,
    })
}

fn f32_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

fn placeholders_from(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// TESTS
// ============================================================================
