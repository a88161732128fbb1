//! Full-Text Search
//!
//! BM25 over the FTS5 mirror of (id, content, category), with raw scores
//! squashed to [0, 1] by a sigmoid. FTS5's bm25() returns lower-is-better
//! (negative for good matches), so the raw score is negated before the
//! sigmoid. When FTS is unavailable a substring fallback answers with a
//! flat score.

use rusqlite::Connection;

use crate::memory::Category;

use super::Result;

/// Sigmoid steepness over the negated raw BM25 score
const BM25_SIGMOID_FACTOR: f32 = 0.5;

/// Flat score assigned by the substring fallback
const FALLBACK_SCORE: f32 = 0.7;

/// Strip characters that FTS5 query syntax would interpret.
///
/// Keeps alphanumerics, spaces, hyphens and underscores; everything else
/// becomes a space. Returns an empty string when nothing survives.
pub fn sanitize_fts_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a raw bm25() score to [0, 1].
pub fn normalize_bm25(raw: f32) -> f32 {
    1.0 / (1.0 + (-(-raw) * BM25_SIGMOID_FACTOR).exp())
}

/// Run a BM25-ranked text search, falling back to substring match when
/// the FTS query fails.
pub fn search_text(
    conn: &Connection,
    query: &str,
    category: Option<Category>,
    limit: usize,
) -> Result<Vec<(String, f32)>> {
    let sanitized = sanitize_fts_query(query);
    if sanitized.is_empty() {
        return Ok(vec![]);
    }

    match fts_search(conn, &sanitized, category, limit) {
        Ok(hits) => Ok(hits),
        Err(e) => {
            tracing::warn!("FTS query failed ({}), using substring fallback", e);
            substring_fallback(conn, &sanitized, category, limit)
        }
    }
}

fn fts_search(
    conn: &Connection,
    sanitized: &str,
    category: Option<Category>,
    limit: usize,
) -> rusqlite::Result<Vec<(String, f32)>> {
    let mut hits = Vec::new();
    match category {
        Some(cat) => {
            let mut stmt = conn.prepare_cached(
                "SELECT f.id, bm25(engram_fts) FROM engram_fts f
                 WHERE engram_fts MATCH ?1 AND f.category = ?2
                 ORDER BY bm25(engram_fts) LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![sanitized, cat.as_str(), limit as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)? as f32)),
            )?;
            for row in rows {
                let (id, raw) = row?;
                hits.push((id, normalize_bm25(raw)));
            }
        }
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT f.id, bm25(engram_fts) FROM engram_fts f
                 WHERE engram_fts MATCH ?1
                 ORDER BY bm25(engram_fts) LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![sanitized, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)? as f32))
            })?;
            for row in rows {
                let (id, raw) = row?;
                hits.push((id, normalize_bm25(raw)));
            }
        }
    }
    Ok(hits)
}

fn substring_fallback(
    conn: &Connection,
    sanitized: &str,
    category: Option<Category>,
    limit: usize,
) -> Result<Vec<(String, f32)>> {
    let needle = format!("%{}%", sanitized);
    let mut hits = Vec::new();
    match category {
        Some(cat) => {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM engrams
                 WHERE content LIKE ?1 AND category = ?2
                   AND archived = 0 AND superseded_at IS NULL
                 ORDER BY created_at DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![needle, cat.as_str(), limit as i64],
                |row| row.get::<_, String>(0),
            )?;
            for row in rows {
                hits.push((row?, FALLBACK_SCORE));
            }
        }
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM engrams
                 WHERE content LIKE ?1 AND archived = 0 AND superseded_at IS NULL
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![needle, limit as i64], |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                hits.push((row?, FALLBACK_SCORE));
            }
        }
    }
    Ok(hits)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_fts_syntax() {
        assert_eq!(sanitize_fts_query("hello AND world"), "hello AND world");
        assert_eq!(sanitize_fts_query("a\"b* (c) -d"), "a b c -d");
        assert_eq!(sanitize_fts_query("'; DROP TABLE --"), "DROP TABLE --");
        assert_eq!(sanitize_fts_query("!!!"), "");
    }

    #[test]
    fn test_normalize_bm25_range() {
        // Strong match: very negative raw score => close to 1
        assert!(normalize_bm25(-10.0) > 0.99);
        // No signal
        assert!((normalize_bm25(0.0) - 0.5).abs() < 1e-6);
        // Positive raw (worse than baseline) => below 0.5
        assert!(normalize_bm25(5.0) < 0.5);
    }

    #[test]
    fn test_normalize_bm25_monotone() {
        let mut last = f32::MAX;
        for raw in [-8.0f32, -4.0, -1.0, 0.0, 2.0] {
            let score = normalize_bm25(raw);
            assert!(score < last);
            last = score;
        }
    }
}
