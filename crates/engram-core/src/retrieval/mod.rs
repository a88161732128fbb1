//! Retrieval Planner
//!
//! Chooses among three strategies by corpus size, filters and index
//! readiness:
//!
//! - **exact**: int8 cosine over every filtered row
//! - **binary_rescore**: streamed Hamming prefilter over the binary
//!   projection, then int8 cosine on the survivors
//! - **hnsw**: approximate candidates from the index, cosine recomputed
//!   on the stored bytes (the index distance is advisory only)
//!
//! Scores fuse similarity with recency; returned ids flow to the access
//! tracker asynchronously.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::access::TrackerHandle;
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::index::{IndexError, IndexHandle};
use crate::llm::LlmGate;
use crate::memory::{Engram, ScoredEngram, SearchOptions, SearchStrategy};
use crate::storage::{EngramStore, Int8Row, RowFilter};
use crate::vector::{cosine_int8, hamming_distance, quantize_int8, to_binary, HammingTopK};

/// Candidate overfetch multiplier for the two-stage strategies
const OVERFETCH: usize = 10;

/// Query-embedding cache capacity
const QUERY_CACHE_SIZE: usize = 100;

/// Recency half-life in days for the fused score
const RECENCY_HALF_LIFE_DAYS: f32 = 7.0;

/// A candidate before hydration.
struct Candidate {
    id: String,
    similarity: f32,
    created_at: DateTime<Utc>,
}

// ============================================================================
// RETRIEVER
// ============================================================================

/// The retrieval planner and executor.
pub struct Retriever {
    store: Arc<EngramStore>,
    index: IndexHandle,
    gate: Arc<LlmGate>,
    tracker: Option<TrackerHandle>,
    config: MemoryConfig,
    /// Repeated queries skip the embedding call
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Retriever {
    /// Wire up the planner.
    pub fn new(
        store: Arc<EngramStore>,
        index: IndexHandle,
        gate: Arc<LlmGate>,
        tracker: Option<TrackerHandle>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            index,
            gate,
            tracker,
            config,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("nonzero"),
            )),
        }
    }

    /// Recall engrams for a text query.
    ///
    /// Non-fatal failures (embedding unavailable, index down, storage
    /// hiccups) come back as an empty result with a log line - recall
    /// never errors at the caller.
    pub async fn recall(&self, query: &str, opts: &SearchOptions) -> Vec<ScoredEngram> {
        if query.trim().is_empty() {
            return vec![];
        }

        let embedding = {
            let cached = self
                .query_cache
                .lock()
                .ok()
                .and_then(|mut cache| cache.get(query).cloned());
            match cached {
                Some(hit) => hit,
                None => match self.gate.embed(query).await {
                    Ok(vector) => {
                        if let Ok(mut cache) = self.query_cache.lock() {
                            cache.put(query.to_string(), vector.clone());
                        }
                        vector
                    }
                    Err(e) => {
                        tracing::warn!("query embedding failed, returning empty: {}", e);
                        return vec![];
                    }
                },
            }
        };

        match self.recall_with_embedding(&embedding, opts).await {
            Ok(results) => {
                if let Some(tracker) = &self.tracker {
                    let ids: Vec<String> = results.iter().map(|r| r.engram.id.clone()).collect();
                    tracker.track_many(ids);
                }
                results
            }
            Err(e) => {
                tracing::warn!("recall failed, returning empty: {}", e);
                vec![]
            }
        }
    }

    /// Nearest live engrams for an existing embedding. Used by the
    /// novelty classifier; does not record accesses.
    pub async fn nearest(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredEngram>> {
        let opts = SearchOptions {
            limit: k,
            min_similarity: 0.0,
            ..Default::default()
        };
        self.recall_with_embedding(embedding, &opts).await
    }

    /// Full retrieval pipeline over a pre-computed embedding.
    pub async fn recall_with_embedding(
        &self,
        embedding: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredEngram>> {
        let (query_int8, scale, offset) = quantize_int8(embedding)?;
        let filter = RowFilter::from_options(opts);

        let strategy = match opts.strategy {
            SearchStrategy::Auto => self.choose_strategy(opts, &filter).await?,
            explicit => explicit,
        };

        let candidates = match strategy {
            SearchStrategy::Exact | SearchStrategy::Auto => {
                self.execute_exact(&query_int8, opts, &filter)?
            }
            SearchStrategy::BinaryRescore => {
                self.execute_binary_rescore(&query_int8, opts, &filter)?
            }
            SearchStrategy::Hnsw => {
                self.execute_hnsw(&query_int8, scale, offset, opts, &filter)
                    .await?
            }
        };

        self.finalize(candidates, opts)
    }

    /// Strategy selection for Auto:
    /// category filter => exact; index ready at threshold => hnsw;
    /// enough binary rows => binary_rescore; else exact.
    async fn choose_strategy(
        &self,
        opts: &SearchOptions,
        filter: &RowFilter,
    ) -> Result<SearchStrategy> {
        if opts.category.is_some() {
            return Ok(SearchStrategy::Exact);
        }

        if self.index.available() {
            let stats = self.index.stats().await;
            if stats.available && stats.size >= stats.threshold {
                return Ok(SearchStrategy::Hnsw);
            }
        }

        if self.store.count_binary(filter)? >= self.config.binary_threshold {
            return Ok(SearchStrategy::BinaryRescore);
        }

        Ok(SearchStrategy::Exact)
    }

    fn execute_exact(
        &self,
        query_int8: &[i8],
        opts: &SearchOptions,
        filter: &RowFilter,
    ) -> Result<Vec<Candidate>> {
        let rows = self.store.scan_int8(filter)?;
        Ok(self.score_rows(query_int8, rows, opts.min_similarity))
    }

    fn execute_binary_rescore(
        &self,
        query_int8: &[i8],
        opts: &SearchOptions,
        filter: &RowFilter,
    ) -> Result<Vec<Candidate>> {
        let query_bits = to_binary(query_int8)?;

        // Stage 1: stream the corpus keeping a global Hamming top-k.
        let keep = opts.limit.max(1) * OVERFETCH;
        let mut topk: HammingTopK<String> = HammingTopK::new(keep);
        let mut after = 0i64;
        loop {
            let chunk =
                self.store
                    .scan_binary_chunk(filter, after, self.config.scan_chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            for (rowid, id, bits) in chunk {
                after = rowid;
                match hamming_distance(&query_bits, &bits) {
                    Ok(distance) => topk.push(distance, id),
                    Err(e) => tracing::warn!(%id, "skipping row in binary scan: {}", e),
                }
            }
        }

        // Stage 2: rescore the survivors with int8 cosine.
        let ids: Vec<String> = topk.into_sorted().into_iter().map(|(_, id)| id).collect();
        let rows = self.store.int8_by_ids(&ids)?;
        Ok(self.score_rows(query_int8, rows, opts.min_similarity))
    }

    async fn execute_hnsw(
        &self,
        query_int8: &[i8],
        scale: f32,
        offset: f32,
        opts: &SearchOptions,
        filter: &RowFilter,
    ) -> Result<Vec<Candidate>> {
        let wanted = opts.limit.max(1) * OVERFETCH;
        let hits = match self
            .index
            .search(query_int8.to_vec(), scale, offset, wanted)
            .await
        {
            Ok(hits) => hits,
            Err(IndexError::BelowThreshold { .. }) | Err(IndexError::Unavailable(_)) => vec![],
            Err(e) => {
                tracing::warn!("hnsw search failed, falling back: {}", e);
                vec![]
            }
        };

        if hits.is_empty() {
            // Zero hits fall through to binary_rescore, then exact.
            let binary = self.execute_binary_rescore(query_int8, opts, filter)?;
            if !binary.is_empty() {
                return Ok(binary);
            }
            return self.execute_exact(query_int8, opts, filter);
        }

        let ids: Vec<String> = hits.into_iter().map(|(id, _)| id).collect();
        let rows = self.store.int8_by_ids(&ids)?;
        let mut candidates = self.score_rows(query_int8, rows, opts.min_similarity);

        // The index knows nothing of row visibility; re-check filters.
        candidates = self.apply_row_filter(candidates, filter)?;
        Ok(candidates)
    }

    fn score_rows(
        &self,
        query_int8: &[i8],
        rows: Vec<Int8Row>,
        min_similarity: f32,
    ) -> Vec<Candidate> {
        rows.into_iter()
            .filter_map(|row| match cosine_int8(query_int8, &row.bytes) {
                Ok(similarity) if similarity >= min_similarity => Some(Candidate {
                    id: row.id,
                    similarity,
                    created_at: row.created_at,
                }),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(id = %row.id, "skipping row in cosine scan: {}", e);
                    None
                }
            })
            .collect()
    }

    fn apply_row_filter(
        &self,
        candidates: Vec<Candidate>,
        filter: &RowFilter,
    ) -> Result<Vec<Candidate>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let rows = self.store.get_many(&ids)?;
        let visible: std::collections::HashSet<String> = rows
            .into_iter()
            .filter(|e| {
                (filter.include_archived || !e.archived)
                    && (filter.include_superseded || !e.is_superseded())
                    && filter.category.is_none_or(|c| e.category == c)
                    && filter
                        .project_id
                        .as_ref()
                        .is_none_or(|p| e.project_id.as_deref() == Some(p.as_str()))
            })
            .map(|e| e.id)
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|c| visible.contains(&c.id))
            .collect())
    }

    /// Fuse scores, rank, truncate and hydrate.
    fn finalize(
        &self,
        candidates: Vec<Candidate>,
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredEngram>> {
        let now = Utc::now();
        let boost = opts.recency_boost.clamp(0.0, 1.0);

        let mut ranked: Vec<(Candidate, f32)> = candidates
            .into_iter()
            .map(|c| {
                let score = fuse_score(c.similarity, c.created_at, now, boost);
                (c, score)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.0.similarity
                        .partial_cmp(&a.0.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        ranked.truncate(opts.limit);

        let ids: Vec<String> = ranked.iter().map(|(c, _)| c.id.clone()).collect();
        let rows = self.store.get_many(&ids)?;
        let by_id: std::collections::HashMap<String, Engram> =
            rows.into_iter().map(|e| (e.id.clone(), e)).collect();

        Ok(ranked
            .into_iter()
            .filter_map(|(c, score)| {
                by_id.get(&c.id).map(|engram| ScoredEngram {
                    engram: engram.clone(),
                    similarity: c.similarity,
                    score,
                })
            })
            .collect())
    }

    /// The strategy Auto would pick right now (admin/testing surface).
    pub async fn planned_strategy(&self, opts: &SearchOptions) -> Result<SearchStrategy> {
        let filter = RowFilter::from_options(opts);
        self.choose_strategy(opts, &filter).await
    }
}

/// `(1 - boost) * similarity + boost * 0.5^(age_days / 7)`
fn fuse_score(
    similarity: f32,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    recency_boost: f32,
) -> f32 {
    if recency_boost <= 0.0 {
        return similarity;
    }
    let age_days = (now - created_at).num_seconds().max(0) as f32 / 86_400.0;
    let recency = 0.5f32.powf(age_days / RECENCY_HALF_LIFE_DAYS);
    (1.0 - recency_boost) * similarity + recency_boost * recency
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexService;
    use crate::memory::{Category, EngramDraft};
    use crate::telemetry::Telemetry;
    use crate::test_support::{test_config, test_embedding, StubModel};

    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<EngramStore>,
        retriever: Retriever,
        model: Arc<StubModel>,
        config: MemoryConfig,
    }

    async fn fixture(hnsw_threshold: usize, binary_threshold: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.hnsw_threshold = hnsw_threshold;
        config.binary_threshold = binary_threshold;

        let store = Arc::new(EngramStore::open(&config, Telemetry::default()).unwrap());
        let index = IndexService::spawn(&config, store.clone());
        let model = Arc::new(StubModel::new(config.dimensions));
        let gate = Arc::new(LlmGate::new(model.clone(), config.llm_timeout));
        let retriever = Retriever::new(store.clone(), index, gate, None, config.clone());
        Fixture {
            _dir: dir,
            store,
            retriever,
            model,
            config,
        }
    }

    fn insert_rows(fixture: &Fixture, count: usize) {
        for i in 0..count {
            fixture
                .store
                .insert(
                    &EngramDraft::new(format!("memory row number {}", i)),
                    &test_embedding(i as u64),
                    None,
                )
                .unwrap();
        }
    }

    #[test]
    fn test_fuse_score_zero_boost_is_similarity() {
        let now = Utc::now();
        assert_eq!(fuse_score(0.8, now, now, 0.0), 0.8);
    }

    #[test]
    fn test_fuse_score_recency_monotone() {
        // Equal similarity: the strictly more recent item never ranks
        // lower as the boost grows.
        let now = Utc::now();
        let fresh = now - chrono::Duration::hours(1);
        let stale = now - chrono::Duration::days(30);
        for boost in [0.1f32, 0.5, 0.9] {
            let fresh_score = fuse_score(0.7, fresh, now, boost);
            let stale_score = fuse_score(0.7, stale, now, boost);
            assert!(fresh_score > stale_score, "boost {}", boost);
        }
    }

    #[test]
    fn test_fuse_score_half_life() {
        let now = Utc::now();
        let week_old = now - chrono::Duration::days(7);
        // Pure recency: one half-life halves the score.
        let score = fuse_score(0.0, week_old, now, 1.0);
        assert!((score - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty() {
        let fixture = fixture(1000, 500).await;
        let results = fixture.retriever.recall("   ", &SearchOptions::default()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_embedding_failure_returns_empty() {
        let fixture = fixture(1000, 500).await;
        insert_rows(&fixture, 3);
        fixture.model.fail_embeddings(true);
        let results = fixture
            .retriever
            .recall("anything at all", &SearchOptions::default())
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_exact_recall_finds_row() {
        let fixture = fixture(1000, 500).await;
        let embedding = test_embedding(42);
        fixture.model.set_embedding("verified routes", embedding.clone());
        fixture
            .store
            .insert(
                &EngramDraft::new("Phoenix 1.7 uses verified routes").importance(0.6),
                &embedding,
                None,
            )
            .unwrap();
        insert_rows(&fixture, 5);

        let results = fixture
            .retriever
            .recall("verified routes", &SearchOptions { limit: 3, ..Default::default() })
            .await;
        assert!(!results.is_empty());
        assert_eq!(results[0].engram.content, "Phoenix 1.7 uses verified routes");
        assert!(results[0].similarity >= 0.7);
    }

    #[tokio::test]
    async fn test_strategy_selection_by_corpus_size() {
        // Thresholds scaled down: hnsw at 15, binary at 8.
        let fixture = fixture(15, 8).await;

        // Small corpus: exact.
        insert_rows(&fixture, 4);
        let opts = SearchOptions::default();
        assert_eq!(
            fixture.retriever.planned_strategy(&opts).await.unwrap(),
            SearchStrategy::Exact
        );

        // Mid corpus: binary_rescore.
        insert_rows(&fixture, 6);
        assert_eq!(
            fixture.retriever.planned_strategy(&opts).await.unwrap(),
            SearchStrategy::BinaryRescore
        );

        // Category filter always forces exact.
        let filtered = SearchOptions {
            category: Some(Category::Fact),
            ..Default::default()
        };
        assert_eq!(
            fixture.retriever.planned_strategy(&filtered).await.unwrap(),
            SearchStrategy::Exact
        );
    }

    #[cfg(feature = "vector-search")]
    #[tokio::test]
    async fn test_strategy_prefers_ready_hnsw() {
        let fixture = fixture(5, 3).await;
        insert_rows(&fixture, 8);

        // Index the rows so HNSW crosses its threshold.
        let items: Vec<(String, Vec<i8>, f32, f32)> = (0..8usize)
            .map(|i| {
                let (bytes, scale, offset) = quantize_int8(&test_embedding(i as u64)).unwrap();
                (format!("ignored-{}", i), bytes, scale, offset)
            })
            .collect();
        fixture.retriever.index.add_batch(items).await;
        // Wait for the service to drain its inbox.
        let _ = fixture.retriever.index.stats().await;

        let opts = SearchOptions::default();
        assert_eq!(
            fixture.retriever.planned_strategy(&opts).await.unwrap(),
            SearchStrategy::Hnsw
        );
    }

    #[tokio::test]
    async fn test_binary_rescore_matches_exact_top_hit() {
        let fixture = fixture(1000, 2).await;
        insert_rows(&fixture, 30);
        let target = test_embedding(7);

        let exact = fixture
            .retriever
            .recall_with_embedding(
                &target,
                &SearchOptions {
                    strategy: SearchStrategy::Exact,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let rescore = fixture
            .retriever
            .recall_with_embedding(
                &target,
                &SearchOptions {
                    strategy: SearchStrategy::BinaryRescore,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(exact[0].engram.id, rescore[0].engram.id);
        assert!((exact[0].similarity - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_min_similarity_filters() {
        let fixture = fixture(1000, 500).await;
        insert_rows(&fixture, 5);
        let results = fixture
            .retriever
            .recall_with_embedding(
                &test_embedding(999),
                &SearchOptions {
                    min_similarity: 0.999,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_superseded_rows_hidden_by_default() {
        let fixture = fixture(1000, 500).await;
        let embedding = test_embedding(3);
        let old = fixture
            .store
            .insert(&EngramDraft::new("old version"), &embedding, None)
            .unwrap();
        fixture
            .store
            .insert_superseding(
                &EngramDraft::new("new version"),
                &embedding,
                None,
                &old.id,
                crate::memory::SupersessionType::Update,
            )
            .unwrap();

        let results = fixture
            .retriever
            .recall_with_embedding(&embedding, &SearchOptions::default())
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.engram.id != old.id));

        let with_hidden = fixture
            .retriever
            .recall_with_embedding(
                &embedding,
                &SearchOptions {
                    include_superseded: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(with_hidden.iter().any(|r| r.engram.id == old.id));
    }

    #[tokio::test]
    async fn test_recency_boost_reranks_equal_similarity() {
        let fixture = fixture(1000, 500).await;
        let embedding = test_embedding(11);
        let old = fixture
            .store
            .insert(&EngramDraft::new("older twin"), &embedding, None)
            .unwrap();
        // Back-date the first row by three weeks.
        fixture
            .store
            .write(|conn| {
                conn.execute(
                    "UPDATE engrams SET created_at = ?1 WHERE id = ?2",
                    rusqlite::params![Utc::now() - chrono::Duration::days(21), old.id],
                )
            })
            .unwrap();
        let fresh = fixture
            .store
            .insert(&EngramDraft::new("fresher twin"), &embedding, None)
            .unwrap();

        let boosted = fixture
            .retriever
            .recall_with_embedding(
                &embedding,
                &SearchOptions {
                    recency_boost: 0.5,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(boosted[0].engram.id, fresh.id);
    }
}
