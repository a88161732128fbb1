//! Memory Service
//!
//! The composition root: opens the store, spawns the long-lived tasks
//! (index service, access tracker, Hebbian linker, background cycle,
//! hourly forgetting sweeper), and exposes the public remember/recall
//! surface. Insertion runs the temporal-chain pipeline: embed and
//! classify outside any lock, then mutate rows through the serializer.

use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::access::{AccessTracker, TrackerHandle};
use crate::cognition::{
    ActivityMonitor, CognitionCycle, CognitionDeps, CycleReport, CycleStats,
};
use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::Graph;
use crate::hebbian::{HebbianLinker, LinkerHandle, HEBBIAN_SOURCE, STALE_EDGE_DAYS};
use crate::index::{IndexHandle, IndexService, IndexStats};
use crate::lifecycle::{DbMaintenance, Forgetter, SweepReport};
use crate::llm::{LanguageModel, LlmGate};
use crate::memory::{
    Context, Engram, EngramDraft, Interaction, ScoredEngram, SearchOptions, SupersessionType,
};
use crate::pattern::{PatternPromoter, PatternStore, ProcedurePromoter, TripleSink};
use crate::retrieval::Retriever;
use crate::storage::EngramStore;
use crate::telemetry::Telemetry;
use crate::temporal::{supersession_kind, ChainDecision, ChainManager, Novelty};
use crate::vector::quantize_int8;

/// Neighbors consulted by the novelty classifier
const CLASSIFY_NEIGHBORS: usize = 5;

// ============================================================================
// OUTCOMES
// ============================================================================

/// What remember() did with the content.
#[derive(Debug, Clone)]
pub enum RememberOutcome {
    /// A new engram was stored
    Inserted(Engram),
    /// The content was redundant; the existing engram was reinforced
    Reinforced {
        /// The pre-existing engram
        engram: Engram,
        /// Its similarity to the new content
        similarity: f32,
    },
    /// A new engram was stored, superseding an older one
    Superseded {
        /// The new engram
        engram: Engram,
        /// The replaced engram
        superseded_id: String,
        /// How it was replaced
        kind: SupersessionType,
    },
}

impl RememberOutcome {
    /// The engram this outcome refers to.
    pub fn engram(&self) -> &Engram {
        match self {
            RememberOutcome::Inserted(engram) => engram,
            RememberOutcome::Reinforced { engram, .. } => engram,
            RememberOutcome::Superseded { engram, .. } => engram,
        }
    }
}

/// Optional external collaborators beyond the LLM.
#[derive(Default)]
pub struct Collaborators {
    /// Semantic-triple repository (write sink)
    pub triples: Option<Arc<dyn TripleSink>>,
    /// External procedure promoter
    pub procedures: Option<Arc<dyn ProcedurePromoter>>,
}

// ============================================================================
// SERVICE
// ============================================================================

/// The assembled memory system.
pub struct MemoryService {
    config: MemoryConfig,
    telemetry: Telemetry,
    store: Arc<EngramStore>,
    graph: Arc<Graph>,
    patterns: Arc<PatternStore>,
    gate: Arc<LlmGate>,
    index: IndexHandle,
    tracker: TrackerHandle,
    linker: LinkerHandle,
    retriever: Arc<Retriever>,
    chains: Arc<ChainManager>,
    forgetter: Arc<Forgetter>,
    maintenance: Arc<DbMaintenance>,
    cognition: Arc<CognitionCycle>,
    activity: Arc<ActivityMonitor>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MemoryService {
    /// Open the system with default telemetry and no extra
    /// collaborators.
    ///
    /// Must be called from within a tokio runtime: the index service,
    /// access tracker, Hebbian linker and background cycle all spawn
    /// long-lived tasks.
    pub fn open(config: MemoryConfig, model: Arc<dyn LanguageModel>) -> Result<Self> {
        Self::open_with(config, model, Telemetry::default(), Collaborators::default())
    }

    /// Open the system with explicit telemetry and collaborators.
    pub fn open_with(
        config: MemoryConfig,
        model: Arc<dyn LanguageModel>,
        telemetry: Telemetry,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.ensure_dirs().map_err(crate::storage::StorageError::Io)?;

        let store = Arc::new(EngramStore::open(&config, telemetry.clone())?);
        let graph = Arc::new(Graph::new(store.clone()));
        let patterns = Arc::new(PatternStore::new(store.clone()));
        let gate = Arc::new(LlmGate::new(model, config.llm_timeout));

        let index = IndexService::spawn(&config, store.clone());
        let linker = HebbianLinker::spawn(store.clone(), graph.clone(), &config);
        let tracker = AccessTracker::spawn(store.clone(), &config, Some(linker.clone()));

        let retriever = Arc::new(Retriever::new(
            store.clone(),
            index.clone(),
            gate.clone(),
            Some(tracker.clone()),
            config.clone(),
        ));
        let chains = Arc::new(ChainManager::new(
            store.clone(),
            gate.clone(),
            config.clone(),
        ));
        let forgetter = Arc::new(Forgetter::new(
            store.clone(),
            config.clone(),
            telemetry.clone(),
        ));
        let maintenance = Arc::new(DbMaintenance::new(store.clone(), &config));
        let promoter = Arc::new(PatternPromoter::new(
            patterns.clone(),
            store.clone(),
            gate.clone(),
            collaborators.triples.clone(),
            collaborators.procedures,
        ));

        let activity = Arc::new(ActivityMonitor::new());
        let cognition = CognitionCycle::new(
            CognitionDeps {
                store: store.clone(),
                graph: graph.clone(),
                patterns: patterns.clone(),
                promoter,
                gate: gate.clone(),
                triples: collaborators.triples,
                maintenance: maintenance.clone(),
                telemetry: telemetry.clone(),
                config: config.clone(),
            },
            activity.clone(),
        );

        let mut background = vec![cognition.spawn_scheduler()];
        background.push(Self::spawn_sweeper(
            forgetter.clone(),
            graph.clone(),
        ));

        Ok(Self {
            config,
            telemetry,
            store,
            graph,
            patterns,
            gate,
            index,
            tracker,
            linker,
            retriever,
            chains,
            forgetter,
            maintenance,
            cognition,
            activity,
            background: Mutex::new(background),
        })
    }

    fn spawn_sweeper(forgetter: Arc<Forgetter>, graph: Arc<Graph>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = forgetter.run_all() {
                    tracing::warn!("forgetting sweep failed: {}", e);
                }
                match graph.delete_stale_edges(HEBBIAN_SOURCE, STALE_EDGE_DAYS) {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "stale hebbian edges removed"),
                    Err(e) => tracing::warn!("stale edge sweep failed: {}", e),
                }
            }
        })
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Store content, running novelty classification against the
    /// nearest existing memories first.
    pub async fn remember(
        &self,
        draft: EngramDraft,
        ctx: Option<Context>,
    ) -> Result<RememberOutcome> {
        self.activity.record();
        self.store.validate_content(&draft.content)?;

        // Everything expensive happens before any serialized write:
        // embedding, nearest-neighbor search, and the decision surface.
        let embedding = self.gate.embed(&draft.content).await?;

        let mut draft = draft;
        if draft.tags.is_empty() {
            match self.gate.auto_tag(&draft.content).await {
                Ok(tags) => draft.tags = tags,
                Err(e) => tracing::debug!("auto-tag unavailable: {}", e),
            }
        }

        let neighbors = self
            .retriever
            .nearest(&embedding, CLASSIFY_NEIGHBORS)
            .await?;

        match self.chains.classify(&neighbors) {
            Novelty::Redundant { id, similarity } => self.reinforce(&id, similarity),
            Novelty::New => self.insert_new(&draft, &embedding, ctx.as_ref()).await,
            Novelty::Ambiguous { id, similarity } => {
                let Some(old) = self.store.get(&id)? else {
                    return self.insert_new(&draft, &embedding, ctx.as_ref()).await;
                };
                let decision = self.chains.decide(&draft.content, &old).await;
                match decision {
                    ChainDecision::Redundant => self.reinforce(&id, similarity),
                    ChainDecision::New => self.insert_new(&draft, &embedding, ctx.as_ref()).await,
                    ChainDecision::Update | ChainDecision::Correction => {
                        let kind = supersession_kind(decision).expect("superseding decision");
                        self.insert_superseding(&draft, &embedding, ctx.as_ref(), &old, kind)
                            .await
                    }
                    ChainDecision::Refinement => {
                        // Merge through the LLM; on failure the new
                        // content stands, still linked as a refinement.
                        let mut merged_draft = draft.clone();
                        let mut merged_embedding = embedding.clone();
                        if let Some(merged) = self
                            .chains
                            .merge_contents(&draft.content, &old.content)
                            .await
                        {
                            if let Ok(vector) = self.gate.embed(&merged).await {
                                merged_embedding = vector;
                            }
                            merged_draft.content = merged;
                        }
                        self.insert_superseding(
                            &merged_draft,
                            &merged_embedding,
                            ctx.as_ref(),
                            &old,
                            SupersessionType::Refinement,
                        )
                        .await
                    }
                }
            }
        }
    }

    fn reinforce(&self, id: &str, similarity: f32) -> Result<RememberOutcome> {
        self.tracker.track(id.to_string());
        let engram = self
            .store
            .get(id)?
            .ok_or_else(|| crate::storage::StorageError::NotFound(id.to_string()))?;
        Ok(RememberOutcome::Reinforced { engram, similarity })
    }

    async fn insert_new(
        &self,
        draft: &EngramDraft,
        embedding: &[f32],
        ctx: Option<&Context>,
    ) -> Result<RememberOutcome> {
        let engram = self.store.insert(draft, embedding, ctx)?;
        self.after_insert(&engram, embedding).await;
        Ok(RememberOutcome::Inserted(engram))
    }

    async fn insert_superseding(
        &self,
        draft: &EngramDraft,
        embedding: &[f32],
        ctx: Option<&Context>,
        old: &Engram,
        kind: SupersessionType,
    ) -> Result<RememberOutcome> {
        let engram = self
            .store
            .insert_superseding(draft, embedding, ctx, &old.id, kind)?;
        self.after_insert(&engram, embedding).await;

        // A superseded row no longer belongs in the index.
        if let Err(e) = self.index.remove(&old.id).await {
            tracing::debug!("index removal of superseded row skipped: {}", e);
        }

        Ok(RememberOutcome::Superseded {
            engram,
            superseded_id: old.id.clone(),
            kind,
        })
    }

    /// Post-insert fan-out: the async index add and the async graph
    /// linker task.
    async fn after_insert(&self, engram: &Engram, embedding: &[f32]) {
        if let Ok((bytes, scale, offset)) = quantize_int8(embedding) {
            self.index.add(engram.id.clone(), bytes, scale, offset).await;
        }

        let graph = self.graph.clone();
        let engram_id = engram.id.clone();
        tokio::spawn(async move {
            if let Err(e) = graph.find_or_create_node(
                crate::graph::node_types::MEMORY,
                &crate::graph::memory_node_name(&engram_id),
                None,
            ) {
                tracing::warn!(%engram_id, "memory node creation failed: {}", e);
            }
        });
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Recall memories for a query. Degrades to empty on internal
    /// failures - the read path never errors at the caller.
    pub async fn recall(&self, query: &str, opts: &SearchOptions) -> Vec<ScoredEngram> {
        self.activity.record();
        self.retriever.recall(query, opts).await
    }

    /// Fetch one engram.
    pub fn get(&self, id: &str) -> Result<Option<Engram>> {
        Ok(self.store.get(id)?)
    }

    /// Full-text search over content (BM25, normalized scores).
    pub fn search_text(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        Ok(self.store.search_text(query, None, limit)?)
    }

    // ========================================================================
    // CHAINS
    // ========================================================================

    /// The supersession chain containing `id`, oldest first.
    pub fn get_chain(&self, id: &str) -> Result<Vec<Engram>> {
        Ok(self.chains.get_chain(id)?)
    }

    /// The newest engram in `id`'s chain.
    pub fn get_current(&self, id: &str) -> Result<Option<Engram>> {
        Ok(self.chains.get_current(id)?)
    }

    /// The oldest engram in `id`'s chain.
    pub fn get_original(&self, id: &str) -> Result<Option<Engram>> {
        Ok(self.chains.get_original(id)?)
    }

    /// Chain length for `id`.
    pub fn chain_length(&self, id: &str) -> Result<usize> {
        Ok(self.chains.chain_length(id)?)
    }

    // ========================================================================
    // FEEDBACK
    // ========================================================================

    /// A tool execution succeeded with these retrieved memories;
    /// strengthens their associations.
    pub fn record_outcome(&self, ids: Vec<String>) {
        self.tracker.record_outcome(ids);
    }

    /// Record one tool interaction into working memory.
    pub fn record_interaction(
        &self,
        thread_id: &str,
        tool_name: &str,
        arguments: &str,
        result_summary: &str,
        duration_ms: i64,
    ) -> Result<Interaction> {
        self.activity.record();
        Ok(self.store.record_interaction(
            thread_id,
            tool_name,
            arguments,
            result_summary,
            duration_ms,
        )?)
    }

    // ========================================================================
    // ADMIN
    // ========================================================================

    /// Run every forgetting sweep now.
    pub fn run_sweeps(&self) -> Result<SweepReport> {
        let report = self.forgetter.run_all()?;
        self.graph
            .delete_stale_edges(HEBBIAN_SOURCE, STALE_EDGE_DAYS)?;
        Ok(report)
    }

    /// Hard-delete one row (refused for protected rows).
    pub async fn purge(&self, id: &str) -> Result<()> {
        self.store.purge(id)?;
        if let Err(e) = self.index.remove(id).await {
            tracing::debug!("index removal on purge skipped: {}", e);
        }
        Ok(())
    }

    /// Archive one row (refused for protected rows).
    pub fn archive(&self, id: &str) -> Result<()> {
        Ok(self.store.archive(id)?)
    }

    /// Rebuild the vector index from the row store.
    pub async fn rebuild_index(&self) -> Result<usize> {
        Ok(self.index.rebuild().await?)
    }

    /// Index state.
    pub async fn index_stats(&self) -> IndexStats {
        self.index.stats().await
    }

    /// Run a background cycle now (admin surface).
    pub async fn run_cycle_now(&self, force: bool) -> Result<CycleReport> {
        self.cognition.run_now(force).await
    }

    /// Background-cycle stats.
    pub fn cycle_stats(&self) -> CycleStats {
        self.cognition.stats()
    }

    /// Whether the session counts as active.
    pub fn session_active(&self) -> bool {
        self.cognition.session_active()
    }

    /// Note user activity (for callers outside remember/recall).
    pub fn record_activity(&self) {
        self.activity.record();
    }

    /// Emit a caller-side telemetry event through the service's
    /// publisher.
    pub fn emit_event(&self, event: &str, measurements: serde_json::Value) {
        self.telemetry.emit(event, measurements, json!({}));
    }

    // ========================================================================
    // COMPONENT ACCESS
    // ========================================================================

    /// The underlying row store.
    pub fn store(&self) -> &Arc<EngramStore> {
        &self.store
    }

    /// The associative graph.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// The pattern store.
    pub fn patterns(&self) -> &Arc<PatternStore> {
        &self.patterns
    }

    /// The access tracker handle.
    pub fn tracker(&self) -> &TrackerHandle {
        &self.tracker
    }

    /// The Hebbian linker handle.
    pub fn linker(&self) -> &LinkerHandle {
        &self.linker
    }

    /// The LLM gate.
    pub fn gate(&self) -> &Arc<LlmGate> {
        &self.gate
    }

    /// The active configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Maintenance scheduling state.
    pub fn maintenance(&self) -> &Arc<DbMaintenance> {
        &self.maintenance
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Flush the tracker, save the index, and stop every task.
    pub async fn shutdown(&self) {
        self.tracker.shutdown().await;
        self.linker.shutdown().await;
        self.index.shutdown().await;
        if let Ok(mut background) = self.background.lock() {
            for task in background.drain(..) {
                task.abort();
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Category;
    use crate::test_support::{similar_embedding, test_config, test_embedding, StubModel};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        service: MemoryService,
        model: Arc<StubModel>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let model = Arc::new(StubModel::new(config.dimensions));
        let service = MemoryService::open(config, model.clone()).unwrap();
        Fixture {
            _dir: dir,
            service,
            model,
        }
    }

    #[tokio::test]
    async fn test_insert_and_retrieve() {
        let fixture = fixture();
        let embedding = test_embedding(1);
        fixture
            .model
            .set_embedding("Phoenix 1.7 uses verified routes", embedding.clone());
        fixture.model.set_embedding("verified routes", embedding);

        let outcome = fixture
            .service
            .remember(
                EngramDraft::new("Phoenix 1.7 uses verified routes")
                    .category(Category::Fact)
                    .importance(0.6),
                None,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RememberOutcome::Inserted(_)));

        let results = fixture
            .service
            .recall(
                "verified routes",
                &SearchOptions {
                    limit: 3,
                    ..Default::default()
                },
            )
            .await;
        assert!(!results.is_empty());
        assert_eq!(
            results[0].engram.content,
            "Phoenix 1.7 uses verified routes"
        );
        assert!(results[0].similarity >= 0.7);
    }

    #[tokio::test]
    async fn test_supersession_via_update() {
        let fixture = fixture();
        let base = test_embedding(2);
        fixture
            .model
            .set_embedding("React 18 is the latest version", base.clone());
        // Ambiguous band: similarity 0.90.
        fixture.model.set_embedding(
            "React 19 is now the latest version",
            similar_embedding(&base, 0.90),
        );
        fixture
            .model
            .set_embedding("React latest", similar_embedding(&base, 0.92));

        let old = fixture
            .service
            .remember(EngramDraft::new("React 18 is the latest version"), None)
            .await
            .unwrap();
        let old_id = old.engram().id.clone();

        fixture.model.push_response("UPDATE");
        let new = fixture
            .service
            .remember(EngramDraft::new("React 19 is now the latest version"), None)
            .await
            .unwrap();
        let RememberOutcome::Superseded {
            engram,
            superseded_id,
            kind,
        } = &new
        else {
            panic!("expected supersession, got {:?}", new);
        };
        assert_eq!(superseded_id, &old_id);
        assert_eq!(*kind, SupersessionType::Update);

        // Default search returns only the new row.
        let results = fixture
            .service
            .recall("React latest", &SearchOptions::default())
            .await;
        assert!(results.iter().any(|r| r.engram.id == engram.id));
        assert!(results.iter().all(|r| r.engram.id != old_id));

        // Chain has both, oldest first, with the supersession recorded.
        let chain = fixture.service.get_chain(&engram.id).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, old_id);
        assert!(chain[0].superseded_at.is_some());
        assert_eq!(chain[0].supersession_type, Some(SupersessionType::Update));
    }

    #[tokio::test]
    async fn test_redundant_reinforces_neighbor() {
        let fixture = fixture();
        let base = test_embedding(3);
        fixture
            .model
            .set_embedding("SQLite supports FTS5", base.clone());
        // Above the redundant floor.
        fixture
            .model
            .set_embedding("SQLite has FTS5 support", similar_embedding(&base, 0.97));

        let first = fixture
            .service
            .remember(EngramDraft::new("SQLite supports FTS5"), None)
            .await
            .unwrap();
        let first_id = first.engram().id.clone();

        let second = fixture
            .service
            .remember(EngramDraft::new("SQLite has FTS5 support"), None)
            .await
            .unwrap();
        let RememberOutcome::Reinforced { engram, similarity } = &second else {
            panic!("expected reinforcement, got {:?}", second);
        };
        assert_eq!(engram.id, first_id);
        assert!(*similarity >= 0.95);

        // No second row was stored.
        let recent = fixture
            .service
            .store()
            .get_recent(&crate::memory::RecentFilter::latest(10))
            .unwrap();
        assert_eq!(recent.len(), 1);

        // The reinforcement lands within one flush.
        fixture.service.tracker().flush().await;
        let reinforced = fixture.service.get(&first_id).unwrap().unwrap();
        assert_eq!(reinforced.access_count, 1);
        let expected = 0.01 * 0.95;
        assert!((reinforced.decay_rate - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_refinement_merges_content() {
        let fixture = fixture();
        let base = test_embedding(4);
        fixture.model.set_embedding("Alice prefers tabs", base.clone());
        fixture
            .model
            .set_embedding("Alice prefers tabs over spaces", similar_embedding(&base, 0.90));

        fixture
            .service
            .remember(EngramDraft::new("Alice prefers tabs"), None)
            .await
            .unwrap();

        fixture.model.push_response("REFINEMENT");
        fixture
            .model
            .push_response("Alice prefers tabs over spaces in all editors");
        let outcome = fixture
            .service
            .remember(EngramDraft::new("Alice prefers tabs over spaces"), None)
            .await
            .unwrap();

        let RememberOutcome::Superseded { engram, kind, .. } = &outcome else {
            panic!("expected refinement supersession");
        };
        assert_eq!(*kind, SupersessionType::Refinement);
        assert_eq!(engram.content, "Alice prefers tabs over spaces in all editors");
    }

    #[tokio::test]
    async fn test_embedding_failure_refuses_insert() {
        let fixture = fixture();
        fixture.model.fail_embeddings(true);
        let result = fixture
            .service
            .remember(EngramDraft::new("cannot embed this"), None)
            .await;
        assert!(matches!(result, Err(MemoryError::EmbeddingUnavailable(_))));
    }

    #[tokio::test]
    async fn test_invalid_content_surfaces() {
        let fixture = fixture();
        let result = fixture
            .service
            .remember(EngramDraft::new("   "), None)
            .await;
        assert!(matches!(result, Err(MemoryError::ContentInvalid(_))));
    }

    #[tokio::test]
    async fn test_auto_protection_survives_ttl() {
        let fixture = fixture();
        let outcome = fixture
            .service
            .remember(
                EngramDraft::new("frequently needed fact").importance(0.5),
                None,
            )
            .await
            .unwrap();
        let id = outcome.engram().id.clone();

        for _ in 0..10 {
            fixture.service.tracker().track(id.clone());
        }
        fixture.service.tracker().flush().await;
        assert!(fixture.service.get(&id).unwrap().unwrap().protected);

        // Back-date far past every TTL; the sweep must leave it alone.
        fixture
            .service
            .store()
            .write(|conn| {
                conn.execute(
                    "UPDATE engrams SET created_at = ?1 WHERE id = ?2",
                    rusqlite::params![chrono::Utc::now() - chrono::Duration::days(60), id],
                )
            })
            .unwrap();
        fixture.service.run_sweeps().unwrap();
        let row = fixture.service.get(&id).unwrap().unwrap();
        assert!(!row.archived);
    }

    #[tokio::test]
    async fn test_context_injected_into_metadata() {
        let fixture = fixture();
        let ctx = Context {
            session_id: Some("sess-1".to_string()),
            agent_type: Some("researcher".to_string()),
            model_id: None,
        };
        let outcome = fixture
            .service
            .remember(EngramDraft::new("contextualized fact"), Some(ctx))
            .await
            .unwrap();
        assert_eq!(outcome.engram().metadata["session_id"], "sess-1");
        assert_eq!(outcome.engram().metadata["agent_type"], "researcher");
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let fixture = fixture();
        let outcome = fixture
            .service
            .remember(EngramDraft::new("flushed on shutdown"), None)
            .await
            .unwrap();
        let id = outcome.engram().id.clone();
        fixture.service.tracker().track(id.clone());
        fixture.service.shutdown().await;
        assert_eq!(fixture.service.get(&id).unwrap().unwrap().access_count, 1);
    }
}
