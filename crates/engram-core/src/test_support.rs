//! Shared test fixtures: deterministic embeddings, a scripted
//! LanguageModel stub, and pre-wired component sets.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::cognition::{ActivityMonitor, CognitionCycle, CognitionDeps};
use crate::config::MemoryConfig;
use crate::graph::Graph;
use crate::lifecycle::DbMaintenance;
use crate::llm::{CompleteOptions, LanguageModel, LlmError, LlmGate, LlmResult};
use crate::pattern::{PatternPromoter, PatternStore};
use crate::storage::EngramStore;
use crate::telemetry::Telemetry;

/// Embedding width used throughout the tests
pub const TEST_DIMENSIONS: usize = 64;

/// Config rooted in a temp dir, with timings collapsed for tests.
pub fn test_config(root: &Path) -> MemoryConfig {
    let mut config = MemoryConfig::with_root(root);
    config.dimensions = TEST_DIMENSIONS;
    config.reject_test_patterns = false;
    config.llm_call_gap = Duration::ZERO;
    config.idle_threshold = Duration::ZERO;
    config.cycle_spacing = Duration::ZERO;
    config.access_flush_interval = Duration::from_millis(50);
    config
}

/// Deterministic unit-norm pseudo-random embedding.
pub fn test_embedding(seed: u64) -> Vec<f32> {
    seeded_vector(seed.wrapping_add(0x9e3779b97f4a7c15))
}

fn seeded_vector(seed: u64) -> Vec<f32> {
    let mut state = seed;
    let mut v: Vec<f32> = (0..TEST_DIMENSIONS)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / (u32::MAX >> 1) as f32) - 1.0
        })
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// A vector whose cosine against `base` is (approximately) `target_cos`.
pub fn similar_embedding(base: &[f32], target_cos: f32) -> Vec<f32> {
    // Gram-Schmidt an orthogonal direction out of a fresh random vector.
    let noise = seeded_vector(0xdecade);
    let dot: f32 = base.iter().zip(&noise).map(|(a, b)| a * b).sum();
    let mut ortho: Vec<f32> = noise
        .iter()
        .zip(base)
        .map(|(n, b)| n - dot * b)
        .collect();
    let norm = ortho.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in &mut ortho {
        *x /= norm.max(1e-9);
    }

    let sin = (1.0 - target_cos * target_cos).max(0.0).sqrt();
    base.iter()
        .zip(&ortho)
        .map(|(b, o)| target_cos * b + sin * o)
        .collect()
}

// ============================================================================
// STUB LANGUAGE MODEL
// ============================================================================

/// Scripted collaborator: completions pop from a queue, embeddings are
/// deterministic per text with explicit overrides.
pub struct StubModel {
    dimensions: usize,
    responses: Mutex<VecDeque<String>>,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
    fail_embed: AtomicBool,
    fail_complete: AtomicBool,
    complete_calls: AtomicUsize,
}

impl StubModel {
    /// Fresh stub.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            responses: Mutex::new(VecDeque::new()),
            embeddings: Mutex::new(HashMap::new()),
            fail_embed: AtomicBool::new(false),
            fail_complete: AtomicBool::new(false),
            complete_calls: AtomicUsize::new(0),
        }
    }

    /// Queue the next completion response.
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    /// Pin the embedding for an exact text.
    pub fn set_embedding(&self, text: impl Into<String>, embedding: Vec<f32>) {
        self.embeddings.lock().unwrap().insert(text.into(), embedding);
    }

    /// Make embed() fail from now on.
    pub fn fail_embeddings(&self, fail: bool) {
        self.fail_embed.store(fail, Ordering::SeqCst);
    }

    /// Make complete() fail from now on.
    pub fn fail_completions(&self, fail: bool) {
        self.fail_complete.store(fail, Ordering::SeqCst);
    }

    /// Completion calls issued so far.
    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }
}

impl LanguageModel for StubModel {
    fn complete(&self, _prompt: &str, _opts: &CompleteOptions) -> LlmResult<String> {
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(LlmError::Unavailable("stubbed failure".to_string()));
        }
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "OK".to_string()))
    }

    fn embed(&self, text: &str) -> LlmResult<Vec<f32>> {
        if self.fail_embed.load(Ordering::SeqCst) {
            return Err(LlmError::Unavailable("stubbed failure".to_string()));
        }
        if let Some(pinned) = self.embeddings.lock().unwrap().get(text) {
            return Ok(pinned.clone());
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::hash::Hash::hash(&text, &mut hasher);
        let mut v = seeded_vector(std::hash::Hasher::finish(&hasher));
        v.truncate(self.dimensions);
        Ok(v)
    }
}

// ============================================================================
// COGNITION FIXTURE
// ============================================================================

/// A full cognition-cycle rig over a temp store.
pub struct CognitionFixture {
    pub _dir: TempDir,
    pub store: Arc<EngramStore>,
    pub graph: Arc<Graph>,
    pub patterns: Arc<PatternStore>,
    pub promoter: Arc<PatternPromoter>,
    pub gate: Arc<LlmGate>,
    pub model: Arc<StubModel>,
    pub maintenance: Arc<DbMaintenance>,
    pub activity: Arc<ActivityMonitor>,
    pub cycle: Arc<CognitionCycle>,
}

/// Build a cycle rig with the given per-cycle call budget.
pub async fn cognition_fixture(max_calls: u32) -> CognitionFixture {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.llm_calls_per_cycle = max_calls;

    let store = Arc::new(EngramStore::open(&config, Telemetry::default()).unwrap());
    let graph = Arc::new(Graph::new(store.clone()));
    let patterns = Arc::new(PatternStore::new(store.clone()));
    let model = Arc::new(StubModel::new(config.dimensions));
    let gate = Arc::new(LlmGate::new(model.clone(), config.llm_timeout));
    let promoter = Arc::new(PatternPromoter::new(
        patterns.clone(),
        store.clone(),
        gate.clone(),
        None,
        None,
    ));
    let maintenance = Arc::new(DbMaintenance::new(store.clone(), &config));
    let activity = Arc::new(ActivityMonitor::new());

    let cycle = CognitionCycle::new(
        CognitionDeps {
            store: store.clone(),
            graph: graph.clone(),
            patterns: patterns.clone(),
            promoter: promoter.clone(),
            gate: gate.clone(),
            triples: None,
            maintenance: maintenance.clone(),
            telemetry: Telemetry::default(),
            config,
        },
        activity.clone(),
    );

    CognitionFixture {
        _dir: dir,
        store,
        graph,
        patterns,
        promoter,
        gate,
        model,
        maintenance,
        activity,
        cycle,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        dot / (na * nb)
    }

    #[test]
    fn test_embeddings_are_deterministic() {
        assert_eq!(test_embedding(5), test_embedding(5));
        assert_ne!(test_embedding(5), test_embedding(6));
    }

    #[test]
    fn test_similar_embedding_hits_target() {
        let base = test_embedding(1);
        for target in [0.97f32, 0.90, 0.50] {
            let vector = similar_embedding(&base, target);
            assert!(
                (cosine(&base, &vector) - target).abs() < 0.01,
                "target {}",
                target
            );
        }
    }

    #[test]
    fn test_stub_model_scripting() {
        let model = StubModel::new(8);
        model.push_response("first");
        model.push_response("second");
        let opts = CompleteOptions::default();
        assert_eq!(model.complete("a", &opts).unwrap(), "first");
        assert_eq!(model.complete("b", &opts).unwrap(), "second");
        assert_eq!(model.complete("c", &opts).unwrap(), "OK");
        assert_eq!(model.complete_calls(), 3);

        let same = model.embed("text").unwrap();
        assert_eq!(model.embed("text").unwrap(), same);
    }
}
