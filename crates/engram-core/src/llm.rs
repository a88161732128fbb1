//! Language Model Collaborator
//!
//! The LLM client itself is external: this module defines the consumed
//! trait surface (`complete`, `embed`, `auto_tag`) and the gate the core
//! calls through. The gate enforces the per-call timeout (a timed-out
//! call is missing, never a success) and carries two small in-process
//! caches: prompt/response and classifier embeddings, both TTL'd and
//! size-bounded, evicting the oldest ~20% on overflow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// LLM collaborator error types
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum LlmError {
    /// Collaborator unreachable or refused the call
    Unavailable(String),
    /// The per-call timeout elapsed
    Timeout,
    /// The collaborator returned an empty result
    Empty,
    /// The response could not be parsed as requested
    InvalidResponse(String),
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::Unavailable(e) => write!(f, "LLM unavailable: {}", e),
            LlmError::Timeout => write!(f, "LLM call timed out"),
            LlmError::Empty => write!(f, "LLM returned an empty result"),
            LlmError::InvalidResponse(e) => write!(f, "Invalid LLM response: {}", e),
        }
    }
}

impl std::error::Error for LlmError {}

/// LLM result type
pub type LlmResult<T> = std::result::Result<T, LlmError>;

// ============================================================================
// COLLABORATOR TRAIT
// ============================================================================

/// Options for a completion call.
#[derive(Debug, Clone)]
pub struct CompleteOptions {
    /// Token cap for the completion
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Request strict JSON output
    pub json: bool,
    /// Skip any system preamble the implementation would add
    pub raw: bool,
}

impl Default for CompleteOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.3,
            json: false,
            raw: false,
        }
    }
}

impl CompleteOptions {
    /// JSON-mode options with the given token cap.
    pub fn json_mode(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            json: true,
            ..Default::default()
        }
    }
}

/// The consumed text-completion + embedding surface.
///
/// Implementations are expected to block on network I/O; the gate runs
/// them on the blocking pool and applies the timeout.
pub trait LanguageModel: Send + Sync {
    /// Generate a text completion.
    fn complete(&self, prompt: &str, opts: &CompleteOptions) -> LlmResult<String>;

    /// Generate an embedding vector.
    fn embed(&self, text: &str) -> LlmResult<Vec<f32>>;

    /// Suggest tags for content. May be stubbed to empty.
    fn auto_tag(&self, _text: &str) -> LlmResult<Vec<String>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// TTL CACHE
// ============================================================================

/// Insertion-ordered TTL cache. On overflow the oldest ~20% of entries
/// are dropped in one pass, which keeps eviction off the hot path.
struct TtlCache<V> {
    entries: HashMap<String, (Instant, V)>,
    capacity: usize,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
        }
    }

    fn get(&mut self, key: &str) -> Option<V> {
        match self.entries.get(key) {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: String, value: V) {
        if self.entries.len() >= self.capacity {
            let mut by_age: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|(k, (at, _))| (k.clone(), *at))
                .collect();
            by_age.sort_by_key(|&(_, at)| at);
            let evict = (self.capacity / 5).max(1);
            for (key, _) in by_age.into_iter().take(evict) {
                self.entries.remove(&key);
            }
        }
        self.entries.insert(key, (Instant::now(), value));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// GATE
// ============================================================================

/// Cache capacity for both gate caches
const CACHE_CAPACITY: usize = 1000;

/// Cache entry lifetime
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// The call surface every component goes through.
pub struct LlmGate {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    prompt_cache: Mutex<TtlCache<String>>,
    embed_cache: Mutex<TtlCache<Vec<f32>>>,
}

impl LlmGate {
    /// Wrap a collaborator with the given per-call timeout.
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            prompt_cache: Mutex::new(TtlCache::new(CACHE_CAPACITY, CACHE_TTL)),
            embed_cache: Mutex::new(TtlCache::new(CACHE_CAPACITY, CACHE_TTL)),
        }
    }

    /// Complete a prompt, consulting the response cache first.
    pub async fn complete(&self, prompt: &str, opts: CompleteOptions) -> LlmResult<String> {
        if let Ok(mut cache) = self.prompt_cache.lock() {
            if let Some(hit) = cache.get(prompt) {
                return Ok(hit);
            }
        }

        let model = self.model.clone();
        let owned_prompt = prompt.to_string();
        let result = self
            .call_blocking(move || model.complete(&owned_prompt, &opts))
            .await?;

        if result.trim().is_empty() {
            return Err(LlmError::Empty);
        }

        if let Ok(mut cache) = self.prompt_cache.lock() {
            cache.insert(prompt.to_string(), result.clone());
        }
        Ok(result)
    }

    /// Embed text, consulting the embedding cache first.
    pub async fn embed(&self, text: &str) -> LlmResult<Vec<f32>> {
        if let Ok(mut cache) = self.embed_cache.lock() {
            if let Some(hit) = cache.get(text) {
                return Ok(hit);
            }
        }

        let model = self.model.clone();
        let owned_text = text.to_string();
        let vector = self
            .call_blocking(move || model.embed(&owned_text))
            .await?;

        if vector.is_empty() {
            return Err(LlmError::Empty);
        }

        if let Ok(mut cache) = self.embed_cache.lock() {
            cache.insert(text.to_string(), vector.clone());
        }
        Ok(vector)
    }

    /// Suggest tags for content.
    pub async fn auto_tag(&self, text: &str) -> LlmResult<Vec<String>> {
        let model = self.model.clone();
        let owned_text = text.to_string();
        self.call_blocking(move || model.auto_tag(&owned_text)).await
    }

    async fn call_blocking<T, F>(&self, f: F) -> LlmResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> LlmResult<T> + Send + 'static,
    {
        let call = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(LlmError::Unavailable(join.to_string())),
            Err(_) => {
                tracing::warn!("LLM call exceeded {:?}, treating as missing", self.timeout);
                Err(LlmError::Timeout)
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingModel {
        completes: AtomicUsize,
        embeds: AtomicUsize,
    }

    impl CountingModel {
        fn new() -> Self {
            Self {
                completes: AtomicUsize::new(0),
                embeds: AtomicUsize::new(0),
            }
        }
    }

    impl LanguageModel for CountingModel {
        fn complete(&self, prompt: &str, _opts: &CompleteOptions) -> LlmResult<String> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            Ok(format!("reply to: {}", prompt))
        }

        fn embed(&self, text: &str) -> LlmResult<Vec<f32>> {
            self.embeds.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32; 8])
        }
    }

    struct SlowModel;

    impl LanguageModel for SlowModel {
        fn complete(&self, _prompt: &str, _opts: &CompleteOptions) -> LlmResult<String> {
            std::thread::sleep(Duration::from_millis(200));
            Ok("too late".to_string())
        }

        fn embed(&self, _text: &str) -> LlmResult<Vec<f32>> {
            Ok(vec![0.1])
        }
    }

    #[tokio::test]
    async fn test_complete_is_cached() {
        let model = Arc::new(CountingModel::new());
        let gate = LlmGate::new(model.clone(), Duration::from_secs(5));

        let a = gate.complete("hello", CompleteOptions::default()).await.unwrap();
        let b = gate.complete("hello", CompleteOptions::default()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(model.completes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embed_is_cached() {
        let model = Arc::new(CountingModel::new());
        let gate = LlmGate::new(model.clone(), Duration::from_secs(5));

        gate.embed("some text").await.unwrap();
        gate.embed("some text").await.unwrap();
        assert_eq!(model.embeds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_missing_not_success() {
        let gate = LlmGate::new(Arc::new(SlowModel), Duration::from_millis(20));
        let result = gate.complete("anything", CompleteOptions::default()).await;
        assert!(matches!(result, Err(LlmError::Timeout)));
    }

    #[test]
    fn test_ttl_cache_eviction() {
        let mut cache: TtlCache<u32> = TtlCache::new(10, Duration::from_secs(60));
        for i in 0..10 {
            cache.insert(format!("key-{}", i), i);
        }
        assert_eq!(cache.len(), 10);

        // Next insert evicts the oldest 20% (2 entries) before adding.
        cache.insert("key-10".to_string(), 10);
        assert_eq!(cache.len(), 9);
        assert!(cache.get("key-0").is_none());
        assert!(cache.get("key-1").is_none());
        assert_eq!(cache.get("key-9"), Some(9));
    }

    #[test]
    fn test_ttl_cache_expiry() {
        let mut cache: TtlCache<u32> = TtlCache::new(10, Duration::from_millis(0));
        cache.insert("key".to_string(), 1);
        assert_eq!(cache.get("key"), None);
    }
}
