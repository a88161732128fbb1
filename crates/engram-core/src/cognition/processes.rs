//! Cycle Processes
//!
//! The seven processes a cycle executes, in order. Every process starts
//! by checking the remaining budget and reports `budget_exhausted` once
//! it is gone; any internal error becomes a `Failed` result and the
//! cycle moves on.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};

use crate::graph::{edge_types, memory_node_name, node_types, EdgeSpec};
use crate::llm::CompleteOptions;
use crate::memory::{Category, EngramDraft, RecentFilter};
use crate::pattern::CandidateFilter;

use super::{BudgetError, CognitionCycle, LlmBudget, ProcessResult};

/// Memories fed to deep consolidation
const CONSOLIDATION_WINDOW: usize = 50;

/// Minimum memories before consolidation is worth a call
const CONSOLIDATION_MIN: usize = 5;

/// Patterns reviewed per emergence pass
const EMERGENCE_WINDOW: usize = 10;

/// Synthesis quality gate: minimum insight length
const SYNTHESIS_MIN_CHARS: usize = 100;

/// Synthesis quality gate: minimum importance
const SYNTHESIS_MIN_IMPORTANCE: f32 = 0.6;

/// Synthesis dedupe prefix length
const SYNTHESIS_PREFIX: usize = 80;

/// Pull the first JSON object or array out of a completion.
fn extract_json(response: &str) -> Option<Value> {
    let (start, close) = match (response.find('{'), response.find('[')) {
        (Some(obj), Some(arr)) if arr < obj => (arr, ']'),
        (Some(obj), _) => (obj, '}'),
        (None, Some(arr)) => (arr, ']'),
        (None, None) => return None,
    };
    let end = response.rfind(close)?;
    if end < start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

impl CognitionCycle {
    // ========================================================================
    // 1. DEEP CONSOLIDATION
    // ========================================================================

    pub(super) async fn deep_consolidation(&self, budget: &mut LlmBudget) -> ProcessResult {
        const NAME: &str = "deep_consolidation";
        if budget.exhausted() {
            return ProcessResult::skipped_budget(NAME);
        }

        let recent = match self
            .deps
            .store
            .get_recent(&RecentFilter::latest(CONSOLIDATION_WINDOW))
        {
            Ok(rows) => rows,
            Err(e) => return ProcessResult::failed(NAME, e),
        };
        if recent.len() < CONSOLIDATION_MIN {
            return ProcessResult::skipped(NAME, "fewer than 5 recent memories");
        }

        let listing: String = recent
            .iter()
            .map(|e| format!("- [{}] {}\n", e.id, truncate_chars(&e.content, 200)))
            .collect();
        let prompt = format!(
            "Study these recent memories and surface what is NOT obvious: \
             hidden connections, implicit patterns, and salient entities.\n{}\n\
             Reply as JSON: {{\"connections\": [{{\"from\": \"<id>\", \"to\": \"<id>\", \
             \"reason\": \"...\"}}], \"concepts\": [\"...\"], \
             \"triples\": [{{\"subject\": \"...\", \"predicate\": \"...\", \
             \"object\": \"...\"}}]}}",
            listing
        );

        let response = match budget
            .complete(&self.deps.gate, &prompt, CompleteOptions::json_mode(1024))
            .await
        {
            Ok(response) => response,
            Err(BudgetError::Exhausted) => return ProcessResult::skipped_budget(NAME),
            Err(BudgetError::Llm(e)) => return ProcessResult::failed(NAME, e),
        };

        let Some(parsed) = extract_json(&response) else {
            return ProcessResult::failed(NAME, "unparseable consolidation response");
        };

        let known: std::collections::HashSet<&str> =
            recent.iter().map(|e| e.id.as_str()).collect();

        let mut edges = 0usize;
        for connection in parsed["connections"].as_array().into_iter().flatten() {
            let (Some(from), Some(to)) =
                (connection["from"].as_str(), connection["to"].as_str())
            else {
                continue;
            };
            if from == to || !known.contains(from) || !known.contains(to) {
                continue;
            }
            let result = (|| {
                let a = self.deps.graph.find_or_create_node(
                    node_types::MEMORY,
                    &memory_node_name(from),
                    None,
                )?;
                let b = self.deps.graph.find_or_create_node(
                    node_types::MEMORY,
                    &memory_node_name(to),
                    None,
                )?;
                let mut props = Map::new();
                props.insert("source".to_string(), json!("deep_consolidation"));
                if let Some(reason) = connection["reason"].as_str() {
                    props.insert("reason".to_string(), json!(reason));
                }
                self.deps.graph.ensure_edge(&EdgeSpec {
                    source_node_id: a.id,
                    target_node_id: b.id,
                    edge_type: edge_types::DEEP_CONNECTION.to_string(),
                    weight: 0.6,
                    properties: props,
                })
            })();
            match result {
                Ok(_) => edges += 1,
                Err(e) => tracing::warn!("deep connection failed: {}", e),
            }
        }

        let mut concepts = 0usize;
        for concept in parsed["concepts"].as_array().into_iter().flatten() {
            if let Some(name) = concept.as_str() {
                match self
                    .deps
                    .graph
                    .find_or_create_node(node_types::CONCEPT, name, None)
                {
                    Ok(_) => concepts += 1,
                    Err(e) => tracing::warn!("concept node failed: {}", e),
                }
            }
        }

        let mut triples = 0usize;
        if let Some(sink) = &self.deps.triples {
            for triple in parsed["triples"].as_array().into_iter().flatten() {
                if let (Some(s), Some(p), Some(o)) = (
                    triple["subject"].as_str(),
                    triple["predicate"].as_str(),
                    triple["object"].as_str(),
                ) {
                    let mut props = Map::new();
                    props.insert("source".to_string(), json!("deep_consolidation"));
                    match sink.insert_triple(s, p, o, &props) {
                        Ok(()) => triples += 1,
                        Err(e) => tracing::warn!("triple sink failed: {}", e),
                    }
                }
            }
        }

        ProcessResult::completed(
            NAME,
            json!({ "edges": edges, "concepts": concepts, "triples": triples }),
        )
    }

    // ========================================================================
    // 2. EMERGENCE ENHANCEMENT
    // ========================================================================

    pub(super) async fn emergence_enhancement(&self, budget: &mut LlmBudget) -> ProcessResult {
        const NAME: &str = "emergence_enhancement";
        if budget.exhausted() {
            return ProcessResult::skipped_budget(NAME);
        }

        let patterns = match self.deps.patterns.list_active(EMERGENCE_WINDOW) {
            Ok(patterns) => patterns,
            Err(e) => return ProcessResult::failed(NAME, e),
        };
        if patterns.is_empty() {
            return ProcessResult::skipped(NAME, "no active patterns");
        }

        let listing: String = patterns
            .iter()
            .map(|p| {
                format!(
                    "- {} ({}): seen {}x, success {:.0}%, strength {:.2}\n",
                    p.description,
                    p.pattern_type.as_str(),
                    p.occurrences,
                    p.success_rate * 100.0,
                    p.strength
                )
            })
            .collect();
        let prompt = format!(
            "These behavioral patterns are under observation:\n{}\n\
             Which deserve promotion, which should be deprecated, and what new \
             pattern categories are emerging? Reply briefly.",
            listing
        );

        match budget
            .complete(&self.deps.gate, &prompt, CompleteOptions::default())
            .await
        {
            Ok(suggestions) => {
                // Advisory only: log, never act destructively.
                tracing::info!(%suggestions, "emergence review");
                ProcessResult::completed(NAME, json!({ "reviewed": patterns.len() }))
            }
            Err(BudgetError::Exhausted) => ProcessResult::skipped_budget(NAME),
            Err(BudgetError::Llm(e)) => ProcessResult::failed(NAME, e),
        }
    }

    // ========================================================================
    // 3. CONTEXT PRE-COMPUTATION
    // ========================================================================

    pub(super) async fn context_precompute(&self, budget: &mut LlmBudget) -> ProcessResult {
        const NAME: &str = "context_precompute";
        if budget.exhausted() {
            return ProcessResult::skipped_budget(NAME);
        }

        let filter = RecentFilter {
            limit: 20,
            min_importance: Some(0.6),
            ..Default::default()
        };
        let important = match self.deps.store.get_recent(&filter) {
            Ok(rows) => rows,
            Err(e) => return ProcessResult::failed(NAME, e),
        };
        if important.is_empty() {
            return ProcessResult::skipped(NAME, "no high-importance recent memories");
        }

        let listing: String = important
            .iter()
            .map(|e| format!("- {}\n", truncate_chars(&e.content, 200)))
            .collect();
        let prompt = format!(
            "Summarize what the next session should know up front, based on \
             these important recent memories:\n{}\nReply with the summary only.",
            listing
        );

        let summary = match budget
            .complete(&self.deps.gate, &prompt, CompleteOptions::default())
            .await
        {
            Ok(summary) => summary,
            Err(BudgetError::Exhausted) => return ProcessResult::skipped_budget(NAME),
            Err(BudgetError::Llm(e)) => return ProcessResult::failed(NAME, e),
        };

        let embedding = match self.deps.gate.embed(&summary).await {
            Ok(embedding) => embedding,
            Err(e) => return ProcessResult::failed(NAME, e),
        };
        let draft = EngramDraft::new(summary)
            .category(Category::Plan)
            .importance(0.9)
            .tag("precomputed_context");
        match self.deps.store.insert(&draft, &embedding, None) {
            Ok(engram) => ProcessResult::completed(NAME, json!({ "engram_id": engram.id })),
            Err(e) => ProcessResult::failed(NAME, e),
        }
    }

    // ========================================================================
    // 4. DECAY INTELLIGENCE (dormant)
    // ========================================================================

    pub(super) async fn decay_intelligence(&self, budget: &mut LlmBudget) -> ProcessResult {
        const NAME: &str = "decay_intelligence";
        if budget.exhausted() {
            return ProcessResult::skipped_budget(NAME);
        }
        // Intentionally dormant. LLM-guided keep/archive/forget must not
        // be wired without: a soft-delete recovery window, an audit log,
        // a graph-edge-reference check before archival, and a 0.1
        // importance floor.
        ProcessResult::skipped(NAME, "disabled")
    }

    // ========================================================================
    // 5. KNOWLEDGE SYNTHESIS (daily max)
    // ========================================================================

    pub(super) async fn knowledge_synthesis(&self, budget: &mut LlmBudget) -> ProcessResult {
        const NAME: &str = "knowledge_synthesis";
        if budget.exhausted() {
            return ProcessResult::skipped_budget(NAME);
        }

        if let Some(last) = self.deps.maintenance.last_synthesis() {
            if Utc::now() - last < ChronoDuration::days(1) {
                return ProcessResult::skipped(NAME, "daily max reached");
            }
        }

        let memories = match self.deps.store.get_recent(&RecentFilter::latest(30)) {
            Ok(rows) => rows,
            Err(e) => return ProcessResult::failed(NAME, e),
        };
        if memories.len() < CONSOLIDATION_MIN {
            return ProcessResult::skipped(NAME, "not enough material");
        }

        let listing: String = memories
            .iter()
            .map(|e| {
                format!(
                    "- ({}) {}\n",
                    e.category.as_str(),
                    truncate_chars(&e.content, 200)
                )
            })
            .collect();
        let prompt = format!(
            "Synthesize durable cross-cutting insights from these memories of \
             different categories:\n{}\n\
             Reply as JSON: {{\"syntheses\": [{{\"insight\": \"...\", \
             \"importance\": 0.0}}]}}. Only include insights that span more \
             than one memory.",
            listing
        );

        let response = match budget
            .complete(&self.deps.gate, &prompt, CompleteOptions::json_mode(1024))
            .await
        {
            Ok(response) => response,
            Err(BudgetError::Exhausted) => return ProcessResult::skipped_budget(NAME),
            Err(BudgetError::Llm(e)) => return ProcessResult::failed(NAME, e),
        };

        let Some(parsed) = extract_json(&response) else {
            return ProcessResult::failed(NAME, "unparseable synthesis response");
        };

        // Dedupe against already-persisted syntheses by content prefix.
        let existing = self
            .deps
            .store
            .find_by_tag("synthesis", 200)
            .unwrap_or_default();
        let mut seen_prefixes: std::collections::HashSet<String> = existing
            .iter()
            .map(|e| truncate_chars(&e.content, SYNTHESIS_PREFIX))
            .collect();

        let mut persisted = 0usize;
        let mut rejected = 0usize;
        for synthesis in parsed["syntheses"].as_array().into_iter().flatten() {
            let Some(insight) = synthesis["insight"].as_str() else {
                continue;
            };
            let importance = synthesis["importance"].as_f64().unwrap_or(0.0) as f32;

            // Quality gate.
            if insight.len() < SYNTHESIS_MIN_CHARS || importance < SYNTHESIS_MIN_IMPORTANCE {
                rejected += 1;
                continue;
            }
            let prefix = truncate_chars(insight, SYNTHESIS_PREFIX);
            if !seen_prefixes.insert(prefix) {
                rejected += 1;
                continue;
            }

            let embedding = match self.deps.gate.embed(insight).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!("synthesis embedding failed: {}", e);
                    rejected += 1;
                    continue;
                }
            };
            let draft = EngramDraft::new(insight)
                .category(Category::Fact)
                .importance(importance)
                .tag("synthesis");
            match self.deps.store.insert(&draft, &embedding, None) {
                Ok(_) => persisted += 1,
                Err(e) => {
                    tracing::warn!("synthesis insert failed: {}", e);
                    rejected += 1;
                }
            }
        }

        self.deps.maintenance.record_synthesis();
        ProcessResult::completed(NAME, json!({ "persisted": persisted, "rejected": rejected }))
    }

    // ========================================================================
    // 6. KNOWLEDGE PROMOTION
    // ========================================================================

    pub(super) async fn knowledge_promotion(&self, budget: &mut LlmBudget) -> ProcessResult {
        const NAME: &str = "knowledge_promotion";
        if budget.exhausted() {
            return ProcessResult::skipped_budget(NAME);
        }

        let candidates = match self
            .deps
            .patterns
            .promotion_candidates(&CandidateFilter::default())
        {
            Ok(candidates) => candidates,
            Err(e) => return ProcessResult::failed(NAME, e),
        };
        if candidates.is_empty() {
            return ProcessResult::skipped(NAME, "no promotion candidates");
        }

        let mut outcomes = Vec::new();
        for pattern in &candidates {
            match self.deps.promoter.promote(pattern).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::warn!(pattern = %pattern.id, "promotion failed: {}", e),
            }
        }

        let promoted = outcomes.iter().filter(|o| o.promoted).count();
        ProcessResult::completed(
            NAME,
            json!({
                "candidates": candidates.len(),
                "promoted": promoted,
                "outcomes": serde_json::to_value(&outcomes).unwrap_or(Value::Null),
            }),
        )
    }

    // ========================================================================
    // 7. UPGRADE ANALYSIS
    // ========================================================================

    pub(super) async fn upgrade_analysis(&self, budget: &mut LlmBudget) -> ProcessResult {
        const NAME: &str = "upgrade_analysis";
        if budget.exhausted() {
            return ProcessResult::skipped_budget(NAME);
        }

        let live = self.deps.store.count_live().unwrap_or(0);
        let patterns = self.deps.patterns.list_active(100).map(|p| p.len()).unwrap_or(0);
        let prompt = format!(
            "A memory system currently holds {} live memories and {} active \
             behavioral patterns. Produce up to 3 ranked recommendations for \
             improving its own retention and retrieval quality. Reply as JSON: \
             {{\"recommendations\": [{{\"rank\": 1, \"recommendation\": \"...\"}}]}}",
            live, patterns
        );

        let response = match budget
            .complete(&self.deps.gate, &prompt, CompleteOptions::json_mode(512))
            .await
        {
            Ok(response) => response,
            Err(BudgetError::Exhausted) => return ProcessResult::skipped_budget(NAME),
            Err(BudgetError::Llm(e)) => return ProcessResult::failed(NAME, e),
        };

        let count = extract_json(&response)
            .and_then(|v| v["recommendations"].as_array().map(|a| a.len()))
            .unwrap_or(0);
        if count == 0 {
            return ProcessResult::completed(NAME, json!({ "recommendations": 0 }));
        }

        // Persist for later retrieval.
        let embedding = match self.deps.gate.embed(&response).await {
            Ok(embedding) => embedding,
            Err(e) => return ProcessResult::failed(NAME, e),
        };
        let draft = EngramDraft::new(response)
            .category(Category::Observation)
            .importance(0.6)
            .tag("upgrade_analysis");
        match self.deps.store.insert(&draft, &embedding, None) {
            Ok(engram) => ProcessResult::completed(
                NAME,
                json!({ "recommendations": count, "engram_id": engram.id }),
            ),
            Err(e) => ProcessResult::failed(NAME, e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
