//! Temporal Chain Manager
//!
//! Novelty classification against the nearest existing memories, the
//! LLM decision and merge surfaces for the ambiguous band, and chain
//! traversal over supersession links. The similarity search and LLM
//! calls run outside the write serializer; only the row mutations go
//! through it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::config::MemoryConfig;
use crate::llm::{CompleteOptions, LlmGate};
use crate::memory::{Engram, ScoredEngram, SupersessionType};
use crate::storage::{EngramStore, Result};

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Outcome of the novelty check against the nearest neighbors.
#[derive(Debug, Clone, PartialEq)]
pub enum Novelty {
    /// Effectively a duplicate: reinforce the existing row, no insert
    Redundant {
        /// Nearest existing engram
        id: String,
        /// Its similarity
        similarity: f32,
    },
    /// Close enough that the decision surface must arbitrate
    Ambiguous {
        /// Nearest existing engram
        id: String,
        /// Its similarity
        similarity: f32,
    },
    /// Genuinely new content
    New,
}

/// The decision surface's verdict for ambiguous content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainDecision {
    /// Insert superseding the old row (update)
    Update,
    /// Insert superseding the old row (correction)
    Correction,
    /// Merge old and new, insert the merge superseding the old row
    Refinement,
    /// Reinforce the old row, no insert
    Redundant,
    /// Insert normally
    New,
}

// ============================================================================
// CHAIN MANAGER
// ============================================================================

/// Supersession-chain classification and traversal.
pub struct ChainManager {
    store: Arc<EngramStore>,
    gate: Arc<LlmGate>,
    config: MemoryConfig,
}

impl ChainManager {
    /// Wire up the manager.
    pub fn new(store: Arc<EngramStore>, gate: Arc<LlmGate>, config: MemoryConfig) -> Self {
        Self {
            store,
            gate,
            config,
        }
    }

    /// Classify new content by its nearest neighbors (already fetched
    /// by the caller, outside any lock).
    pub fn classify(&self, neighbors: &[ScoredEngram]) -> Novelty {
        let Some(top) = neighbors.first() else {
            return Novelty::New;
        };
        let similarity = top.similarity;
        if similarity >= self.config.redundant_floor {
            Novelty::Redundant {
                id: top.engram.id.clone(),
                similarity,
            }
        } else if similarity >= self.config.ambiguous_floor {
            Novelty::Ambiguous {
                id: top.engram.id.clone(),
                similarity,
            }
        } else {
            Novelty::New
        }
    }

    /// Ask the decision surface what to do with ambiguous content.
    /// Any LLM failure degrades to `New` - inserting is the safe wrong
    /// answer, losing content is not.
    pub async fn decide(&self, new_content: &str, old: &Engram) -> ChainDecision {
        let old_age_days = (Utc::now() - old.created_at).num_days();
        let prompt = format!(
            "A memory store holds this existing memory (stored {} days ago):\n\
             ---\n{}\n---\n\
             New content has arrived:\n\
             ---\n{}\n---\n\
             Reply with exactly one word describing the relationship:\n\
             UPDATE - the new content replaces the old with newer information\n\
             CORRECTION - the new content fixes an error in the old\n\
             REFINEMENT - the two should be merged into one better memory\n\
             REDUNDANT - the new content adds nothing\n\
             NEW - the two are about different things",
            old_age_days, old.content, new_content
        );

        match self
            .gate
            .complete(&prompt, CompleteOptions {
                max_tokens: 16,
                temperature: 0.0,
                ..Default::default()
            })
            .await
        {
            Ok(response) => parse_decision(&response),
            Err(e) => {
                tracing::warn!("chain decision failed ({}), treating as NEW", e);
                ChainDecision::New
            }
        }
    }

    /// Ask the merge surface for a single consolidated content. `None`
    /// on any failure - the caller falls back to the new content as-is.
    pub async fn merge_contents(&self, new_content: &str, old_content: &str) -> Option<String> {
        let prompt = format!(
            "Merge these two overlapping memories into one concise memory that \
             preserves every distinct fact. Reply with the merged text only.\n\
             Memory A:\n{}\n\
             Memory B:\n{}",
            old_content, new_content
        );
        match self
            .gate
            .complete(&prompt, CompleteOptions {
                max_tokens: 512,
                temperature: 0.2,
                ..Default::default()
            })
            .await
        {
            Ok(merged) if !merged.trim().is_empty() => Some(merged.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("merge surface failed: {}", e);
                None
            }
        }
    }

    // ========================================================================
    // TRAVERSAL
    // ========================================================================

    /// The full chain containing `id`, oldest first. Cycles are
    /// detected with a visited set, logged, and truncated - traversal
    /// never loops.
    pub fn get_chain(&self, id: &str) -> Result<Vec<Engram>> {
        let original = match self.get_original(id)? {
            Some(engram) => engram,
            None => return Ok(vec![]),
        };

        let mut chain = vec![original];
        let mut visited: HashSet<String> =
            chain.iter().map(|e| e.id.clone()).collect();

        loop {
            let last_id = chain.last().map(|e| e.id.clone()).unwrap_or_default();
            match self.store.successor_of(&last_id)? {
                Some(next) => {
                    if !visited.insert(next.id.clone()) {
                        tracing::warn!(id = %next.id, "supersession chain cycle, truncating");
                        break;
                    }
                    chain.push(next);
                }
                None => break,
            }
        }
        Ok(chain)
    }

    /// The newest engram in `id`'s chain.
    pub fn get_current(&self, id: &str) -> Result<Option<Engram>> {
        let Some(mut current) = self.store.get(id)? else {
            return Ok(None);
        };
        let mut visited: HashSet<String> = HashSet::from([current.id.clone()]);
        while let Some(next) = self.store.successor_of(&current.id)? {
            if !visited.insert(next.id.clone()) {
                tracing::warn!(id = %next.id, "supersession chain cycle, truncating");
                break;
            }
            current = next;
        }
        Ok(Some(current))
    }

    /// The oldest ancestor in `id`'s chain.
    pub fn get_original(&self, id: &str) -> Result<Option<Engram>> {
        let Some(mut current) = self.store.get(id)? else {
            return Ok(None);
        };
        let mut visited: HashSet<String> = HashSet::from([current.id.clone()]);
        while let Some(parent_id) = current.supersedes_id.clone() {
            if !visited.insert(parent_id.clone()) {
                tracing::warn!(id = %parent_id, "supersession chain cycle, truncating");
                break;
            }
            match self.store.get(&parent_id)? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(Some(current))
    }

    /// Number of engrams in `id`'s chain.
    pub fn chain_length(&self, id: &str) -> Result<usize> {
        Ok(self.get_chain(id)?.len())
    }
}

/// Map a decision-surface reply onto a decision. Unrecognized replies
/// degrade to `New`.
fn parse_decision(response: &str) -> ChainDecision {
    let upper = response.to_uppercase();
    for (token, decision) in [
        ("CORRECTION", ChainDecision::Correction),
        ("REFINEMENT", ChainDecision::Refinement),
        ("REDUNDANT", ChainDecision::Redundant),
        ("UPDATE", ChainDecision::Update),
        ("NEW", ChainDecision::New),
    ] {
        if upper.contains(token) {
            return decision;
        }
    }
    tracing::warn!("unparseable chain decision: {:?}", response);
    ChainDecision::New
}

/// Supersession kind for a decision that supersedes.
pub fn supersession_kind(decision: ChainDecision) -> Option<SupersessionType> {
    match decision {
        ChainDecision::Update => Some(SupersessionType::Update),
        ChainDecision::Correction => Some(SupersessionType::Correction),
        ChainDecision::Refinement => Some(SupersessionType::Refinement),
        ChainDecision::Redundant | ChainDecision::New => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Category, EngramDraft};
    use crate::telemetry::Telemetry;
    use crate::test_support::{test_config, test_embedding, StubModel};
    use rusqlite::params;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<EngramStore>,
        chains: ChainManager,
        model: Arc<StubModel>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(EngramStore::open(&config, Telemetry::default()).unwrap());
        let model = Arc::new(StubModel::new(config.dimensions));
        let gate = Arc::new(LlmGate::new(model.clone(), config.llm_timeout));
        let chains = ChainManager::new(store.clone(), gate, config);
        Fixture {
            _dir: dir,
            store,
            chains,
            model,
        }
    }

    fn scored(engram: Engram, similarity: f32) -> ScoredEngram {
        ScoredEngram {
            engram,
            similarity,
            score: similarity,
        }
    }

    #[test]
    fn test_classify_bands() {
        let fixture = fixture();
        let row = fixture
            .store
            .insert(&EngramDraft::new("existing"), &test_embedding(1), None)
            .unwrap();

        assert!(matches!(
            fixture.chains.classify(&[scored(row.clone(), 0.97)]),
            Novelty::Redundant { .. }
        ));
        assert!(matches!(
            fixture.chains.classify(&[scored(row.clone(), 0.90)]),
            Novelty::Ambiguous { .. }
        ));
        assert!(matches!(
            fixture.chains.classify(&[scored(row, 0.50)]),
            Novelty::New
        ));
        assert!(matches!(fixture.chains.classify(&[]), Novelty::New));
    }

    #[test]
    fn test_classify_band_edges() {
        let fixture = fixture();
        let row = fixture
            .store
            .insert(&EngramDraft::new("existing"), &test_embedding(1), None)
            .unwrap();

        // Floors are inclusive.
        assert!(matches!(
            fixture.chains.classify(&[scored(row.clone(), 0.95)]),
            Novelty::Redundant { .. }
        ));
        assert!(matches!(
            fixture.chains.classify(&[scored(row, 0.85)]),
            Novelty::Ambiguous { .. }
        ));
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!(parse_decision("UPDATE"), ChainDecision::Update);
        assert_eq!(parse_decision("  correction\n"), ChainDecision::Correction);
        assert_eq!(
            parse_decision("I think this is a REFINEMENT of the old one"),
            ChainDecision::Refinement
        );
        assert_eq!(parse_decision("gibberish"), ChainDecision::New);
    }

    #[tokio::test]
    async fn test_decide_uses_stubbed_surface() {
        let fixture = fixture();
        let old = fixture
            .store
            .insert(&EngramDraft::new("React 18 is the latest version"), &test_embedding(1), None)
            .unwrap();

        fixture.model.push_response("UPDATE");
        let decision = fixture
            .chains
            .decide("React 19 is now the latest version", &old)
            .await;
        assert_eq!(decision, ChainDecision::Update);
    }

    #[tokio::test]
    async fn test_decide_failure_degrades_to_new() {
        let fixture = fixture();
        let old = fixture
            .store
            .insert(&EngramDraft::new("some fact"), &test_embedding(1), None)
            .unwrap();
        fixture.model.fail_completions(true);
        let decision = fixture.chains.decide("another fact", &old).await;
        assert_eq!(decision, ChainDecision::New);
    }

    #[test]
    fn test_chain_traversal() {
        let fixture = fixture();
        let first = fixture
            .store
            .insert(&EngramDraft::new("v1").category(Category::Fact), &test_embedding(1), None)
            .unwrap();
        let second = fixture
            .store
            .insert_superseding(
                &EngramDraft::new("v2"),
                &test_embedding(2),
                None,
                &first.id,
                SupersessionType::Update,
            )
            .unwrap();
        let third = fixture
            .store
            .insert_superseding(
                &EngramDraft::new("v3"),
                &test_embedding(3),
                None,
                &second.id,
                SupersessionType::Refinement,
            )
            .unwrap();

        // Chain is identical from any member.
        for id in [&first.id, &second.id, &third.id] {
            let chain = fixture.chains.get_chain(id).unwrap();
            assert_eq!(chain.len(), 3);
            assert_eq!(chain[0].id, first.id);
            assert_eq!(chain[2].id, third.id);
        }

        assert_eq!(
            fixture.chains.get_current(&first.id).unwrap().unwrap().id,
            third.id
        );
        assert_eq!(
            fixture.chains.get_original(&third.id).unwrap().unwrap().id,
            first.id
        );
        assert_eq!(fixture.chains.chain_length(&second.id).unwrap(), 3);
    }

    #[test]
    fn test_chain_cycle_terminates() {
        let fixture = fixture();
        let a = fixture
            .store
            .insert(&EngramDraft::new("node a"), &test_embedding(1), None)
            .unwrap();
        let b = fixture
            .store
            .insert_superseding(
                &EngramDraft::new("node b"),
                &test_embedding(2),
                None,
                &a.id,
                SupersessionType::Update,
            )
            .unwrap();

        // Corrupt the chain into a cycle: a supersedes b supersedes a.
        fixture
            .store
            .write(|conn| {
                conn.execute(
                    "UPDATE engrams SET supersedes_id = ?1 WHERE id = ?2",
                    params![b.id, a.id],
                )
            })
            .unwrap();

        // Row count bounds every traversal.
        let chain = fixture.chains.get_chain(&a.id).unwrap();
        assert!(chain.len() <= 2);
        assert!(fixture.chains.get_current(&a.id).unwrap().is_some());
        assert!(fixture.chains.get_original(&a.id).unwrap().is_some());
    }

    #[test]
    fn test_self_reference_terminates() {
        let fixture = fixture();
        let a = fixture
            .store
            .insert(&EngramDraft::new("self loop"), &test_embedding(1), None)
            .unwrap();
        fixture
            .store
            .write(|conn| {
                conn.execute(
                    "UPDATE engrams SET supersedes_id = id WHERE id = ?1",
                    params![a.id],
                )
            })
            .unwrap();

        let chain = fixture.chains.get_chain(&a.id).unwrap();
        assert_eq!(chain.len(), 1);
    }
}
