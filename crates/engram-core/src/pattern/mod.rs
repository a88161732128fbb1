//! Patterns and Promotion
//!
//! Pattern rows describe emergent behavior observed by detectors that
//! live outside this crate. This module owns candidate selection and
//! promotion: mature patterns graduate into durable knowledge - triples,
//! procedures, or high-importance fact memories.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MemoryError, Result as CoreResult};
use crate::llm::LlmGate;
use crate::memory::{Category, EngramDraft};
use crate::storage::{EngramStore, Result, StorageError};

/// Default promotion floor: occurrences
pub const PROMOTION_MIN_OCCURRENCES: i64 = 5;

/// Default promotion floor: success rate
pub const PROMOTION_MIN_SUCCESS_RATE: f32 = 0.7;

/// Default promotion floor: strength
pub const PROMOTION_MIN_STRENGTH: f32 = 0.6;

// ============================================================================
// MODELS
// ============================================================================

/// Pattern kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// A recurring deduction
    Inference,
    /// A repeatable multi-step procedure
    Workflow,
    /// A capability worth remembering
    Skill,
    /// A rule of thumb
    Heuristic,
}

impl PatternType {
    /// String form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Inference => "inference",
            PatternType::Workflow => "workflow",
            PatternType::Skill => "skill",
            PatternType::Heuristic => "heuristic",
        }
    }

    /// Parse from a string name.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "inference" => Some(PatternType::Inference),
            "workflow" => Some(PatternType::Workflow),
            "skill" => Some(PatternType::Skill),
            "heuristic" => Some(PatternType::Heuristic),
            _ => None,
        }
    }
}

/// Pattern lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternStatus {
    /// Still accumulating evidence
    Active,
    /// Graduated into durable knowledge
    Promoted,
    /// No longer worth tracking
    Deprecated,
}

impl PatternStatus {
    /// String form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Active => "active",
            PatternStatus::Promoted => "promoted",
            PatternStatus::Deprecated => "deprecated",
        }
    }

    /// Parse from a string name, defaulting to `Active`.
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "promoted" => PatternStatus::Promoted,
            "deprecated" => PatternStatus::Deprecated,
            _ => PatternStatus::Active,
        }
    }
}

/// An emergent-behavior descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    /// Unique identifier
    pub id: String,
    /// Kind of pattern
    pub pattern_type: PatternType,
    /// Human-readable description
    pub description: String,
    /// Engram/interaction ids this pattern was derived from
    pub components: Vec<String>,
    /// Conditions under which it applies
    pub trigger_conditions: Vec<String>,
    /// Times observed
    pub occurrences: i64,
    /// Fraction of successful outcomes
    pub success_rate: f32,
    /// Confidence in the pattern
    pub strength: f32,
    /// Lifecycle status
    pub status: PatternStatus,
    /// Creation time
    pub created_at: chrono::DateTime<Utc>,
    /// Last update
    pub updated_at: chrono::DateTime<Utc>,
}

/// Filters for promotion candidates.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    /// Minimum observations
    pub min_occurrences: i64,
    /// Minimum success rate
    pub min_success_rate: f32,
    /// Minimum strength
    pub min_strength: f32,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            min_occurrences: PROMOTION_MIN_OCCURRENCES,
            min_success_rate: PROMOTION_MIN_SUCCESS_RATE,
            min_strength: PROMOTION_MIN_STRENGTH,
        }
    }
}

// ============================================================================
// EXTERNAL SINKS
// ============================================================================

/// The semantic-triple repository, consumed as a write sink only.
pub trait TripleSink: Send + Sync {
    /// Persist one (subject, predicate, object) triple.
    fn insert_triple(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        properties: &Map<String, Value>,
    ) -> std::result::Result<(), String>;
}

/// The external procedure promoter workflows graduate into.
pub trait ProcedurePromoter: Send + Sync {
    /// Persist a workflow pattern as a procedure.
    fn promote_workflow(&self, pattern: &Pattern) -> std::result::Result<(), String>;
}

// ============================================================================
// PATTERN STORE
// ============================================================================

/// Pattern rows over the shared store.
pub struct PatternStore {
    store: Arc<EngramStore>,
}

impl PatternStore {
    /// Wire up over the store.
    pub fn new(store: Arc<EngramStore>) -> Self {
        Self { store }
    }

    /// Insert a detector-produced pattern.
    pub fn insert(
        &self,
        pattern_type: PatternType,
        description: &str,
        components: &[String],
        trigger_conditions: &[String],
    ) -> Result<Pattern> {
        let now = Utc::now();
        let pattern = Pattern {
            id: Uuid::new_v4().to_string(),
            pattern_type,
            description: description.to_string(),
            components: components.to_vec(),
            trigger_conditions: trigger_conditions.to_vec(),
            occurrences: 1,
            success_rate: 0.0,
            strength: 0.1,
            status: PatternStatus::Active,
            created_at: now,
            updated_at: now,
        };

        let components_json = serde_json::to_string(&pattern.components).unwrap_or_default();
        let triggers_json =
            serde_json::to_string(&pattern.trigger_conditions).unwrap_or_default();
        self.store.write(|conn| {
            conn.execute(
                "INSERT INTO patterns
                    (id, pattern_type, description, components, trigger_conditions,
                     occurrences, success_rate, strength, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    pattern.id,
                    pattern.pattern_type.as_str(),
                    pattern.description,
                    components_json,
                    triggers_json,
                    pattern.occurrences,
                    pattern.success_rate as f64,
                    pattern.strength as f64,
                    pattern.status.as_str(),
                    now,
                    now
                ],
            )
        })?;
        Ok(pattern)
    }

    /// Fetch one pattern.
    pub fn get(&self, id: &str) -> Result<Option<Pattern>> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT id, pattern_type, description, components, trigger_conditions,
                        occurrences, success_rate, strength, status, created_at, updated_at
                 FROM patterns WHERE id = ?1",
                [id],
                row_to_pattern,
            )
            .optional()
        })
    }

    /// Active patterns, most observed first.
    pub fn list_active(&self, limit: usize) -> Result<Vec<Pattern>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, pattern_type, description, components, trigger_conditions,
                        occurrences, success_rate, strength, status, created_at, updated_at
                 FROM patterns WHERE status = 'active'
                 ORDER BY occurrences DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], row_to_pattern)?;
            rows.collect()
        })
    }

    /// Record another observation of a pattern, folding the outcome
    /// into its running success rate and nudging strength.
    pub fn record_occurrence(&self, id: &str, success: bool) -> Result<Pattern> {
        let pattern = self
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        let occurrences = pattern.occurrences + 1;
        let successes =
            pattern.success_rate * pattern.occurrences as f32 + if success { 1.0 } else { 0.0 };
        let success_rate = successes / occurrences as f32;
        let strength = (pattern.strength + 0.05).min(1.0);

        self.store.write(|conn| {
            conn.execute(
                "UPDATE patterns SET occurrences = ?1, success_rate = ?2, strength = ?3,
                        updated_at = ?4
                 WHERE id = ?5",
                params![
                    occurrences,
                    success_rate as f64,
                    strength as f64,
                    Utc::now(),
                    id
                ],
            )
        })?;
        self.get(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Active patterns mature enough to promote.
    pub fn promotion_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Pattern>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, pattern_type, description, components, trigger_conditions,
                        occurrences, success_rate, strength, status, created_at, updated_at
                 FROM patterns
                 WHERE status = 'active'
                   AND occurrences >= ?1 AND success_rate >= ?2 AND strength >= ?3
                 ORDER BY occurrences DESC",
            )?;
            let rows = stmt.query_map(
                params![
                    filter.min_occurrences,
                    filter.min_success_rate as f64,
                    filter.min_strength as f64
                ],
                row_to_pattern,
            )?;
            rows.collect()
        })
    }

    /// Move a pattern to a new status.
    pub fn set_status(&self, id: &str, status: PatternStatus) -> Result<()> {
        let changed = self.store.write(|conn| {
            conn.execute(
                "UPDATE patterns SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now(), id],
            )
        })?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

fn row_to_pattern(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pattern> {
    let pattern_type: String = row.get(1)?;
    let components: String = row.get(3)?;
    let triggers: String = row.get(4)?;
    let status: String = row.get(8)?;
    Ok(Pattern {
        id: row.get(0)?,
        pattern_type: PatternType::parse_name(&pattern_type).unwrap_or(PatternType::Heuristic),
        description: row.get(2)?,
        components: serde_json::from_str(&components).unwrap_or_default(),
        trigger_conditions: serde_json::from_str(&triggers).unwrap_or_default(),
        occurrences: row.get(5)?,
        success_rate: row.get::<_, f64>(6)? as f32,
        strength: row.get::<_, f64>(7)? as f32,
        status: PatternStatus::parse_name(&status),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

// ============================================================================
// PROMOTER
// ============================================================================

/// What happened to a promoted pattern.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionOutcome {
    /// The pattern
    pub pattern_id: String,
    /// What the promotion produced ("triple", "procedure",
    /// "skill_memory", "heuristic_memory", or a skip reason)
    pub action: String,
    /// Whether the pattern was marked promoted
    pub promoted: bool,
}

/// Promotes mature patterns into durable knowledge.
pub struct PatternPromoter {
    patterns: Arc<PatternStore>,
    store: Arc<EngramStore>,
    gate: Arc<LlmGate>,
    triples: Option<Arc<dyn TripleSink>>,
    procedures: Option<Arc<dyn ProcedurePromoter>>,
}

impl PatternPromoter {
    /// Wire up with the optional external sinks.
    pub fn new(
        patterns: Arc<PatternStore>,
        store: Arc<EngramStore>,
        gate: Arc<LlmGate>,
        triples: Option<Arc<dyn TripleSink>>,
        procedures: Option<Arc<dyn ProcedurePromoter>>,
    ) -> Self {
        Self {
            patterns,
            store,
            gate,
            triples,
            procedures,
        }
    }

    /// Promote one pattern according to its type.
    pub async fn promote(&self, pattern: &Pattern) -> CoreResult<PromotionOutcome> {
        match pattern.pattern_type {
            PatternType::Inference => self.promote_inference(pattern),
            PatternType::Workflow => self.promote_workflow(pattern),
            PatternType::Skill => {
                self.promote_as_memory(pattern, 0.85, "promoted_skill", "skill_memory")
                    .await
            }
            PatternType::Heuristic => {
                self.promote_as_memory(pattern, 0.80, "promoted_heuristic", "heuristic_memory")
                    .await
            }
        }
    }

    fn promote_inference(&self, pattern: &Pattern) -> CoreResult<PromotionOutcome> {
        let Some(sink) = &self.triples else {
            return Ok(PromotionOutcome {
                pattern_id: pattern.id.clone(),
                action: "skipped_no_triple_sink".to_string(),
                promoted: false,
            });
        };

        // Components carry (subject, predicate, object) when the
        // detector could extract them; otherwise the description
        // becomes a derived-claim triple.
        let mut props = Map::new();
        props.insert("pattern_id".to_string(), Value::String(pattern.id.clone()));
        props.insert(
            "occurrences".to_string(),
            Value::Number(pattern.occurrences.into()),
        );
        let result = match pattern.components.as_slice() {
            [subject, predicate, object, ..] => {
                sink.insert_triple(subject, predicate, object, &props)
            }
            _ => sink.insert_triple(&pattern.description, "derived_from", "pattern", &props),
        };
        result.map_err(MemoryError::ValidationFailed)?;

        self.patterns.set_status(&pattern.id, PatternStatus::Promoted)?;
        Ok(PromotionOutcome {
            pattern_id: pattern.id.clone(),
            action: "triple".to_string(),
            promoted: true,
        })
    }

    fn promote_workflow(&self, pattern: &Pattern) -> CoreResult<PromotionOutcome> {
        let Some(promoter) = &self.procedures else {
            return Ok(PromotionOutcome {
                pattern_id: pattern.id.clone(),
                action: "skipped_no_procedure_promoter".to_string(),
                promoted: false,
            });
        };
        promoter
            .promote_workflow(pattern)
            .map_err(MemoryError::ValidationFailed)?;
        self.patterns.set_status(&pattern.id, PatternStatus::Promoted)?;
        Ok(PromotionOutcome {
            pattern_id: pattern.id.clone(),
            action: "procedure".to_string(),
            promoted: true,
        })
    }

    async fn promote_as_memory(
        &self,
        pattern: &Pattern,
        importance: f32,
        tag: &str,
        action: &str,
    ) -> CoreResult<PromotionOutcome> {
        let embedding = self.gate.embed(&pattern.description).await?;
        let draft = EngramDraft::new(pattern.description.clone())
            .category(Category::Fact)
            .importance(importance)
            .tag(tag);
        self.store.insert(&draft, &embedding, None)?;
        self.patterns.set_status(&pattern.id, PatternStatus::Promoted)?;
        Ok(PromotionOutcome {
            pattern_id: pattern.id.clone(),
            action: action.to_string(),
            promoted: true,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Telemetry;
    use crate::test_support::{test_config, StubModel};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<EngramStore>,
        patterns: Arc<PatternStore>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(EngramStore::open(&config, Telemetry::default()).unwrap());
        let patterns = Arc::new(PatternStore::new(store.clone()));
        Fixture {
            _dir: dir,
            store,
            patterns,
        }
    }

    fn mature(fixture: &Fixture, pattern_type: PatternType, components: &[&str]) -> Pattern {
        let components: Vec<String> = components.iter().map(|s| s.to_string()).collect();
        let pattern = fixture
            .patterns
            .insert(pattern_type, "tests pass after cargo fmt", &components, &[])
            .unwrap();
        // Drive it over the promotion floors.
        let mut latest = pattern;
        for _ in 0..10 {
            latest = fixture.patterns.record_occurrence(&latest.id, true).unwrap();
        }
        latest
    }

    #[derive(Default)]
    struct RecordingSink {
        triples: Mutex<Vec<(String, String, String)>>,
    }

    impl TripleSink for RecordingSink {
        fn insert_triple(
            &self,
            subject: &str,
            predicate: &str,
            object: &str,
            _properties: &Map<String, Value>,
        ) -> std::result::Result<(), String> {
            self.triples.lock().unwrap().push((
                subject.to_string(),
                predicate.to_string(),
                object.to_string(),
            ));
            Ok(())
        }
    }

    #[test]
    fn test_insert_and_candidates() {
        let fixture = fixture();
        let young = fixture
            .patterns
            .insert(PatternType::Skill, "new skill", &[], &[])
            .unwrap();
        let ready = mature(&fixture, PatternType::Skill, &[]);

        let candidates = fixture
            .patterns
            .promotion_candidates(&CandidateFilter::default())
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, ready.id);
        assert_ne!(candidates[0].id, young.id);
    }

    #[test]
    fn test_record_occurrence_tracks_success_rate() {
        let fixture = fixture();
        let pattern = fixture
            .patterns
            .insert(PatternType::Heuristic, "sometimes works", &[], &[])
            .unwrap();

        fixture.patterns.record_occurrence(&pattern.id, true).unwrap();
        let after = fixture.patterns.record_occurrence(&pattern.id, false).unwrap();
        assert_eq!(after.occurrences, 3);
        assert!(after.success_rate > 0.3 && after.success_rate < 0.4);
    }

    #[tokio::test]
    async fn test_promote_inference_writes_triple() {
        let fixture = fixture();
        let pattern = mature(
            &fixture,
            PatternType::Inference,
            &["flaky tests", "caused_by", "shared state"],
        );

        let sink = Arc::new(RecordingSink::default());
        let model = Arc::new(StubModel::new(64));
        let gate = Arc::new(LlmGate::new(model, std::time::Duration::from_secs(5)));
        let promoter = PatternPromoter::new(
            fixture.patterns.clone(),
            fixture.store.clone(),
            gate,
            Some(sink.clone()),
            None,
        );

        let outcome = promoter.promote(&pattern).await.unwrap();
        assert!(outcome.promoted);
        assert_eq!(outcome.action, "triple");
        assert_eq!(
            sink.triples.lock().unwrap()[0],
            (
                "flaky tests".to_string(),
                "caused_by".to_string(),
                "shared state".to_string()
            )
        );
        assert_eq!(
            fixture.patterns.get(&pattern.id).unwrap().unwrap().status,
            PatternStatus::Promoted
        );
    }

    #[tokio::test]
    async fn test_promote_skill_creates_memory() {
        let fixture = fixture();
        let pattern = mature(&fixture, PatternType::Skill, &[]);

        let model = Arc::new(StubModel::new(64));
        let gate = Arc::new(LlmGate::new(model, std::time::Duration::from_secs(5)));
        let promoter = PatternPromoter::new(
            fixture.patterns.clone(),
            fixture.store.clone(),
            gate,
            None,
            None,
        );

        let outcome = promoter.promote(&pattern).await.unwrap();
        assert_eq!(outcome.action, "skill_memory");

        let promoted = fixture.store.find_by_tag("promoted_skill", 5).unwrap();
        assert_eq!(promoted.len(), 1);
        assert!((promoted[0].importance - 0.85).abs() < 1e-6);
        // 0.85 importance auto-protects on insert.
        assert!(promoted[0].protected);
    }

    #[tokio::test]
    async fn test_promote_workflow_without_promoter_skips() {
        let fixture = fixture();
        let pattern = mature(&fixture, PatternType::Workflow, &[]);

        let model = Arc::new(StubModel::new(64));
        let gate = Arc::new(LlmGate::new(model, std::time::Duration::from_secs(5)));
        let promoter = PatternPromoter::new(
            fixture.patterns.clone(),
            fixture.store.clone(),
            gate,
            None,
            None,
        );

        let outcome = promoter.promote(&pattern).await.unwrap();
        assert!(!outcome.promoted);
        assert_eq!(
            fixture.patterns.get(&pattern.id).unwrap().unwrap().status,
            PatternStatus::Active
        );
    }
}
