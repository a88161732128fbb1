//! Background Cognition Cycle
//!
//! Idle-triggered, budget-bounded consolidation. A scheduler tick polls
//! for quiet; a cycle runs at most hourly, strictly one at a time, and
//! issues at most the configured number of LLM completion calls with a
//! minimum gap between them. Each process returns a tagged result -
//! a failure in one process never aborts the cycle, and once the budget
//! is gone every remaining process reports `skipped: budget_exhausted`.

mod processes;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::Graph;
use crate::lifecycle::DbMaintenance;
use crate::llm::{CompleteOptions, LlmError, LlmGate};
use crate::pattern::{PatternPromoter, PatternStore, TripleSink};
use crate::storage::EngramStore;
use crate::telemetry::Telemetry;

// ============================================================================
// ACTIVITY MONITOR
// ============================================================================

/// Tracks when the user last did anything. The cycle only starts after
/// a quiet period; retrieval and write paths touch this on every call.
pub struct ActivityMonitor {
    last: Mutex<Instant>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMonitor {
    /// Start with activity recorded now.
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Note user activity.
    pub fn record(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// LLM BUDGET
// ============================================================================

/// Why a budgeted call did not produce text.
#[derive(Debug)]
pub enum BudgetError {
    /// No calls left this cycle
    Exhausted,
    /// The call itself failed
    Llm(LlmError),
}

/// Per-cycle completion-call budget with an enforced inter-call gap.
/// Embedding calls are sub-second and do not count against it.
pub struct LlmBudget {
    max_calls: u32,
    used: u32,
    gap: Duration,
    last_call: Option<Instant>,
}

impl LlmBudget {
    /// Fresh budget.
    pub fn new(max_calls: u32, gap: Duration) -> Self {
        Self {
            max_calls,
            used: 0,
            gap,
            last_call: None,
        }
    }

    /// Whether every call is spent.
    pub fn exhausted(&self) -> bool {
        self.used >= self.max_calls
    }

    /// Calls issued so far.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Issue one budgeted completion, waiting out the gap first. A
    /// failed call still counts - the budget bounds attempts, not
    /// successes.
    pub async fn complete(
        &mut self,
        gate: &LlmGate,
        prompt: &str,
        opts: CompleteOptions,
    ) -> std::result::Result<String, BudgetError> {
        if self.exhausted() {
            return Err(BudgetError::Exhausted);
        }
        if let Some(last) = self.last_call {
            let since = last.elapsed();
            if since < self.gap {
                tokio::time::sleep(self.gap - since).await;
            }
        }
        self.used += 1;
        self.last_call = Some(Instant::now());
        gate.complete(prompt, opts).await.map_err(BudgetError::Llm)
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// How one process ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ProcessOutcome {
    /// Ran and produced a payload
    Completed(Value),
    /// Did not run, with the reason
    Skipped(String),
    /// Ran and failed; the cycle continued
    Failed(String),
}

/// One process's tagged result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    /// Process name
    pub name: &'static str,
    /// What happened
    pub outcome: ProcessOutcome,
}

impl ProcessResult {
    fn completed(name: &'static str, payload: Value) -> Self {
        Self {
            name,
            outcome: ProcessOutcome::Completed(payload),
        }
    }

    fn skipped(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            outcome: ProcessOutcome::Skipped(reason.into()),
        }
    }

    fn skipped_budget(name: &'static str) -> Self {
        Self::skipped(name, "budget_exhausted")
    }

    fn failed(name: &'static str, error: impl std::fmt::Display) -> Self {
        Self {
            name,
            outcome: ProcessOutcome::Failed(error.to_string()),
        }
    }
}

/// One cycle's report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Wall time
    pub duration_ms: u64,
    /// Budgeted LLM calls issued
    pub llm_calls: u32,
    /// Per-process results, in execution order
    pub processes: Vec<ProcessResult>,
}

/// Admin stats.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleStats {
    /// Cycles completed since startup
    pub cycles_run: u64,
    /// Whether a cycle is running right now
    pub running: bool,
    /// The most recent report
    pub last_report: Option<CycleReport>,
}

// ============================================================================
// CYCLE
// ============================================================================

/// Everything the cycle's processes touch.
pub struct CognitionDeps {
    /// Engram rows
    pub store: Arc<EngramStore>,
    /// Associative graph
    pub graph: Arc<Graph>,
    /// Pattern rows
    pub patterns: Arc<PatternStore>,
    /// Promotion dispatcher
    pub promoter: Arc<PatternPromoter>,
    /// LLM gate
    pub gate: Arc<LlmGate>,
    /// Optional semantic-triple sink
    pub triples: Option<Arc<dyn TripleSink>>,
    /// Maintenance schedule + synthesis state
    pub maintenance: Arc<DbMaintenance>,
    /// Event publisher
    pub telemetry: Telemetry,
    /// Tunables
    pub config: MemoryConfig,
}

struct CycleState {
    running: bool,
    last_completed: Option<Instant>,
    cycles_run: u64,
    last_report: Option<CycleReport>,
}

/// The background cognition cycle.
pub struct CognitionCycle {
    deps: CognitionDeps,
    activity: Arc<ActivityMonitor>,
    state: Mutex<CycleState>,
}

impl CognitionCycle {
    /// Wire up the cycle.
    pub fn new(deps: CognitionDeps, activity: Arc<ActivityMonitor>) -> Arc<Self> {
        Arc::new(Self {
            deps,
            activity,
            state: Mutex::new(CycleState {
                running: false,
                last_completed: None,
                cycles_run: 0,
                last_report: None,
            }),
        })
    }

    /// Spawn the idle-polling scheduler.
    pub fn spawn_scheduler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cycle = Arc::clone(self);
        let tick_interval = cycle.deps.config.scheduler_tick;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                match cycle.run_now(false).await {
                    Ok(report) => {
                        tracing::debug!(
                            duration_ms = report.duration_ms,
                            llm_calls = report.llm_calls,
                            "background cycle completed"
                        );
                    }
                    Err(MemoryError::ValidationFailed(_)) => {} // not time yet
                    Err(e) => tracing::warn!("background cycle failed: {}", e),
                }
            }
        })
    }

    /// Run a cycle now. Without `force` the idle threshold, the hourly
    /// spacing and the exclusivity flag all apply; `force` overrides
    /// the first two but never the exclusivity flag.
    pub async fn run_now(self: &Arc<Self>, force: bool) -> Result<CycleReport> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| MemoryError::ValidationFailed("cycle state poisoned".to_string()))?;
            if state.running {
                return Err(MemoryError::ValidationFailed(
                    "a cycle is already running".to_string(),
                ));
            }
            if !force {
                if self.activity.idle_for() < self.deps.config.idle_threshold {
                    return Err(MemoryError::ValidationFailed(
                        "session is active".to_string(),
                    ));
                }
                if let Some(last) = state.last_completed {
                    if last.elapsed() < self.deps.config.cycle_spacing {
                        return Err(MemoryError::ValidationFailed(
                            "last cycle completed too recently".to_string(),
                        ));
                    }
                }
            }
            state.running = true;
        }

        let report = self.run_cycle().await;

        if let Ok(mut state) = self.state.lock() {
            state.running = false;
            state.last_completed = Some(Instant::now());
            state.cycles_run += 1;
            state.last_report = Some(report.clone());
        }
        Ok(report)
    }

    async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();

        // Database upkeep runs first, while we know the system is idle.
        if let Err(e) = self.deps.maintenance.maybe_analyze() {
            tracing::warn!("analyze failed: {}", e);
        }
        if let Err(e) = self.deps.maintenance.maybe_vacuum() {
            tracing::warn!("vacuum failed: {}", e);
        }
        self.deps.maintenance.verify_backup();

        let mut budget = LlmBudget::new(
            self.deps.config.llm_calls_per_cycle,
            self.deps.config.llm_call_gap,
        );

        let processes = vec![
            self.deep_consolidation(&mut budget).await,
            self.emergence_enhancement(&mut budget).await,
            self.context_precompute(&mut budget).await,
            self.decay_intelligence(&mut budget).await,
            self.knowledge_synthesis(&mut budget).await,
            self.knowledge_promotion(&mut budget).await,
            self.upgrade_analysis(&mut budget).await,
        ];

        let report = CycleReport {
            duration_ms: started.elapsed().as_millis() as u64,
            llm_calls: budget.used(),
            processes,
        };

        self.deps.telemetry.emit(
            "cognition_cycle",
            json!({
                "duration_ms": report.duration_ms,
                "llm_calls": report.llm_calls,
            }),
            serde_json::to_value(&report.processes).unwrap_or(Value::Null),
        );

        report
    }

    /// Admin stats.
    pub fn stats(&self) -> CycleStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        CycleStats {
            cycles_run: state.cycles_run,
            running: state.running,
            last_report: state.last_report.clone(),
        }
    }

    /// Whether the session counts as active right now.
    pub fn session_active(&self) -> bool {
        self.activity.idle_for() < self.deps.config.idle_threshold
    }

    /// Note user activity.
    pub fn record_activity(&self) {
        self.activity.record();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EngramDraft, RecentFilter};
    use crate::pattern::PatternType;
    use crate::test_support::{cognition_fixture, test_embedding, CognitionFixture};

    fn seed_memories(fixture: &CognitionFixture, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                fixture
                    .store
                    .insert(
                        &EngramDraft::new(format!("seeded memory number {}", i)).importance(0.7),
                        &test_embedding(i as u64),
                        None,
                    )
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[tokio::test]
    async fn test_budget_counts_and_gap() {
        let fixture = cognition_fixture(3).await;
        let mut budget = LlmBudget::new(2, Duration::ZERO);

        fixture.model.push_response("one");
        fixture.model.push_response("two");
        assert!(budget
            .complete(&fixture.gate, "p1", CompleteOptions::default())
            .await
            .is_ok());
        assert!(budget
            .complete(&fixture.gate, "p2", CompleteOptions::default())
            .await
            .is_ok());
        assert!(matches!(
            budget
                .complete(&fixture.gate, "p3", CompleteOptions::default())
                .await,
            Err(BudgetError::Exhausted)
        ));
        assert_eq!(budget.used(), 2);
    }

    #[tokio::test]
    async fn test_cycle_exclusivity() {
        let fixture = cognition_fixture(10).await;
        {
            let mut state = fixture.cycle.state.lock().unwrap();
            state.running = true;
        }
        let result = fixture.cycle.run_now(true).await;
        assert!(matches!(result, Err(MemoryError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_cycle_respects_activity() {
        let fixture = cognition_fixture(10).await;
        // An idle threshold far in the future: the session is "active".
        let mut config = fixture.cycle.deps.config.clone();
        config.idle_threshold = Duration::from_secs(3600);
        let deps = CognitionDeps {
            config,
            ..clone_deps(&fixture)
        };
        let cycle = CognitionCycle::new(deps, fixture.activity.clone());
        cycle.record_activity();

        assert!(cycle.session_active());
        assert!(matches!(
            cycle.run_now(false).await,
            Err(MemoryError::ValidationFailed(_))
        ));
        // Force overrides the idle gate.
        assert!(cycle.run_now(true).await.is_ok());
    }

    fn clone_deps(fixture: &CognitionFixture) -> CognitionDeps {
        CognitionDeps {
            store: fixture.store.clone(),
            graph: fixture.graph.clone(),
            patterns: fixture.patterns.clone(),
            promoter: fixture.promoter.clone(),
            gate: fixture.gate.clone(),
            triples: None,
            maintenance: fixture.maintenance.clone(),
            telemetry: Telemetry::default(),
            config: fixture.cycle.deps.config.clone(),
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_skips_remaining_processes() {
        // One call allowed: deep consolidation spends it, every later
        // LLM-needing process reports skipped: budget_exhausted.
        let fixture = cognition_fixture(1).await;
        seed_memories(&fixture, 6);
        fixture
            .patterns
            .insert(PatternType::Skill, "some active pattern", &[], &[])
            .unwrap();
        fixture.model.push_response(r#"{"connections": [], "concepts": []}"#);

        let report = fixture.cycle.run_now(true).await.unwrap();
        assert_eq!(report.llm_calls, 1);

        let by_name: std::collections::HashMap<&str, &ProcessOutcome> = report
            .processes
            .iter()
            .map(|p| (p.name, &p.outcome))
            .collect();

        assert!(matches!(
            by_name["deep_consolidation"],
            ProcessOutcome::Completed(_)
        ));
        for name in ["emergence_enhancement", "context_precompute", "knowledge_synthesis"] {
            match by_name[name] {
                ProcessOutcome::Skipped(reason) => {
                    assert_eq!(reason, "budget_exhausted", "{}", name)
                }
                other => panic!("{} should be budget-skipped, got {:?}", name, other),
            }
        }
    }

    #[tokio::test]
    async fn test_full_cycle_with_budget() {
        let fixture = cognition_fixture(10).await;
        let ids = seed_memories(&fixture, 6);

        // Deep consolidation: connect the first two memories, name one
        // concept.
        fixture.model.push_response(format!(
            r#"{{"connections": [{{"from": "{}", "to": "{}", "reason": "same topic"}}],
                "concepts": ["seeding"]}}"#,
            ids[0], ids[1]
        ));
        // Emergence review.
        fixture.model.push_response("keep everything as-is");
        // Context pre-computation summary.
        fixture
            .model
            .push_response("The session has been seeding numbered memories.");
        // Synthesis (quality gate: >= 100 chars, importance >= 0.6).
        fixture.model.push_response(
            r#"{"syntheses": [{"insight": "Numbered seed memories show a deliberate pattern of data generation for exercising retrieval paths and background consolidation.", "importance": 0.7}]}"#,
        );
        // Upgrade analysis.
        fixture
            .model
            .push_response(r#"{"recommendations": [{"rank": 1, "recommendation": "batch embeds"}]}"#);

        fixture
            .patterns
            .insert(PatternType::Skill, "pattern under review", &[], &[])
            .unwrap();

        let report = fixture.cycle.run_now(true).await.unwrap();
        assert!(report.llm_calls <= 10);

        let outcomes: std::collections::HashMap<&str, &ProcessOutcome> = report
            .processes
            .iter()
            .map(|p| (p.name, &p.outcome))
            .collect();

        assert!(matches!(
            outcomes["deep_consolidation"],
            ProcessOutcome::Completed(_)
        ));
        assert!(matches!(
            outcomes["decay_intelligence"],
            ProcessOutcome::Skipped(_)
        ));

        // The precomputed context landed as a plan memory.
        let plans = fixture.store.find_by_tag("precomputed_context", 5).unwrap();
        assert_eq!(plans.len(), 1);
        assert!((plans[0].importance - 0.9).abs() < 1e-6);

        // The synthesis landed as a tagged fact.
        let syntheses = fixture.store.find_by_tag("synthesis", 5).unwrap();
        assert_eq!(syntheses.len(), 1);

        // Stats reflect the run.
        let stats = fixture.cycle.stats();
        assert_eq!(stats.cycles_run, 1);
        assert!(!stats.running);

        // Recent memories now include cycle products.
        let recent = fixture
            .store
            .get_recent(&RecentFilter::latest(20))
            .unwrap();
        assert!(recent.len() > 6);
    }
}
