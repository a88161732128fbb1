//! Hebbian Linker
//!
//! Consumes co-activation events and strengthens undirected
//! `relates_to` edges between memory nodes with bounded-growth LTP:
//! `w' = min(1, w + alpha * (1 - w))`. Edge creation is quality-gated
//! (both endpoints at importance >= 0.5) and rate-limited per rolling
//! hour; excess pairs drop with a counter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::access::CoActivation;
use crate::config::MemoryConfig;
use crate::graph::{edge_types, memory_node_name, node_types, EdgeSpec, Graph};
use crate::storage::EngramStore;

/// Provenance string stamped on every linker-created edge
pub const HEBBIAN_SOURCE: &str = "hebbian_learning";

/// Age after which never-accessed hebbian edges become sweepable
pub const STALE_EDGE_DAYS: i64 = 7;

/// Minimum endpoint importance for edge creation
const MIN_ENDPOINT_IMPORTANCE: f32 = 0.5;

/// LTP step for plain co-activation
const ALPHA_COACTIVATION: f32 = 0.05;

/// LTP step for learning-outcome co-activation
const ALPHA_OUTCOME: f32 = 0.10;

/// Starting weight for a co-activation edge
const INITIAL_WEIGHT: f32 = 0.3;

/// Starting weight for an outcome edge
const INITIAL_WEIGHT_OUTCOME: f32 = 0.5;

// ============================================================================
// HANDLE
// ============================================================================

/// Linker counters.
#[derive(Debug, Clone, Default)]
pub struct LinkerStats {
    /// Edges created inside the current rolling hour
    pub created_last_hour: usize,
    /// Edges created since spawn
    pub created_total: u64,
    /// Pairs dropped by the rate limit
    pub pairs_dropped: u64,
}

enum Msg {
    Event(CoActivation),
    Stats(oneshot::Sender<LinkerStats>),
    Sync(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Clone-able handle to the linker task.
#[derive(Clone)]
pub struct LinkerHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl LinkerHandle {
    /// Deliver a co-activation event (fire-and-forget).
    pub fn co_activation(&self, event: CoActivation) {
        let _ = self.tx.send(Msg::Event(event));
    }

    /// Current counters.
    pub async fn stats(&self) -> LinkerStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::Stats(reply)).is_ok() {
            if let Ok(stats) = rx.await {
                return stats;
            }
        }
        LinkerStats::default()
    }

    /// Wait until every event sent so far has been processed.
    pub async fn sync(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::Sync(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// A handle that records events instead of linking; lets tracker
    /// tests observe co-activation output directly.
    #[cfg(test)]
    pub(crate) fn recording() -> (Self, mpsc::UnboundedReceiver<CoActivation>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Event(event) => {
                        let _ = event_tx.send(event);
                    }
                    Msg::Stats(reply) => {
                        let _ = reply.send(LinkerStats::default());
                    }
                    Msg::Sync(reply) => {
                        let _ = reply.send(());
                    }
                    Msg::Shutdown(reply) => {
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        });
        (Self { tx }, event_rx)
    }
}

// ============================================================================
// LINKER TASK
// ============================================================================

/// Spawns and runs the Hebbian linker task.
pub struct HebbianLinker;

impl HebbianLinker {
    /// Spawn the linker over the store and graph.
    pub fn spawn(store: Arc<EngramStore>, graph: Arc<Graph>, config: &MemoryConfig) -> LinkerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = LinkerState {
            store,
            graph,
            hourly_cap: config.hebbian_hourly_cap,
            created: VecDeque::new(),
            created_total: 0,
            dropped: 0,
        };

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Event(event) => state.process(event),
                    Msg::Stats(reply) => {
                        state.prune();
                        let _ = reply.send(LinkerStats {
                            created_last_hour: state.created.len(),
                            created_total: state.created_total,
                            pairs_dropped: state.dropped,
                        });
                    }
                    Msg::Sync(reply) => {
                        let _ = reply.send(());
                    }
                    Msg::Shutdown(reply) => {
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        });

        LinkerHandle { tx }
    }
}

struct LinkerState {
    store: Arc<EngramStore>,
    graph: Arc<Graph>,
    hourly_cap: usize,
    created: VecDeque<Instant>,
    created_total: u64,
    dropped: u64,
}

impl LinkerState {
    fn prune(&mut self) {
        let cutoff = Instant::now() - Duration::from_secs(3600);
        while let Some(at) = self.created.front() {
            if *at < cutoff {
                self.created.pop_front();
            } else {
                break;
            }
        }
    }

    fn process(&mut self, event: CoActivation) {
        let alpha = if event.outcome {
            ALPHA_OUTCOME
        } else {
            ALPHA_COACTIVATION
        };
        let initial = if event.outcome {
            INITIAL_WEIGHT_OUTCOME
        } else {
            INITIAL_WEIGHT
        };

        let total = event.pairs.len();
        for (index, (a, b)) in event.pairs.into_iter().enumerate() {
            match self.link_pair(&a, &b, alpha, initial, event.outcome) {
                Ok(_) => {}
                Err(LinkOutcome::RateLimited) => {
                    // Budget exceeded: drop everything left in this
                    // event, no partial work.
                    self.dropped += (total - index) as u64;
                    tracing::debug!(dropped = total - index, "hebbian rate cap hit");
                    break;
                }
                Err(LinkOutcome::Skipped(reason)) => {
                    tracing::debug!(%a, %b, reason, "hebbian pair skipped");
                }
                Err(LinkOutcome::Error(e)) => {
                    tracing::warn!(%a, %b, "hebbian link failed: {}", e);
                }
            }
        }
    }

    fn link_pair(
        &mut self,
        a: &str,
        b: &str,
        alpha: f32,
        initial: f32,
        outcome: bool,
    ) -> std::result::Result<(), LinkOutcome> {
        // Quality gate: both endpoints must matter.
        for id in [a, b] {
            match self.store.get(id) {
                Ok(Some(engram)) if engram.importance >= MIN_ENDPOINT_IMPORTANCE => {}
                Ok(Some(_)) => return Err(LinkOutcome::Skipped("low importance")),
                Ok(None) => return Err(LinkOutcome::Skipped("engram missing")),
                Err(e) => return Err(LinkOutcome::Error(e.to_string())),
            }
        }

        let node_a = self
            .graph
            .find_or_create_node(node_types::MEMORY, &memory_node_name(a), None)
            .map_err(|e| LinkOutcome::Error(e.to_string()))?;
        let node_b = self
            .graph
            .find_or_create_node(node_types::MEMORY, &memory_node_name(b), None)
            .map_err(|e| LinkOutcome::Error(e.to_string()))?;

        let existing = self
            .graph
            .find_edge(node_a.id, node_b.id, edge_types::RELATES_TO, true)
            .map_err(|e| LinkOutcome::Error(e.to_string()))?;

        match existing {
            Some(edge) => {
                // Long-term potentiation, bounded at 1.
                let new_weight = (edge.weight + alpha * (1.0 - edge.weight)).min(1.0);
                let mut props = edge.properties.clone();
                let ltp_count = props
                    .get("ltp_count")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                props.insert("ltp_count".to_string(), json!(ltp_count + 1));
                // from_success is sticky once set.
                let was_success = props
                    .get("from_success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                props.insert("from_success".to_string(), json!(was_success || outcome));
                self.graph
                    .update_edge(edge.id, new_weight, &props)
                    .map_err(|e| LinkOutcome::Error(e.to_string()))?;
            }
            None => {
                self.prune();
                if self.created.len() >= self.hourly_cap {
                    return Err(LinkOutcome::RateLimited);
                }
                let mut props = Map::new();
                props.insert("ltp_count".to_string(), json!(1));
                props.insert("from_success".to_string(), json!(outcome));
                props.insert("source".to_string(), json!(HEBBIAN_SOURCE));
                self.graph
                    .ensure_edge(&EdgeSpec {
                        source_node_id: node_a.id,
                        target_node_id: node_b.id,
                        edge_type: edge_types::RELATES_TO.to_string(),
                        weight: initial,
                        properties: props,
                    })
                    .map_err(|e| LinkOutcome::Error(e.to_string()))?;
                self.created.push_back(Instant::now());
                self.created_total += 1;
            }
        }
        Ok(())
    }
}

enum LinkOutcome {
    RateLimited,
    Skipped(&'static str),
    Error(String),
}

// ============================================================================
// TESTS
// ============================================================================
