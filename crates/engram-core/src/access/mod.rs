//! Access Tracker
//!
//! Batched access counters with fire-and-forget tracking. Pending
//! counts flush when the batch fills, when the interval elapses, or on
//! explicit request. Each flush applies the spacing effect (decay-rate
//! tightening) and auto-protects hot rows.
//!
//! The tracker is also the sole source of Hebbian input: every tracked
//! id pairs with the other ids seen inside a sliding window, and the
//! normalized pairs flow to the linker as co-activation events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::config::MemoryConfig;
use crate::hebbian::LinkerHandle;
use crate::storage::EngramStore;

// ============================================================================
// CO-ACTIVATION EVENTS
// ============================================================================

/// Engram ids retrieved close together in time.
///
/// Pairs are normalized `(min_id, max_id)` so the undirected edge
/// lookup is stable. `outcome` marks learning-outcome co-activation
/// (a successful tool execution over a retrieved memory set), which
/// the linker strengthens more aggressively.
#[derive(Debug, Clone)]
pub struct CoActivation {
    /// Normalized id pairs
    pub pairs: Vec<(String, String)>,
    /// Whether this came from a successful outcome
    pub outcome: bool,
}

/// Normalize a pair into `(min, max)` order.
pub fn normalize_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

enum Msg {
    Track(String),
    TrackMany(Vec<String>),
    Outcome(Vec<String>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Clone-able handle to the tracker task. All tracking calls are
/// synchronous fire-and-forget sends.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl TrackerHandle {
    /// Record one access.
    pub fn track(&self, id: impl Into<String>) {
        let _ = self.tx.send(Msg::Track(id.into()));
    }

    /// Record a batch of accesses.
    pub fn track_many(&self, ids: Vec<String>) {
        if !ids.is_empty() {
            let _ = self.tx.send(Msg::TrackMany(ids));
        }
    }

    /// Record a successful outcome over a retrieved memory set.
    pub fn record_outcome(&self, ids: Vec<String>) {
        if ids.len() >= 2 {
            let _ = self.tx.send(Msg::Outcome(ids));
        }
    }

    /// Force a flush and wait for it to land.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::Flush(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Flush and stop the task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// TRACKER TASK
// ============================================================================

/// Spawns and runs the access tracker task.
pub struct AccessTracker;

impl AccessTracker {
    /// Spawn the tracker over the store, wiring co-activation output to
    /// the linker when present.
    pub fn spawn(
        store: Arc<EngramStore>,
        config: &MemoryConfig,
        linker: Option<LinkerHandle>,
    ) -> TrackerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = TrackerState {
            store,
            linker,
            pending: HashMap::new(),
            window: VecDeque::new(),
            flush_size: config.access_flush_size,
            window_duration: config.coactivation_window,
        };
        tokio::spawn(run(rx, state, config.access_flush_interval));
        TrackerHandle { tx }
    }
}

struct TrackerState {
    store: Arc<EngramStore>,
    linker: Option<LinkerHandle>,
    pending: HashMap<String, u32>,
    window: VecDeque<(Instant, String)>,
    flush_size: usize,
    window_duration: Duration,
}

async fn run(mut rx: mpsc::UnboundedReceiver<Msg>, mut state: TrackerState, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await; // discard the immediate first tick

    loop {
        tokio::select! {
            _ = tick.tick() => {
                state.flush();
            }
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    state.flush();
                    break;
                };
                match msg {
                    Msg::Track(id) => state.track_one(id),
                    Msg::TrackMany(ids) => {
                        for id in ids {
                            state.track_one(id);
                        }
                    }
                    Msg::Outcome(ids) => state.emit_outcome(ids),
                    Msg::Flush(reply) => {
                        state.flush();
                        let _ = reply.send(());
                    }
                    Msg::Shutdown(reply) => {
                        state.flush();
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        }
    }
}

impl TrackerState {
    fn track_one(&mut self, id: String) {
        self.emit_coactivation(&id);
        *self.pending.entry(id).or_insert(0) += 1;
        if self.pending.len() >= self.flush_size {
            self.flush();
        }
    }

    /// Pair the id with everything else inside the window, pruning
    /// first so stale entries never pair.
    fn emit_coactivation(&mut self, id: &str) {
        let now = Instant::now();
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > self.window_duration {
                self.window.pop_front();
            } else {
                break;
            }
        }

        let pairs = {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut pairs = Vec::new();
            for (_, other) in &self.window {
                if other.as_str() != id && seen.insert(other.as_str()) {
                    pairs.push(normalize_pair(id, other));
                }
            }
            pairs
        };
        self.window.push_back((now, id.to_string()));

        if !pairs.is_empty() {
            if let Some(linker) = &self.linker {
                linker.co_activation(CoActivation {
                    pairs,
                    outcome: false,
                });
            }
        }
    }

    /// All distinct pairs among an outcome set.
    fn emit_outcome(&mut self, ids: Vec<String>) {
        let distinct: Vec<String> = {
            let mut seen = HashSet::new();
            ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
        };
        let mut pairs = Vec::new();
        for i in 0..distinct.len() {
            for j in (i + 1)..distinct.len() {
                pairs.push(normalize_pair(&distinct[i], &distinct[j]));
            }
        }
        if !pairs.is_empty() {
            if let Some(linker) = &self.linker {
                linker.co_activation(CoActivation {
                    pairs,
                    outcome: true,
                });
            }
        }
    }

    /// Group pending ids by increment and land one update per group,
    /// then the auto-protect pass over everything flushed.
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);

        let mut by_increment: HashMap<u32, Vec<String>> = HashMap::new();
        for (id, count) in pending {
            by_increment.entry(count).or_default().push(id);
        }

        let mut all_ids = Vec::new();
        for (increment, ids) in by_increment {
            if let Err(e) = self.store.apply_access_batch(&ids, increment) {
                tracing::warn!("access flush failed for increment {}: {}", increment, e);
                continue;
            }
            all_ids.extend(ids);
        }

        if let Err(e) = self.store.apply_auto_protect(&all_ids) {
            tracing::warn!("auto-protect pass failed: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
