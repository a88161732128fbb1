//! Index Service Task
//!
//! Single-writer ownership of the HNSW index behind an mpsc inbox.
//! Completed adds and removes are visible to every later search (the
//! inbox serializes them). A dirty index auto-saves on a timer and is
//! force-saved on shutdown.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::config::MemoryConfig;
use crate::storage::EngramStore;

use super::{IndexError, Result};

/// Rows streamed per batch during rebuild
const REBUILD_BATCH: usize = 1000;

/// Inbox depth before senders back-pressure
const INBOX_DEPTH: usize = 256;

/// Index statistics as reported to admin surfaces.
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Indexed vector count
    pub size: usize,
    /// Reserved capacity
    pub capacity: usize,
    /// Vector dimensions
    pub dimensions: usize,
    /// Unsaved changes pending
    pub dirty: bool,
    /// Last successful save
    pub last_saved_at: Option<DateTime<Utc>>,
    /// Minimum size before searches are answered
    pub threshold: usize,
    /// Whether the service is running at all
    pub available: bool,
}

enum Command {
    Add {
        id: String,
        bytes: Vec<i8>,
        scale: f32,
        offset: f32,
    },
    AddBatch {
        items: Vec<(String, Vec<i8>, f32, f32)>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Contains {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Search {
        bytes: Vec<i8>,
        scale: f32,
        offset: f32,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<(String, f32)>>>,
    },
    Save {
        reply: oneshot::Sender<Result<()>>,
    },
    Rebuild {
        reply: oneshot::Sender<Result<usize>>,
    },
    Stats {
        reply: oneshot::Sender<IndexStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// HANDLE
// ============================================================================

/// Clone-able handle to the index service.
///
/// When the underlying engine is unavailable the handle still exists -
/// `available()` is false and every call returns `Unavailable`, which
/// the planner treats as "fall back", never as a caller-visible error.
#[derive(Clone)]
pub struct IndexHandle {
    tx: Option<mpsc::Sender<Command>>,
    threshold: usize,
    dimensions: usize,
}

impl IndexHandle {
    /// A handle that reports the service as not running.
    pub fn unavailable(threshold: usize, dimensions: usize) -> Self {
        Self {
            tx: None,
            threshold,
            dimensions,
        }
    }

    /// Whether the service is running.
    pub fn available(&self) -> bool {
        self.tx.is_some()
    }

    fn sender(&self) -> Result<&mpsc::Sender<Command>> {
        self.tx
            .as_ref()
            .ok_or_else(|| IndexError::Unavailable("index service not running".to_string()))
    }

    /// Enqueue an add; fire-and-forget (failures are logged).
    pub async fn add(&self, id: String, bytes: Vec<i8>, scale: f32, offset: f32) {
        if let Ok(tx) = self.sender() {
            let _ = tx
                .send(Command::Add {
                    id,
                    bytes,
                    scale,
                    offset,
                })
                .await;
        }
    }

    /// Enqueue a batch of adds.
    pub async fn add_batch(&self, items: Vec<(String, Vec<i8>, f32, f32)>) {
        if let Ok(tx) = self.sender() {
            let _ = tx.send(Command::AddBatch { items }).await;
        }
    }

    /// Remove a vector.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.sender()?
            .send(Command::Remove {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?;
        rx.await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?
    }

    /// Whether an engram is indexed.
    pub async fn contains(&self, id: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.sender()?
            .send(Command::Contains {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?;
        rx.await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))
    }

    /// Approximate search. `BelowThreshold` under the configured size.
    pub async fn search(
        &self,
        bytes: Vec<i8>,
        scale: f32,
        offset: f32,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        let (reply, rx) = oneshot::channel();
        self.sender()?
            .send(Command::Search {
                bytes,
                scale,
                offset,
                limit,
                reply,
            })
            .await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?;
        rx.await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?
    }

    /// Force a save now.
    pub async fn save(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.sender()?
            .send(Command::Save { reply })
            .await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?;
        rx.await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?
    }

    /// Drop the current index and rebuild it from the row store.
    pub async fn rebuild(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.sender()?
            .send(Command::Rebuild { reply })
            .await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?;
        rx.await
            .map_err(|_| IndexError::Unavailable("index service stopped".to_string()))?
    }

    /// Stats snapshot. Reports `available: false` when not running.
    pub async fn stats(&self) -> IndexStats {
        if let Ok(tx) = self.sender() {
            let (reply, rx) = oneshot::channel();
            if tx.send(Command::Stats { reply }).await.is_ok() {
                if let Ok(stats) = rx.await {
                    return stats;
                }
            }
        }
        IndexStats {
            size: 0,
            capacity: 0,
            dimensions: self.dimensions,
            dirty: false,
            last_saved_at: None,
            threshold: self.threshold,
            available: false,
        }
    }

    /// Save and stop the service.
    pub async fn shutdown(&self) {
        if let Ok(tx) = self.sender() {
            let (reply, rx) = oneshot::channel();
            if tx.send(Command::Shutdown { reply }).await.is_ok() {
                let _ = rx.await;
            }
        }
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Spawns and runs the index task.
pub struct IndexService;

impl IndexService {
    /// Spawn the service. When the index engine cannot initialize the
    /// returned handle reports `available = false` and the caller
    /// proceeds without approximate search.
    #[cfg(feature = "vector-search")]
    pub fn spawn(config: &MemoryConfig, store: Arc<EngramStore>) -> IndexHandle {
        use super::VectorIndex;

        let path = config.index_path();
        let dimensions = config.dimensions;
        let threshold = config.hnsw_threshold;
        let save_interval = config.index_save_interval;

        let index = if path.exists() {
            match VectorIndex::load(&path, dimensions) {
                Ok(index) => {
                    tracing::info!(size = index.len(), "loaded vector index");
                    Ok(index)
                }
                Err(e) => {
                    tracing::warn!("failed to load vector index ({}), starting empty", e);
                    VectorIndex::new(dimensions)
                }
            }
        } else {
            VectorIndex::new(dimensions)
        };

        let mut index = match index {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!("vector index unavailable: {}", e);
                return IndexHandle::unavailable(threshold, dimensions);
            }
        };

        let (tx, mut rx) = mpsc::channel::<Command>(INBOX_DEPTH);

        tokio::spawn(async move {
            let mut save_tick = tokio::time::interval(save_interval);
            save_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            save_tick.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = save_tick.tick() => {
                        if index.dirty() {
                            if let Err(e) = index.save(&path) {
                                tracing::warn!("index auto-save failed: {}", e);
                            }
                        }
                    }
                    cmd = rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        match cmd {
                            Command::Add { id, bytes, scale, offset } => {
                                if let Err(e) = index.add(&id, &bytes, scale, offset) {
                                    tracing::warn!(%id, "index add failed: {}", e);
                                }
                            }
                            Command::AddBatch { items } => {
                                let _ = index.reserve(index.len() + items.len());
                                for (id, bytes, scale, offset) in items {
                                    if let Err(e) = index.add(&id, &bytes, scale, offset) {
                                        tracing::warn!(%id, "index add failed: {}", e);
                                    }
                                }
                            }
                            Command::Remove { id, reply } => {
                                let _ = reply.send(index.remove(&id));
                            }
                            Command::Contains { id, reply } => {
                                let _ = reply.send(index.contains(&id));
                            }
                            Command::Search { bytes, scale, offset, limit, reply } => {
                                let result = if index.len() < threshold {
                                    Err(IndexError::BelowThreshold {
                                        size: index.len(),
                                        threshold,
                                    })
                                } else {
                                    index.search(&bytes, scale, offset, limit)
                                };
                                let _ = reply.send(result);
                            }
                            Command::Save { reply } => {
                                let _ = reply.send(index.save(&path));
                            }
                            Command::Rebuild { reply } => {
                                let _ = reply.send(rebuild(&mut index, &store, dimensions));
                            }
                            Command::Stats { reply } => {
                                let snapshot = index.snapshot();
                                let _ = reply.send(IndexStats {
                                    size: snapshot.size,
                                    capacity: snapshot.capacity,
                                    dimensions: snapshot.dimensions,
                                    dirty: snapshot.dirty,
                                    last_saved_at: snapshot.last_saved_at,
                                    threshold,
                                    available: true,
                                });
                            }
                            Command::Shutdown { reply } => {
                                if index.dirty() {
                                    if let Err(e) = index.save(&path) {
                                        tracing::warn!("index save on shutdown failed: {}", e);
                                    }
                                }
                                let _ = reply.send(());
                                break;
                            }
                        }
                    }
                }
            }
        });

        IndexHandle {
            tx: Some(tx),
            threshold,
            dimensions,
        }
    }

    /// Without the vector-search feature the service never runs.
    #[cfg(not(feature = "vector-search"))]
    pub fn spawn(config: &MemoryConfig, _store: Arc<EngramStore>) -> IndexHandle {
        tracing::warn!("vector-search feature disabled, index unavailable");
        IndexHandle::unavailable(config.hnsw_threshold, config.dimensions)
    }
}

#[cfg(feature = "vector-search")]
fn rebuild(
    index: &mut super::VectorIndex,
    store: &EngramStore,
    dimensions: usize,
) -> Result<usize> {
    let mut fresh = super::VectorIndex::new(dimensions)?;
    let expected = store
        .count_live()
        .map_err(|e| IndexError::Mutation(e.to_string()))?;
    fresh.reserve(expected.max(16))?;

    let mut after = 0i64;
    let mut added = 0usize;
    loop {
        let chunk = store
            .rebuild_chunk(after, REBUILD_BATCH)
            .map_err(|e| IndexError::Mutation(e.to_string()))?;
        if chunk.is_empty() {
            break;
        }
        for (rowid, id, bytes, scale, offset) in chunk {
            after = rowid;
            if bytes.len() != dimensions {
                tracing::warn!(%id, "skipping row with unexpected dimensions");
                continue;
            }
            fresh.add(&id, &bytes, scale, offset)?;
            added += 1;
        }
        tracing::info!(added, "index rebuild progress");
    }

    *index = fresh;
    Ok(added)
}

// ============================================================================
// TESTS
// ============================================================================
