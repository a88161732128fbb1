//! Forgetting and Maintenance
//!
//! Forgetting is archive, never hard-delete, for anything that ever
//! mattered. Three sweeps run on an hourly cadence: TTL archival, live
//! cap enforcement, and validity-window expiration marking. Protected
//! rows are untouchable by every sweep.
//!
//! Database maintenance (ANALYZE daily with an optimizer pass, VACUUM
//! weekly, backup verification) is triggered from the background cycle
//! during idle, with its schedule persisted in a small state file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::MemoryConfig;
use crate::memory::VALIDITY_EXPIRED;
use crate::storage::{EngramStore, Result};
use crate::telemetry::Telemetry;

/// Importance below which the default TTL applies
const TTL_IMPORTANCE_CEILING: f32 = 0.7;

/// Importance below which the short TTL applies
const LOW_TTL_IMPORTANCE_CEILING: f32 = 0.5;

/// Rows marked per expiration batch
const EXPIRATION_BATCH: usize = 100;

// ============================================================================
// FORGETTER
// ============================================================================

/// Counts from one forgetting pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Rows archived by the TTL sweep
    pub ttl_archived: usize,
    /// Rows archived by cap enforcement
    pub cap_archived: usize,
    /// Rows marked expired
    pub expired_marked: usize,
}

/// The forgetting sweeps.
pub struct Forgetter {
    store: Arc<EngramStore>,
    config: MemoryConfig,
    telemetry: Telemetry,
}

impl Forgetter {
    /// Wire up over the store.
    pub fn new(store: Arc<EngramStore>, config: MemoryConfig, telemetry: Telemetry) -> Self {
        Self {
            store,
            config,
            telemetry,
        }
    }

    /// Run every sweep once.
    pub fn run_all(&self) -> Result<SweepReport> {
        let report = SweepReport {
            ttl_archived: self.run_ttl_sweep()?,
            cap_archived: self.run_cap_enforcement()?,
            expired_marked: self.run_expiration_sweep()?,
        };
        self.telemetry.emit(
            "forgetting_sweep",
            json!({
                "ttl_archived": report.ttl_archived,
                "cap_archived": report.cap_archived,
                "expired_marked": report.expired_marked,
            }),
            json!({}),
        );
        Ok(report)
    }

    /// Archive rows past their importance-dependent TTL. Protected
    /// rows are never touched.
    pub fn run_ttl_sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let default_cutoff = now - Duration::days(self.config.default_ttl_days);
        let low_cutoff = now - Duration::days(self.config.low_importance_ttl_days);

        let mut archived = self.store.write(|conn| {
            conn.execute(
                "UPDATE engrams SET archived = 1, updated_at = ?1
                 WHERE archived = 0 AND protected = 0
                   AND importance < ?2 AND created_at < ?3",
                params![now, TTL_IMPORTANCE_CEILING as f64, default_cutoff],
            )
        })?;

        archived += self.store.write(|conn| {
            conn.execute(
                "UPDATE engrams SET archived = 1, updated_at = ?1
                 WHERE archived = 0 AND protected = 0
                   AND importance < ?2 AND created_at < ?3",
                params![now, LOW_TTL_IMPORTANCE_CEILING as f64, low_cutoff],
            )
        })?;

        if archived > 0 {
            tracing::info!(archived, "ttl sweep archived rows");
        }
        Ok(archived)
    }

    /// Archive the oldest, least-important rows beyond the live cap.
    pub fn run_cap_enforcement(&self) -> Result<usize> {
        let live = self.store.count_live()?;
        if live <= self.config.max_count {
            return Ok(0);
        }
        let overflow = live - self.config.max_count;
        let now = Utc::now();

        let archived = self.store.write(|conn| {
            conn.execute(
                "UPDATE engrams SET archived = 1, updated_at = ?1
                 WHERE id IN (
                     SELECT id FROM engrams
                     WHERE archived = 0 AND protected = 0 AND superseded_at IS NULL
                     ORDER BY importance ASC, created_at ASC
                     LIMIT ?2
                 )",
                params![now, overflow as i64],
            )
        })?;
        tracing::info!(archived, live, "cap enforcement archived rows");
        Ok(archived)
    }

    /// Mark lapsed validity windows as expired, in batches. Marks only
    /// - expiration never archives.
    pub fn run_expiration_sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut total = 0;
        loop {
            let marked = self.store.write(|conn| {
                conn.execute(
                    "UPDATE engrams SET validity_source = ?1, updated_at = ?2
                     WHERE id IN (
                         SELECT id FROM engrams
                         WHERE valid_until < ?2 AND protected = 0
                           AND (validity_source IS NULL OR validity_source != ?1)
                         LIMIT ?3
                     )",
                    params![VALIDITY_EXPIRED, now, EXPIRATION_BATCH as i64],
                )
            })?;
            total += marked;
            if marked < EXPIRATION_BATCH {
                break;
            }
        }
        Ok(total)
    }
}

// ============================================================================
// DB MAINTENANCE
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MaintenanceState {
    last_analyze: Option<DateTime<Utc>>,
    last_vacuum: Option<DateTime<Utc>>,
    last_backup_check: Option<DateTime<Utc>>,
    last_synthesis: Option<DateTime<Utc>>,
}

/// Scheduled database upkeep with a JSON state file.
pub struct DbMaintenance {
    store: Arc<EngramStore>,
    state_path: PathBuf,
    backup_dir: PathBuf,
    state: Mutex<MaintenanceState>,
}

impl DbMaintenance {
    /// Load (or initialize) the maintenance state.
    pub fn new(store: Arc<EngramStore>, config: &MemoryConfig) -> Self {
        let state_path = config.maintenance_path();
        let state = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            store,
            state_path,
            backup_dir: config.backup_dir(),
            state: Mutex::new(state),
        }
    }

    fn persist(&self, state: &MaintenanceState) {
        match serde_json::to_string_pretty(state) {
            Ok(encoded) => {
                if let Err(e) = std::fs::write(&self.state_path, encoded) {
                    tracing::warn!("failed to persist maintenance state: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to encode maintenance state: {}", e),
        }
    }

    /// ANALYZE daily, followed by the optimizer pass. Returns whether
    /// it ran.
    pub fn maybe_analyze(&self) -> Result<bool> {
        let due = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .last_analyze
                .is_none_or(|at| Utc::now() - at >= Duration::days(1))
        };
        if !due {
            return Ok(false);
        }

        self.store.write(|conn| {
            conn.execute_batch("ANALYZE; PRAGMA optimize;")?;
            Ok(())
        })?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_analyze = Some(Utc::now());
        self.persist(&state);
        tracing::info!("analyze completed");
        Ok(true)
    }

    /// VACUUM weekly. Returns whether it ran.
    pub fn maybe_vacuum(&self) -> Result<bool> {
        let due = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .last_vacuum
                .is_none_or(|at| Utc::now() - at >= Duration::days(7))
        };
        if !due {
            return Ok(false);
        }

        self.store.write(|conn| {
            conn.execute_batch("VACUUM;")?;
            Ok(())
        })?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_vacuum = Some(Utc::now());
        self.persist(&state);
        tracing::info!("vacuum completed");
        Ok(true)
    }

    /// Verify the newest backup opens and passes a quick integrity
    /// check. Missing backups report false without erroring.
    pub fn verify_backup(&self) -> bool {
        let newest = std::fs::read_dir(&self.backup_dir)
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .max_by_key(|entry| {
                entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH)
            });

        let Some(entry) = newest else {
            tracing::debug!("no backups to verify");
            return false;
        };

        let ok = rusqlite::Connection::open_with_flags(
            entry.path(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .and_then(|conn| {
            conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
        })
        .map(|verdict| verdict == "ok")
        .unwrap_or(false);

        if ok {
            tracing::info!(path = %entry.path().display(), "backup verified");
        } else {
            tracing::warn!(path = %entry.path().display(), "backup failed verification");
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_backup_check = Some(Utc::now());
        self.persist(&state);
        ok
    }

    /// When knowledge synthesis last ran (for its daily cap).
    pub fn last_synthesis(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_synthesis
    }

    /// Record a knowledge synthesis run.
    pub fn record_synthesis(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_synthesis = Some(Utc::now());
        self.persist(&state);
    }
}

// ============================================================================
// TESTS
// ============================================================================
