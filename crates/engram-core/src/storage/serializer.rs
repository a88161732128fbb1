//! Write Serializer
//!
//! Exactly one writer ever touches the substrate. SQLite-class engines
//! degrade badly under concurrent writers, so every mutation funnels
//! through this owner of the write connection. It is also the single
//! place for busy-retry with exponential backoff and for cross-row
//! invariant enforcement inside one transaction.
//!
//! Expensive work (embedding generation, LLM calls) must happen before
//! entering the serialized section; closures run here are expected to
//! complete in bounded time.

use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;

use super::{Result, StorageError};

/// Retry attempts on SQLITE_BUSY-class failures
const MAX_ATTEMPTS: u32 = 5;

/// First retry delay; doubles per attempt (100, 200, 400, 800 ms)
const BACKOFF_BASE_MS: u64 = 100;

/// Owns the write connection.
pub struct WriteSerializer {
    conn: Mutex<Connection>,
}

impl WriteSerializer {
    /// Take ownership of the write connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Run a write closure under the serializer with busy-retry.
    ///
    /// The closure may run more than once, so it must be idempotent up
    /// to its own statements (a failed attempt performs no partial
    /// writes when the closure is a single statement or a transaction).
    pub fn run<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Init("writer lock poisoned".to_string()))?;

        let mut attempt = 0u32;
        loop {
            match f(&conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(StorageError::Busy(format!(
                            "gave up after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    let delay = BACKOFF_BASE_MS << (attempt - 1);
                    tracing::warn!(attempt, delay_ms = delay, "substrate busy, retrying write");
                    std::thread::sleep(Duration::from_millis(delay));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run a write closure inside a transaction, with busy-retry around
    /// the whole transaction.
    pub fn transaction<T>(
        &self,
        f: impl Fn(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

// ============================================================================
// TESTS
// ============================================================================
