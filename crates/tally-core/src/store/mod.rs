//! `SQLite`-backed durable store.
//!
//! The engine pushes all synchronization to the store: every check-then-act
//! span (guarded debit, referral-edge creation, invitation redemption) runs
//! inside a `BEGIN IMMEDIATE` transaction, which takes the write lock before
//! the first read so two concurrent spans on the same connection family
//! serialize instead of both passing their check.
//!
//! WAL mode keeps reads concurrent with writes. Reads that still hit a busy
//! database are retried with bounded backoff; writes are never auto-retried,
//! because a retried write whose commit outcome is unknown could grant
//! credits twice. They surface [`StoreError::Busy`] and the caller decides.

// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::warn;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Default `SQLite` busy timeout applied to every connection.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 2_000;

/// Default number of attempts for a busy read before giving up.
const DEFAULT_READ_ATTEMPTS: u32 = 3;

/// Default backoff between busy-read attempts.
const DEFAULT_READ_BACKOFF_MS: u64 = 25;

/// Errors surfaced by the store layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read stayed busy through every retry attempt.
    #[error("database busy after {attempts} read attempts")]
    Busy {
        /// How many attempts were made before giving up.
        attempts: u32,
    },
}

impl StoreError {
    /// Whether this error is a transient lock/busy condition.
    ///
    /// Callers may retry reads on retryable errors. Writes must not be
    /// blindly retried; their commit outcome is unknown.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Busy { .. } => true,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Retry tuning for busy reads.
#[derive(Debug, Clone, Copy)]
pub struct RetryTuning {
    /// Total read attempts before surfacing [`StoreError::Busy`].
    pub read_attempts: u32,
    /// Backoff between attempts (multiplied by the attempt number).
    pub read_backoff: Duration,
    /// `SQLite` busy timeout per statement.
    pub busy_timeout: Duration,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            read_attempts: DEFAULT_READ_ATTEMPTS,
            read_backoff: Duration::from_millis(DEFAULT_READ_BACKOFF_MS),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

/// The durable relational store backing the engine.
///
/// Holds a single `SQLite` connection behind a mutex. Horizontally-scaled
/// deployments open one `Store` per process against the same WAL database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
    tuning: RetryTuning,
}

impl Store {
    /// Opens or creates a store at the specified path.
    ///
    /// The schema is created on first open; WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(path, RetryTuning::default())
    }

    /// Opens a store with explicit retry tuning.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open_with(path: impl AsRef<Path>, tuning: RetryTuning) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Self::initialize_connection(&conn, tuning)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            tuning,
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let tuning = RetryTuning::default();
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn, tuning)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            tuning,
        })
    }

    /// Initialize the connection with schema and pragmas.
    fn initialize_connection(conn: &Connection, tuning: RetryTuning) -> Result<(), StoreError> {
        conn.busy_timeout(tuning.busy_timeout)?;
        // Execute schema (includes PRAGMA statements)
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Runs a read closure, retrying transient busy errors with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Busy`] after the retry budget is spent, or the
    /// closure's error unchanged when it is not retryable.
    pub fn read<T>(
        &self,
        mut f: impl FnMut(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt: u32 = 0;
        loop {
            let result = {
                let conn = self.conn.lock().unwrap();
                f(&conn)
            };
            match result {
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.tuning.read_attempts {
                        return Err(StoreError::Busy { attempts: attempt });
                    }
                    warn!(attempt, error = %err, "store read busy, backing off");
                    std::thread::sleep(self.tuning.read_backoff * attempt);
                }
                other => return other,
            }
        }
    }

    /// Runs a single-statement write closure. Not retried.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error; busy conditions surface as retryable
    /// [`StoreError`] values for the caller to handle.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Runs a closure inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken before the closure's first read, so a
    /// check-then-act span cannot interleave with another writer. The
    /// transaction commits on `Ok` and rolls back on `Err`.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error after rollback; commit failures map
    /// through `E::from(StoreError)`.
    pub fn write_tx<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| E::from(StoreError::from(e)))?;

        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(|e| E::from(StoreError::from(e)))?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls back; make it explicit.
                let _ = tx.rollback();
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}

/// Returns the current time as unix milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
