//! SQLite persistence for tasks, fix attempts and learned patterns.
//!
//! Schema:
//! - tasks: one row per deduplicated problem (at most one open row per hash)
//! - fix_attempts: append-only history, guarded by an UPDATE trigger
//! - learned_patterns: sliding-window aggregates per (signature, strategy)
//!
//! Each store owns its own connection behind a mutex held for one statement
//! or transaction. Connections use WAL and a long busy timeout because the
//! worker pool always contends for the write lock. Async callers go through
//! [`blocking`] so a busy wait parks a blocking-pool thread, not a runtime
//! worker.

mod learning;
mod tasks;

pub use learning::LearningStore;
pub use tasks::{TaskStore, Upserted};

use medic_common::{MedicError, MedicResult};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::config::StoreConfig;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_hash TEXT NOT NULL,
    kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    signature TEXT NOT NULL,
    message TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    detection_count INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL,
    fix_attempt_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    escalation_ref TEXT,
    closed_at TEXT,
    resolution TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_open_hash
    ON tasks(issue_hash) WHERE status != 'closed';
CREATE INDEX IF NOT EXISTS idx_tasks_hash ON tasks(issue_hash, id);
CREATE INDEX IF NOT EXISTS idx_tasks_subject ON tasks(subject);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS fix_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    subject TEXT NOT NULL,
    signature TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    strategy TEXT NOT NULL,
    action TEXT,
    applied INTEGER NOT NULL,
    success INTEGER,
    confidence REAL NOT NULL,
    error_signature TEXT,
    rationale TEXT,
    replay_of TEXT
);

CREATE INDEX IF NOT EXISTS idx_attempts_subject ON fix_attempts(subject, id);
CREATE INDEX IF NOT EXISTS idx_attempts_key ON fix_attempts(signature, strategy, id);
CREATE INDEX IF NOT EXISTS idx_attempts_task ON fix_attempts(task_id, id);

CREATE TRIGGER IF NOT EXISTS fix_attempts_append_only
BEFORE UPDATE ON fix_attempts
BEGIN
    SELECT RAISE(ABORT, 'fix_attempts are append-only');
END;

CREATE TABLE IF NOT EXISTS learned_patterns (
    signature TEXT NOT NULL,
    strategy TEXT NOT NULL,
    success_count INTEGER NOT NULL,
    attempt_count INTEGER NOT NULL,
    confidence REAL NOT NULL,
    last_action TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (signature, strategy)
);
"#;

/// Run a store operation on tokio's blocking pool.
pub async fn blocking<S, T, F>(store: &Arc<S>, op: F) -> MedicResult<T>
where
    S: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> MedicResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| MedicError::Store(format!("store task failed: {}", e)))?
}

/// Open a connection with the pragmas every medic connection needs.
pub(crate) fn open_connection(path: &Path, busy_timeout: Duration) -> MedicResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;",
    )?;
    conn.execute_batch(SCHEMA)?;
    migrate(&conn)?;
    Ok(conn)
}

/// Bring databases created by older releases up to the current schema
fn migrate(conn: &Connection) -> MedicResult<()> {
    let has_replay_of = conn
        .prepare("SELECT 1 FROM pragma_table_info('fix_attempts') WHERE name = 'replay_of'")?
        .exists([])?;
    if !has_replay_of {
        conn.execute_batch("ALTER TABLE fix_attempts ADD COLUMN replay_of TEXT")?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_attempts_replay ON fix_attempts(signature, replay_of, id)",
    )?;
    Ok(())
}

/// Retries statements that still come back busy after the connection's own
/// busy handler gave up (e.g. a deferred transaction losing a WAL snapshot).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First sleep; doubles on every retry
    pub initial_backoff: Duration,
    /// Total time spent retrying before giving up
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.retry_backoff_ms.max(1)),
            max_wait: config.busy_timeout(),
        }
    }

    /// Run `op`, retrying busy failures with exponential backoff.
    ///
    /// Exhaustion is logged as critical: it means medic itself is impaired.
    pub fn run<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> MedicResult<T>,
    ) -> MedicResult<T> {
        let started = Instant::now();
        let mut backoff = self.initial_backoff;
        loop {
            match op() {
                Err(e) if e.is_busy() => {
                    let waited = started.elapsed();
                    if waited + backoff > self.max_wait {
                        let waited_ms = waited.as_millis() as u64;
                        error!(
                            critical = true,
                            operation,
                            waited_ms,
                            "Store contention exhausted retry budget: {}",
                            e
                        );
                        return Err(MedicError::StoreContention {
                            operation: operation.to_string(),
                            waited_ms,
                        });
                    }
                    warn!("Store busy during {}, retrying in {:?}", operation, backoff);
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Read a text column into one of the string enums.
pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::<dyn std::error::Error + Send + Sync>::from(e))
    })
}

/// Same as `parse_column` for nullable columns.
pub(crate) fn parse_optional_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        t.parse::<T>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::<dyn std::error::Error + Send + Sync>::from(e))
        })
    })
    .transpose()
}
