//! Error taxonomy shared by the daemon and the CLI.

use thiserror::Error;

use crate::types::TaskStatus;

#[derive(Error, Debug)]
pub enum MedicError {
    #[error("Store error: {0}")]
    Store(String),

    /// The store stayed busy for the whole configured wait. The orchestrator
    /// itself is impaired when this happens.
    #[error("Store contention: gave up after {waited_ms}ms ({operation})")]
    StoreContention { operation: String, waited_ms: u64 },

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl MedicError {
    /// True when the underlying SQLite error means another writer holds the lock.
    pub fn is_busy(&self) -> bool {
        match self {
            MedicError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Errors that mean the orchestrator itself is impaired and an operator
    /// should be paged, as opposed to the monitored fleet misbehaving.
    pub fn is_critical(&self) -> bool {
        matches!(self, MedicError::StoreContention { .. })
    }
}

pub type MedicResult<T> = Result<T, MedicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_classification() {
        let busy = MedicError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ));
        assert!(busy.is_busy());

        let other = MedicError::Store("disk gone".to_string());
        assert!(!other.is_busy());
    }

    #[test]
    fn test_contention_is_critical() {
        let err = MedicError::StoreContention {
            operation: "upsert".to_string(),
            waited_ms: 30_000,
        };
        assert!(err.is_critical());
        assert!(err.to_string().contains("30000ms"));
        assert!(!MedicError::TaskNotFound(3).is_critical());
    }
}
