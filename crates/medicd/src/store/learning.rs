//! Learning store: per-(signature, strategy) success statistics.
//!
//! Patterns are derived from fix_attempts, never edited directly. After
//! every appended attempt the pipeline calls `recompute`, which re-reads the
//! sliding window and overwrites the aggregate row. A replayed pattern's
//! window also holds the replays of it, so a fix that stops working loses
//! confidence as fast as it gained it.

use chrono::Utc;
use medic_common::{ActionKind, LearnedPattern, MedicError, MedicResult, Strategy};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{open_connection, parse_column, parse_optional_column, RetryPolicy};
use crate::config::StoreConfig;

const PATTERN_COLUMNS: &str =
    "signature, strategy, success_count, attempt_count, confidence, last_action, updated_at";

pub struct LearningStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl LearningStore {
    pub fn open(config: &StoreConfig) -> MedicResult<Self> {
        let conn = open_connection(&config.path, config.busy_timeout())?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::from_config(config),
        })
    }

    /// Open at a specific path (for testing or the CLI)
    pub fn open_at<P: AsRef<Path>>(path: P) -> MedicResult<Self> {
        let config = StoreConfig {
            path: path.as_ref().to_path_buf(),
            ..StoreConfig::default()
        };
        Self::open(&config)
    }

    fn lock(&self) -> MedicResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MedicError::Store("learning store mutex poisoned".to_string()))
    }

    /// Rebuild the aggregate for a key from its last `window` applied attempts,
    /// counting replays of the key's pattern alongside its own attempts.
    ///
    /// Returns `None` (and writes nothing) while the key has no applied
    /// attempts: a skipped stage carries no evidence about the strategy.
    pub fn recompute(
        &self,
        signature: &str,
        strategy: Strategy,
        window: usize,
    ) -> MedicResult<Option<LearnedPattern>> {
        self.retry.run("recompute_pattern", || {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let outcomes: Vec<(bool, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT success, action FROM fix_attempts
                     WHERE signature = ?1 AND applied = 1
                       AND (strategy = ?2 OR replay_of = ?2)
                     ORDER BY id DESC LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![signature, strategy.as_str(), window as i64],
                    |row| {
                        let success: Option<bool> = row.get(0)?;
                        Ok((success.unwrap_or(false), row.get(1)?))
                    },
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            if outcomes.is_empty() {
                return Ok(None);
            }

            let attempt_count = outcomes.len() as u32;
            let success_count = outcomes.iter().filter(|(ok, _)| *ok).count() as u32;
            let confidence = success_count as f64 / attempt_count as f64;

            // Newest first, so the first success is the latest working action.
            // Falls back to whatever was stored if it slid out of the window.
            let windowed_action = outcomes
                .iter()
                .find(|(ok, _)| *ok)
                .and_then(|(_, action)| action.as_deref())
                .map(|a| a.parse::<ActionKind>())
                .transpose()
                .map_err(MedicError::Store)?;
            let previous_action = tx
                .query_row(
                    "SELECT last_action FROM learned_patterns WHERE signature = ?1 AND strategy = ?2",
                    params![signature, strategy.as_str()],
                    |row| parse_optional_column(row, 0),
                )
                .optional()?
                .flatten();
            let last_action = windowed_action.or(previous_action);

            let pattern = LearnedPattern {
                signature: signature.to_string(),
                strategy,
                success_count,
                attempt_count,
                confidence,
                last_action,
                updated_at: Utc::now(),
            };

            tx.execute(
                "INSERT INTO learned_patterns
                    (signature, strategy, success_count, attempt_count, confidence, last_action, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(signature, strategy) DO UPDATE SET
                    success_count = excluded.success_count,
                    attempt_count = excluded.attempt_count,
                    confidence = excluded.confidence,
                    last_action = excluded.last_action,
                    updated_at = excluded.updated_at",
                params![
                    pattern.signature,
                    pattern.strategy.as_str(),
                    pattern.success_count,
                    pattern.attempt_count,
                    pattern.confidence,
                    pattern.last_action.map(|a| a.as_str()),
                    pattern.updated_at,
                ],
            )?;
            tx.commit()?;

            debug!(
                "Pattern {}/{}: {}/{} (confidence {:.2})",
                signature, strategy, success_count, attempt_count, confidence
            );
            Ok(Some(pattern))
        })
    }

    pub fn get(&self, signature: &str, strategy: Strategy) -> MedicResult<Option<LearnedPattern>> {
        self.retry.run("get_pattern", || {
            let conn = self.lock()?;
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {PATTERN_COLUMNS} FROM learned_patterns WHERE signature = ?1 AND strategy = ?2"
                    ),
                    params![signature, strategy.as_str()],
                    pattern_from_row,
                )
                .optional()?)
        })
    }

    /// Highest-confidence pattern for a signature that has a replayable action
    pub fn best_for(&self, signature: &str) -> MedicResult<Option<LearnedPattern>> {
        self.retry.run("best_pattern", || {
            let conn = self.lock()?;
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {PATTERN_COLUMNS} FROM learned_patterns
                         WHERE signature = ?1 AND last_action IS NOT NULL
                         ORDER BY confidence DESC, attempt_count DESC, updated_at DESC
                         LIMIT 1"
                    ),
                    params![signature],
                    pattern_from_row,
                )
                .optional()?)
        })
    }

    /// All patterns, best first, optionally for one signature
    pub fn list(&self, signature: Option<&str>) -> MedicResult<Vec<LearnedPattern>> {
        let signature = signature.map(str::to_string);
        self.retry.run("list_patterns", || {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {PATTERN_COLUMNS} FROM learned_patterns
                 WHERE ?1 IS NULL OR signature = ?1
                 ORDER BY signature ASC, confidence DESC"
            ))?;
            let rows = stmt.query_map(params![signature], pattern_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<LearnedPattern> {
    Ok(LearnedPattern {
        signature: row.get(0)?,
        strategy: parse_column(row, 1)?,
        success_count: row.get(2)?,
        attempt_count: row.get(3)?,
        confidence: row.get(4)?,
        last_action: parse_optional_column(row, 5)?,
        updated_at: row.get(6)?,
    })
}
