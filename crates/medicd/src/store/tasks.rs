//! Task store: the single source of truth for task lifecycles and attempts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use medic_common::{
    canonicalize, classify_signature, FixAttempt, Issue, MedicError, MedicResult, NewFixAttempt,
    Task, TaskStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{open_connection, parse_column, parse_optional_column, RetryPolicy};
use crate::config::StoreConfig;

const TASK_COLUMNS: &str = "id, issue_hash, kind, subject, signature, message, first_seen_at, \
     last_seen_at, detection_count, status, fix_attempt_count, last_attempt_at, escalation_ref, \
     closed_at, resolution";

const ATTEMPT_COLUMNS: &str = "id, task_id, subject, signature, timestamp, strategy, action, \
     applied, success, confidence, error_signature, rationale, replay_of";

/// Outcome of folding an issue into the store
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub task_id: i64,
    /// A new task row was created
    pub is_new: bool,
    pub status: TaskStatus,
    /// The hash belongs to a closed task and the issue came back
    pub regression: bool,
}

/// SQLite-backed task store
pub struct TaskStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
    reopen_after: Option<ChronoDuration>,
}

impl TaskStore {
    /// Open the store described by the config
    pub fn open(config: &StoreConfig) -> MedicResult<Self> {
        let conn = open_connection(&config.path, config.busy_timeout())?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::from_config(config),
            reopen_after: config.reopen_after(),
        })
    }

    /// Open at a specific path with default settings (for testing or the CLI)
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
            .map_err(|_| MedicError::Store("task store mutex poisoned".to_string()))
    }

    /// Fold an issue into its task: insert-or-return-existing, atomically.
    ///
    /// - open task with this hash: bump detection metadata, return it
    /// - latest task closed: regression, stays closed unless the reopen
    ///   window elapsed, in which case a fresh task is created
    /// - nothing: create a task in `detected`
    pub fn upsert(&self, issue: &Issue) -> MedicResult<Upserted> {
        let hash = canonicalize(issue);
        let reopen_after = self.reopen_after;
        self.retry.run("upsert", || {
            let mut conn = self.lock()?;
            upsert_tx(&mut conn, issue, &hash, reopen_after)
        })
    }

    /// Get a task by id
    pub fn get(&self, id: i64) -> MedicResult<Task> {
        self.retry.run("get_task", || {
            let conn = self.lock()?;
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()?
            .ok_or(MedicError::TaskNotFound(id))
        })
    }

    /// Latest task for a dedup hash, open or closed
    pub fn find_by_hash(&self, issue_hash: &str) -> MedicResult<Option<Task>> {
        self.retry.run("find_by_hash", || {
            let conn = self.lock()?;
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE issue_hash = ?1 ORDER BY id DESC LIMIT 1"
                    ),
                    params![issue_hash],
                    task_from_row,
                )
                .optional()?)
        })
    }

    /// Number of rows for a hash, closed ones included
    pub fn count_by_hash(&self, issue_hash: &str) -> MedicResult<u64> {
        self.retry.run("count_by_hash", || {
            let conn = self.lock()?;
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE issue_hash = ?1",
                params![issue_hash],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// List tasks, newest first, optionally filtered
    pub fn list(&self, status: Option<TaskStatus>, subject: Option<&str>) -> MedicResult<Vec<Task>> {
        let status = status.map(|s| s.as_str().to_string());
        let subject = subject.map(str::to_string);
        self.retry.run("list_tasks", || {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR subject = ?2)
                 ORDER BY id DESC"
            ))?;
            let rows = stmt.query_map(params![status, subject], task_from_row)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row?);
            }
            Ok(tasks)
        })
    }

    /// Task counts per status
    pub fn counts_by_status(&self) -> MedicResult<Vec<(TaskStatus, u64)>> {
        self.retry.run("counts_by_status", || {
            let conn = self.lock()?;
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((parse_column::<TaskStatus>(row, 0)?, row.get::<_, i64>(1)? as u64))
            })?;
            let mut counts: Vec<(TaskStatus, u64)> =
                TaskStatus::all().iter().map(|s| (*s, 0)).collect();
            for row in rows {
                let (status, n) = row?;
                if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                    entry.1 = n;
                }
            }
            Ok(counts)
        })
    }

    /// Move a task along the automatic state machine
    pub fn transition(&self, id: i64, to: TaskStatus) -> MedicResult<Task> {
        self.apply_transition(id, to, TransitionExtras::default())
    }

    /// Mark an attempted task escalated, recording the notification reference
    pub fn escalate(&self, id: i64, escalation_ref: Option<&str>) -> MedicResult<Task> {
        self.apply_transition(
            id,
            TaskStatus::Escalated,
            TransitionExtras {
                escalation_ref,
                ..Default::default()
            },
        )
    }

    /// Close a verified-fixed task
    pub fn close(&self, id: i64, resolution: &str) -> MedicResult<Task> {
        self.apply_transition(
            id,
            TaskStatus::Closed,
            TransitionExtras {
                resolution: Some(resolution),
                ..Default::default()
            },
        )
    }

    /// Human override: escalate regardless of the automatic edge rules.
    ///
    /// `escalation_ref` is the reference of the notification sent for it.
    pub fn force_escalate(&self, id: i64, escalation_ref: &str) -> MedicResult<Task> {
        self.apply_transition(
            id,
            TaskStatus::Escalated,
            TransitionExtras {
                forced: true,
                escalation_ref: Some(escalation_ref),
                ..Default::default()
            },
        )
    }

    fn apply_transition(
        &self,
        id: i64,
        to: TaskStatus,
        extras: TransitionExtras<'_>,
    ) -> MedicResult<Task> {
        self.retry.run("transition", || {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let from: TaskStatus = tx
                .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |row| {
                    parse_column(row, 0)
                })
                .optional()?
                .ok_or(MedicError::TaskNotFound(id))?;

            let allowed = if extras.forced {
                from.can_force_to(to)
            } else {
                from.can_transition_to(to)
            };
            if !allowed {
                return Err(MedicError::InvalidTransition { task_id: id, from, to });
            }

            let now = Utc::now();
            let closed_at = (to == TaskStatus::Closed).then_some(now);
            tx.execute(
                "UPDATE tasks SET
                    status = ?2,
                    closed_at = COALESCE(?3, closed_at),
                    resolution = COALESCE(?4, resolution),
                    escalation_ref = COALESCE(?5, escalation_ref)
                 WHERE id = ?1",
                params![id, to.as_str(), closed_at, extras.resolution, extras.escalation_ref],
            )?;
            let task = tx.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )?;
            tx.commit()?;

            match (from, to) {
                (TaskStatus::Escalated, TaskStatus::Attempted) => {
                    info!("Task {} de-escalated ({}): escalated -> attempted", id, task.subject)
                }
                (a, b) if a != b => info!("Task {} ({}): {} -> {}", id, task.subject, a, b),
                _ => debug!("Task {} stays {}", id, to),
            }
            Ok(task)
        })
    }

    /// Append an attempt and bump the owning task's attempt metadata.
    ///
    /// Only the remediation pipeline writes attempts.
    pub(crate) fn append_attempt(&self, attempt: &NewFixAttempt) -> MedicResult<FixAttempt> {
        self.retry.run("append_attempt", || {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();
            tx.execute(
                "INSERT INTO fix_attempts
                    (task_id, subject, signature, timestamp, strategy, action, applied, success,
                     confidence, error_signature, rationale, replay_of)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    attempt.task_id,
                    attempt.subject,
                    attempt.signature,
                    now,
                    attempt.strategy.as_str(),
                    attempt.action.map(|a| a.as_str()),
                    attempt.applied,
                    attempt.success,
                    attempt.confidence,
                    attempt.error_signature,
                    attempt.rationale,
                    attempt.replay_of.map(|s| s.as_str()),
                ],
            )?;
            let id = tx.last_insert_rowid();
            let updated = tx.execute(
                "UPDATE tasks SET fix_attempt_count = fix_attempt_count + 1, last_attempt_at = ?2
                 WHERE id = ?1",
                params![attempt.task_id, now],
            )?;
            if updated == 0 {
                return Err(MedicError::TaskNotFound(attempt.task_id));
            }
            tx.commit()?;

            Ok(FixAttempt {
                id,
                task_id: attempt.task_id,
                subject: attempt.subject.clone(),
                signature: attempt.signature.clone(),
                timestamp: now,
                strategy: attempt.strategy,
                action: attempt.action,
                applied: attempt.applied,
                success: attempt.success,
                confidence: attempt.confidence,
                error_signature: attempt.error_signature.clone(),
                rationale: attempt.rationale.clone(),
                replay_of: attempt.replay_of,
            })
        })
    }

    /// All attempts for a task, oldest first
    pub fn attempts_for_task(&self, task_id: i64) -> MedicResult<Vec<FixAttempt>> {
        self.query_attempts(
            "attempts_for_task",
            &format!("SELECT {ATTEMPT_COLUMNS} FROM fix_attempts WHERE task_id = ?1 ORDER BY id ASC"),
            params![task_id],
        )
    }

    /// The latest `limit` attempts for a subject, newest first
    pub fn recent_attempts_for_subject(
        &self,
        subject: &str,
        limit: usize,
    ) -> MedicResult<Vec<FixAttempt>> {
        self.query_attempts(
            "recent_attempts_for_subject",
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM fix_attempts WHERE subject = ?1 ORDER BY id DESC LIMIT ?2"
            ),
            params![subject, limit as i64],
        )
    }

    /// Attempts on a task that did not end in a verified fix
    pub fn unsuccessful_attempt_count(&self, task_id: i64) -> MedicResult<u32> {
        self.retry.run("unsuccessful_attempt_count", || {
            let conn = self.lock()?;
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM fix_attempts WHERE task_id = ?1 AND (success IS NULL OR success = 0)",
                params![task_id],
                |row| row.get(0),
            )?;
            Ok(n as u32)
        })
    }

    fn query_attempts(
        &self,
        operation: &str,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> MedicResult<Vec<FixAttempt>> {
        self.retry.run(operation, || {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, attempt_from_row)?;
            let mut attempts = Vec::new();
            for row in rows {
                attempts.push(row?);
            }
            Ok(attempts)
        })
    }

    /// Delete closed tasks (and their attempts) closed before `older_than`
    pub fn prune_closed(&self, older_than: DateTime<Utc>) -> MedicResult<usize> {
        self.retry.run("prune_closed", || {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM fix_attempts WHERE task_id IN
                    (SELECT id FROM tasks WHERE status = 'closed' AND closed_at < ?1)",
                params![older_than],
            )?;
            let deleted = tx.execute(
                "DELETE FROM tasks WHERE status = 'closed' AND closed_at < ?1",
                params![older_than],
            )?;
            tx.commit()?;
            if deleted > 0 {
                info!("Pruned {} closed tasks older than {}", deleted, older_than);
            }
            Ok(deleted)
        })
    }
}

#[derive(Default)]
struct TransitionExtras<'a> {
    forced: bool,
    resolution: Option<&'a str>,
    escalation_ref: Option<&'a str>,
}

fn upsert_tx(
    conn: &mut Connection,
    issue: &Issue,
    hash: &str,
    reopen_after: Option<ChronoDuration>,
) -> MedicResult<Upserted> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = Utc::now();

    let latest: Option<(i64, TaskStatus, Option<DateTime<Utc>>)> = tx
        .query_row(
            "SELECT id, status, closed_at FROM tasks WHERE issue_hash = ?1 ORDER BY id DESC LIMIT 1",
            params![hash],
            |row| Ok((row.get(0)?, parse_column(row, 1)?, row.get(2)?)),
        )
        .optional()?;

    let outcome = match latest {
        Some((id, status, _)) if status.is_open() => {
            tx.execute(
                "UPDATE tasks SET last_seen_at = ?2, detection_count = detection_count + 1, message = ?3
                 WHERE id = ?1",
                params![id, issue.observed_at.max(now), issue.message],
            )?;
            debug!("Issue on {} folded into task {} ({})", issue.subject, id, status);
            Upserted {
                task_id: id,
                is_new: false,
                status,
                regression: false,
            }
        }
        Some((id, status, closed_at)) => {
            let window_elapsed = match (reopen_after, closed_at) {
                (Some(window), Some(closed)) => now - closed >= window,
                _ => false,
            };
            if window_elapsed {
                warn!(
                    "Regression on {}: task {} closed at {:?} reappeared, opening a new task",
                    issue.subject, id, closed_at
                );
                let new_id = insert_task(&tx, issue, hash, now)?;
                Upserted {
                    task_id: new_id,
                    is_new: true,
                    status: TaskStatus::Detected,
                    regression: true,
                }
            } else {
                warn!(
                    "Regression on {}: task {} is closed, leaving it closed",
                    issue.subject, id
                );
                Upserted {
                    task_id: id,
                    is_new: false,
                    status,
                    regression: true,
                }
            }
        }
        None => {
            let id = insert_task(&tx, issue, hash, now)?;
            info!("New task {} for {} ({})", id, issue.subject, issue.kind);
            Upserted {
                task_id: id,
                is_new: true,
                status: TaskStatus::Detected,
                regression: false,
            }
        }
    };

    tx.commit()?;
    Ok(outcome)
}

fn insert_task(
    tx: &rusqlite::Transaction<'_>,
    issue: &Issue,
    hash: &str,
    now: DateTime<Utc>,
) -> MedicResult<i64> {
    let signature = classify_signature(issue.kind, &issue.message);
    tx.execute(
        "INSERT INTO tasks
            (issue_hash, kind, subject, signature, message, first_seen_at, last_seen_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
        params![
            hash,
            issue.kind.as_str(),
            issue.subject,
            signature,
            issue.message,
            now,
            TaskStatus::Detected.as_str(),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        issue_hash: row.get(1)?,
        kind: parse_column(row, 2)?,
        subject: row.get(3)?,
        signature: row.get(4)?,
        message: row.get(5)?,
        first_seen_at: row.get(6)?,
        last_seen_at: row.get(7)?,
        detection_count: row.get(8)?,
        status: parse_column(row, 9)?,
        fix_attempt_count: row.get(10)?,
        last_attempt_at: row.get(11)?,
        escalation_ref: row.get(12)?,
        closed_at: row.get(13)?,
        resolution: row.get(14)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<FixAttempt> {
    Ok(FixAttempt {
        id: row.get(0)?,
        task_id: row.get(1)?,
        subject: row.get(2)?,
        signature: row.get(3)?,
        timestamp: row.get(4)?,
        strategy: parse_column(row, 5)?,
        action: parse_optional_column(row, 6)?,
        applied: row.get(7)?,
        success: row.get(8)?,
        confidence: row.get(9)?,
        error_signature: row.get(10)?,
        rationale: row.get(11)?,
        replay_of: parse_optional_column(row, 12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use medic_common::{ActionKind, IssueKind, Strategy};
    use std::sync::Arc;

    fn test_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open_at(dir.path().join("medic.db")).unwrap();
        (dir, store)
    }

    fn dns_issue(pid: u32) -> Issue {
        Issue::new(
            "containers",
            IssueKind::ContainerCrash,
            "api",
            format!("api[{pid}]: lookup db on 127.0.0.11:53: no such host"),
        )
    }

    #[test]
    fn test_upsert_creates_then_folds() {
        let (_dir, store) = test_store();

        let first = store.upsert(&dns_issue(10)).unwrap();
        assert!(first.is_new);
        assert_eq!(first.status, TaskStatus::Detected);

        for pid in 11..20 {
            let again = store.upsert(&dns_issue(pid)).unwrap();
            assert!(!again.is_new);
            assert_eq!(again.task_id, first.task_id);
        }

        let hash = canonicalize(&dns_issue(1));
        assert_eq!(store.count_by_hash(&hash).unwrap(), 1);

        let task = store.get(first.task_id).unwrap();
        assert_eq!(task.detection_count, 10);
        assert_eq!(task.signature, "docker_dns_failure");
        assert!(task.message.contains("api[19]"));
    }

    #[test]
    fn test_closed_task_is_not_resurrected() {
        let (_dir, store) = test_store();
        let created = store.upsert(&dns_issue(1)).unwrap();
        store.close(created.task_id, "verified").unwrap();

        let again = store.upsert(&dns_issue(2)).unwrap();
        assert!(again.regression);
        assert!(!again.is_new);
        assert_eq!(again.task_id, created.task_id);
        assert_eq!(store.get(created.task_id).unwrap().status, TaskStatus::Closed);
    }

    #[test]
    fn test_reopen_after_window_creates_new_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medic.db");
        let store = TaskStore::open_at(&path).unwrap();
        let created = store.upsert(&dns_issue(1)).unwrap();
        store.close(created.task_id, "verified").unwrap();

        // Pretend the closure happened two days ago
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET closed_at = ?2 WHERE id = ?1",
                params![created.task_id, Utc::now() - ChronoDuration::hours(48)],
            )
            .unwrap();
        }

        let reopened = store.upsert(&dns_issue(2)).unwrap();
        assert!(reopened.is_new);
        assert!(reopened.regression);
        assert_ne!(reopened.task_id, created.task_id);
        assert_eq!(store.get(created.task_id).unwrap().status, TaskStatus::Closed);
    }

    #[test]
    fn test_reopen_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("medic.db"),
            reopen_after_hours: 0,
            ..StoreConfig::default()
        };
        let store = TaskStore::open(&config).unwrap();
        let created = store.upsert(&dns_issue(1)).unwrap();
        store.close(created.task_id, "verified").unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET closed_at = ?2 WHERE id = ?1",
                params![created.task_id, Utc::now() - ChronoDuration::days(365)],
            )
            .unwrap();
        }
        let again = store.upsert(&dns_issue(2)).unwrap();
        assert!(!again.is_new);
        assert_eq!(again.task_id, created.task_id);
    }

    #[test]
    fn test_transitions_are_validated() {
        let (_dir, store) = test_store();
        let id = store.upsert(&dns_issue(1)).unwrap().task_id;

        // detected -> escalated is not an automatic edge
        let err = store.escalate(id, Some("esc-1")).unwrap_err();
        assert!(matches!(err, MedicError::InvalidTransition { .. }));

        store.transition(id, TaskStatus::Attempted).unwrap();
        let escalated = store.escalate(id, Some("esc-1")).unwrap();
        assert_eq!(escalated.status, TaskStatus::Escalated);
        assert_eq!(escalated.escalation_ref.as_deref(), Some("esc-1"));

        let back = store.transition(id, TaskStatus::Attempted).unwrap();
        assert_eq!(back.status, TaskStatus::Attempted);
        // reference survives de-escalation for the audit trail
        assert_eq!(back.escalation_ref.as_deref(), Some("esc-1"));

        let closed = store.close(id, "fixed").unwrap();
        assert!(closed.closed_at.is_some());
        assert!(store.transition(id, TaskStatus::Attempted).is_err());
        assert!(store.transition(id, TaskStatus::Detected).is_err());
    }

    #[test]
    fn test_force_escalate_from_detected() {
        let (_dir, store) = test_store();
        let id = store.upsert(&dns_issue(1)).unwrap().task_id;
        let task = store.force_escalate(id, "medic-1234").unwrap();
        assert_eq!(task.status, TaskStatus::Escalated);
        assert_eq!(task.escalation_ref.as_deref(), Some("medic-1234"));
        // Still open: nothing resolved it
        assert!(task.resolution.is_none());
        assert!(task.closed_at.is_none());

        let id = store.upsert(&dns_issue(2)).unwrap().task_id;
        store.close(id, "verified_fixed").unwrap();
        assert!(matches!(
            store.force_escalate(id, "medic-5678"),
            Err(MedicError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unknown_task() {
        let (_dir, store) = test_store();
        assert!(matches!(store.get(99), Err(MedicError::TaskNotFound(99))));
        assert!(matches!(
            store.transition(99, TaskStatus::Attempted),
            Err(MedicError::TaskNotFound(99))
        ));
    }

    #[test]
    fn test_append_attempt_updates_task() {
        let (_dir, store) = test_store();
        let id = store.upsert(&dns_issue(1)).unwrap().task_id;
        let task = store.get(id).unwrap();

        let attempt = store
            .append_attempt(&NewFixAttempt::applied(
                &task,
                Strategy::SingleOracle,
                ActionKind::RestartContainer,
                0.8,
                false,
            ))
            .unwrap();
        assert_eq!(attempt.task_id, id);
        store
            .append_attempt(&NewFixAttempt::skipped(&task, Strategy::ResearchFallback, 0.2))
            .unwrap();

        let task = store.get(id).unwrap();
        assert_eq!(task.fix_attempt_count, 2);
        assert!(task.last_attempt_at.is_some());

        let attempts = store.attempts_for_task(id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].action, Some(ActionKind::RestartContainer));
        assert_eq!(attempts[1].success, None);
        assert_eq!(store.unsuccessful_attempt_count(id).unwrap(), 2);

        let recent = store.recent_attempts_for_subject("api", 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].strategy, Strategy::ResearchFallback);
    }

    #[test]
    fn test_concurrent_upserts_create_one_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medic.db");
        // Two independent connections, like two processes sharing the file
        let a = Arc::new(TaskStore::open_at(&path).unwrap());
        let b = Arc::new(TaskStore::open_at(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
                std::thread::spawn(move || store.upsert(&dns_issue(i)).unwrap())
            })
            .collect();
        let results: Vec<Upserted> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let first_id = results[0].task_id;
        assert!(results.iter().all(|r| r.task_id == first_id));
        assert_eq!(results.iter().filter(|r| r.is_new).count(), 1);
        assert_eq!(a.count_by_hash(&canonicalize(&dns_issue(0))).unwrap(), 1);
    }

    #[test]
    fn test_counts_and_prune() {
        let (_dir, store) = test_store();
        let a = store.upsert(&dns_issue(1)).unwrap().task_id;
        let b = store
            .upsert(&Issue::new("svc", IssueKind::ServiceFailure, "nginx", "nginx.service failed"))
            .unwrap()
            .task_id;
        store.close(a, "fixed").unwrap();

        let counts = store.counts_by_status().unwrap();
        let get = |s: TaskStatus| counts.iter().find(|(st, _)| *st == s).unwrap().1;
        assert_eq!(get(TaskStatus::Closed), 1);
        assert_eq!(get(TaskStatus::Detected), 1);
        assert_eq!(get(TaskStatus::Escalated), 0);

        let pruned = store.prune_closed(Utc::now() + ChronoDuration::minutes(1)).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get(a).is_err());
        assert!(store.get(b).is_ok());
        assert_eq!(store.list(None, None).unwrap().len(), 1);
        assert_eq!(store.list(Some(TaskStatus::Detected), Some("nginx")).unwrap().len(), 1);
        assert!(store.list(Some(TaskStatus::Detected), Some("api")).unwrap().is_empty());
    }
}
