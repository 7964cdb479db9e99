//! Remediation pipeline tests
//!
//! Stores are real SQLite files in a tempdir; oracles, research and the
//! executor are fakes, so nothing touches the network or systemd.

use approx::assert_relative_eq;
use medic_common::{ActionKind, Issue, IssueKind, Strategy, TaskStatus};
use medicd::actions::FakeExecutor;
use medicd::config::{PipelineConfig, RunbookEntry};
use medicd::oracle::{DiagnosisOracle, FakeOracle};
use medicd::pipeline::{record_manual_resolution, Pipeline, BUDGET_EXCEEDED, ORACLE_UNAVAILABLE};
use medicd::research::{ResearchSource, RunbookSource};
use medicd::store::{LearningStore, TaskStore};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

struct Stores {
    _dir: TempDir,
    path: PathBuf,
    tasks: Arc<TaskStore>,
    learning: Arc<LearningStore>,
}

fn stores() -> Stores {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("medic.db");
    Stores {
        tasks: Arc::new(TaskStore::open_at(&path).unwrap()),
        learning: Arc::new(LearningStore::open_at(&path).unwrap()),
        path,
        _dir: dir,
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        stage_timeout_secs: 1,
        ..PipelineConfig::default()
    }
}

fn pipeline(s: &Stores, executor: &FakeExecutor, config: PipelineConfig) -> Pipeline {
    Pipeline::new(
        Arc::clone(&s.tasks),
        Arc::clone(&s.learning),
        Arc::new(executor.clone()),
        config,
    )
}

fn oracles(list: &[&FakeOracle]) -> Vec<Arc<dyn DiagnosisOracle>> {
    list.iter()
        .map(|o| Arc::new((*o).clone()) as Arc<dyn DiagnosisOracle>)
        .collect()
}

fn refused(subject: &str) -> Issue {
    Issue::new(
        "http",
        IssueKind::HttpFailure,
        subject,
        "GET http://localhost:8080/health: connection refused",
    )
}

fn track(s: &Stores, issue: &Issue) -> i64 {
    s.tasks.upsert(issue).unwrap().task_id
}

// ============================================================================
// Stage chain
// ============================================================================

#[tokio::test]
async fn test_confident_oracle_fix_closes_task() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.status, TaskStatus::Closed);
    // No learned pattern yet, so the oracle is the first stage that runs
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].strategy, Strategy::SingleOracle);
    assert_eq!(executor.calls(), vec![("web".to_string(), ActionKind::RestartService)]);

    let task = s.tasks.get(id).unwrap();
    assert_eq!(task.resolution.as_deref(), Some("verified_fixed by single_oracle"));
    assert_eq!(task.fix_attempt_count, 1);

    let pattern = s.learning.best_for("connection_refused").unwrap().unwrap();
    assert_eq!(pattern.strategy, Strategy::SingleOracle);
    assert_eq!(pattern.last_action, Some(ActionKind::RestartService));
    assert_relative_eq!(pattern.confidence, 1.0);
}

#[tokio::test]
async fn test_learned_pattern_runs_before_any_oracle() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));

    let first = track(&s, &refused("web"));
    p.remediate(first).await.unwrap();
    assert_eq!(oracle.call_count(), 1);

    // Same failure class on another subject: the pattern answers, the oracle is not asked
    let second = track(&s, &refused("api"));
    let report = p.remediate(second).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].strategy, Strategy::LearnedPattern);
    assert_eq!(report.attempts[0].action, Some(ActionKind::RestartService));
    assert_eq!(oracle.call_count(), 1);
}

#[tokio::test]
async fn test_failing_replay_hands_back_to_the_oracle() {
    let s = stores();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);

    // One clean fix teaches connection_refused -> restart_service at 1.0
    let seed = track(&s, &refused("seed"));
    let learner = pipeline(&s, &FakeExecutor::succeeding(), config()).with_oracles(oracles(&[&oracle]));
    assert!(learner.remediate(seed).await.unwrap().succeeded());
    assert_eq!(oracle.call_count(), 1);

    // The same fix stops working on another subject
    let executor = FakeExecutor::failing();
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));
    let id = track(&s, &refused("web"));

    let replay = p.remediate(id).await.unwrap();
    assert_eq!(replay.attempts.len(), 1);
    assert_eq!(replay.attempts[0].strategy, Strategy::LearnedPattern);
    assert_eq!(replay.attempts[0].replay_of, Some(Strategy::SingleOracle));
    assert_eq!(oracle.call_count(), 1);

    // The replayed pattern took the failure: 1 of 2, below the 0.6 bar
    let source = s
        .learning
        .get("connection_refused", Strategy::SingleOracle)
        .unwrap()
        .unwrap();
    assert_eq!(source.attempt_count, 2);
    assert_relative_eq!(source.confidence, 0.5);

    let next = p.remediate(id).await.unwrap();
    assert_eq!(next.attempts.len(), 2);
    assert_eq!(next.attempts[0].strategy, Strategy::LearnedPattern);
    assert!(!next.attempts[0].applied);
    assert_eq!(next.attempts[1].strategy, Strategy::SingleOracle);
    assert!(next.attempts[1].applied);
    assert_eq!(oracle.call_count(), 2);

    // Ten more failures: the oracle is asked every time, the replay never again
    for _ in 0..10 {
        p.remediate(id).await.unwrap();
    }
    assert_eq!(oracle.call_count(), 12);
    assert_eq!(executor.call_count(), 12);
    let source = s
        .learning
        .get("connection_refused", Strategy::SingleOracle)
        .unwrap()
        .unwrap();
    assert_eq!(source.attempt_count, 10);
    assert_relative_eq!(source.confidence, 0.0);
}

#[tokio::test]
async fn test_below_bar_oracle_falls_through_to_research() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.3);
    let runbook: Vec<Arc<dyn ResearchSource>> = vec![Arc::new(RunbookSource::new(vec![RunbookEntry {
        signature: "connection_refused".to_string(),
        action: ActionKind::RestartContainer,
        confidence: 0.7,
        subject_prefix: None,
        reference: Some("runbook#refused".to_string()),
    }]))];
    let p = pipeline(&s, &executor, config())
        .with_oracles(oracles(&[&oracle]))
        .with_research(runbook);

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    let strategies: Vec<Strategy> = report.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(strategies, vec![Strategy::SingleOracle, Strategy::ResearchFallback]);

    let skipped = &report.attempts[0];
    assert!(!skipped.applied);
    assert_eq!(skipped.action, Some(ActionKind::RestartService));
    assert_relative_eq!(skipped.confidence, 0.3);

    let decisive = report.decisive.as_ref().unwrap();
    assert_eq!(decisive.strategy, Strategy::ResearchFallback);
    assert_eq!(decisive.action, Some(ActionKind::RestartContainer));
    assert!(decisive.rationale.as_deref().unwrap().contains("runbook#refused"));
    assert_eq!(report.status, TaskStatus::Closed);
}

#[tokio::test]
async fn test_research_without_candidates_is_recorded() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let runbook: Vec<Arc<dyn ResearchSource>> = vec![Arc::new(RunbookSource::new(Vec::new()))];
    let p = pipeline(&s, &executor, config()).with_research(runbook);

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].strategy, Strategy::ResearchFallback);
    assert!(!report.attempts[0].applied);
    assert!(report.decisive.is_none());
    assert_eq!(report.status, TaskStatus::Attempted);
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_no_stages_configured_still_marks_attempted() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let p = pipeline(&s, &executor, config());

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    assert!(report.attempts.is_empty());
    assert_eq!(report.status, TaskStatus::Attempted);
}

// ============================================================================
// Oracles
// ============================================================================

#[tokio::test]
async fn test_oracle_timeout_records_unavailable() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let slow = FakeOracle::answering("slow", ActionKind::RestartService, 0.9)
        .with_delay(Duration::from_secs(3));
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&slow]));

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    assert_eq!(report.attempts.len(), 1);
    let attempt = &report.attempts[0];
    assert_eq!(attempt.strategy, Strategy::SingleOracle);
    assert!(!attempt.applied);
    assert_eq!(attempt.error_signature.as_deref(), Some(ORACLE_UNAVAILABLE));
    assert!(attempt.rationale.as_deref().unwrap().contains("timed out"));
    assert_eq!(executor.call_count(), 0);
    assert_eq!(report.status, TaskStatus::Attempted);
}

#[tokio::test]
async fn test_unreachable_oracle_records_unavailable() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let down = FakeOracle::unavailable("down");
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&down]));

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    assert_eq!(report.attempts[0].error_signature.as_deref(), Some(ORACLE_UNAVAILABLE));
    assert_eq!(down.call_count(), 1);
}

#[tokio::test]
async fn test_consensus_waits_for_repeated_failures() {
    let s = stores();
    let executor = FakeExecutor::failing();
    let a = FakeOracle::answering("a", ActionKind::RestartContainer, 0.4);
    let b = FakeOracle::answering("b", ActionKind::RestartContainer, 0.5);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&a, &b]));

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    // One failure so far, the default needs three before asking everyone
    let strategies: Vec<Strategy> = report.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(strategies, vec![Strategy::SingleOracle]);
    assert_eq!(b.call_count(), 0);
}

#[tokio::test]
async fn test_consensus_majority_is_executed() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let a = FakeOracle::answering("a", ActionKind::RestartContainer, 0.4);
    let b = FakeOracle::answering("b", ActionKind::RestartContainer, 0.5);
    let c = FakeOracle::unavailable("c");
    let p = pipeline(
        &s,
        &executor,
        PipelineConfig {
            consensus_after_failures: 1,
            ..config()
        },
    )
    .with_oracles(oracles(&[&a, &b, &c]));

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    let strategies: Vec<Strategy> = report.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(strategies, vec![Strategy::SingleOracle, Strategy::MultiOracle]);

    let decisive = report.decisive.as_ref().unwrap();
    assert_eq!(decisive.strategy, Strategy::MultiOracle);
    assert_eq!(decisive.action, Some(ActionKind::RestartContainer));
    // Mean of the two agreeing votes
    assert_relative_eq!(decisive.confidence, 0.45, epsilon = 1e-9);
    assert!(report.succeeded());
    assert_eq!(c.call_count(), 1);
}

#[tokio::test]
async fn test_split_vote_is_inconclusive() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let a = FakeOracle::answering("a", ActionKind::RestartService, 0.3);
    let b = FakeOracle::answering("b", ActionKind::RestartContainer, 0.3);
    let c = FakeOracle::answering("c", ActionKind::DiagnoseOnly, 0.3);
    let p = pipeline(
        &s,
        &executor,
        PipelineConfig {
            consensus_after_failures: 0,
            ..config()
        },
    )
    .with_oracles(oracles(&[&a, &b, &c]));

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    assert_eq!(report.attempts.len(), 2);
    let multi = &report.attempts[1];
    assert_eq!(multi.strategy, Strategy::MultiOracle);
    assert!(!multi.applied);
    assert!(multi.rationale.as_deref().unwrap().starts_with("no majority"));
    assert!(report.decisive.is_none());
    assert_eq!(executor.call_count(), 0);
}

// ============================================================================
// Execution outcomes
// ============================================================================

#[tokio::test]
async fn test_failed_fix_keeps_task_open() {
    let s = stores();
    let executor = FakeExecutor::failing();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));

    let issue = refused("web");
    let id = track(&s, &issue);
    let report = p.remediate(id).await.unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.status, TaskStatus::Attempted);
    let decisive = report.decisive.unwrap();
    assert!(decisive.applied);
    assert_eq!(decisive.success, Some(false));
    assert_eq!(decisive.error_signature.as_deref(), Some("connection_refused"));

    // Re-detected: still the same task, and it goes around again
    let again = s.tasks.upsert(&issue).unwrap();
    assert_eq!(again.task_id, id);
    assert!(!again.is_new);
    p.remediate(id).await.unwrap();
    assert_eq!(s.tasks.get(id).unwrap().fix_attempt_count, 2);
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn test_dry_run_records_without_executing() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config())
        .with_oracles(oracles(&[&oracle]))
        .with_dry_run(true);

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    assert_eq!(executor.call_count(), 0);
    let decisive = report.decisive.unwrap();
    assert!(!decisive.applied);
    assert_eq!(decisive.action, Some(ActionKind::RestartService));
    assert!(decisive.rationale.as_deref().unwrap().starts_with("dry run:"));
    assert_eq!(report.status, TaskStatus::Attempted);
    // Nothing applied, nothing learned
    assert!(s.learning.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_diagnose_only_is_never_executed() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let oracle = FakeOracle::answering("primary", ActionKind::DiagnoseOnly, 0.95);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));

    let id = track(&s, &refused("web"));
    let report = p.remediate(id).await.unwrap();

    assert_eq!(executor.call_count(), 0);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].action, Some(ActionKind::DiagnoseOnly));
    assert!(!report.attempts[0].applied);
    assert!(report.decisive.is_none());
}

#[tokio::test]
async fn test_escalated_task_stays_escalated_after_failure() {
    let s = stores();
    let executor = FakeExecutor::failing();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));

    let id = track(&s, &refused("web"));
    p.remediate(id).await.unwrap();
    s.tasks.escalate(id, Some("medic-test")).unwrap();

    let report = p.remediate(id).await.unwrap();
    assert_eq!(report.status, TaskStatus::Escalated);
    assert_eq!(s.tasks.get(id).unwrap().escalation_ref.as_deref(), Some("medic-test"));
}

#[tokio::test]
async fn test_escalated_task_closes_when_fixed() {
    let s = stores();
    let executor = FakeExecutor::failing().with_script("web", &[false, true]);
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));

    let id = track(&s, &refused("web"));
    p.remediate(id).await.unwrap();
    s.tasks.escalate(id, Some("medic-test")).unwrap();

    let report = p.remediate(id).await.unwrap();
    assert!(report.succeeded());
    assert_eq!(report.status, TaskStatus::Closed);
}

// ============================================================================
// Budgets and store contention
// ============================================================================

#[tokio::test]
async fn test_budget_cuts_off_a_slow_stage() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let oracle = FakeOracle::answering("slow", ActionKind::RestartService, 0.9)
        .with_delay(Duration::from_secs(5));
    let p = pipeline(
        &s,
        &executor,
        PipelineConfig {
            stage_timeout_secs: 30,
            ..config()
        },
    )
    .with_oracles(oracles(&[&oracle]));

    let id = track(&s, &refused("web"));
    let started = Instant::now();
    let report = p.remediate_within(id, Duration::from_millis(200)).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.budget_exceeded);
    assert_eq!(report.status, TaskStatus::Attempted);
    assert_eq!(report.attempts.len(), 1);
    let cut = &report.attempts[0];
    assert_eq!(cut.strategy, Strategy::SingleOracle);
    assert!(!cut.applied);
    assert_eq!(cut.error_signature.as_deref(), Some(BUDGET_EXCEEDED));
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_budget_cuts_off_a_hung_action() {
    let s = stores();
    let executor = FakeExecutor::succeeding().with_delay(Duration::from_secs(5));
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));

    let id = track(&s, &refused("web"));
    let report = p.remediate_within(id, Duration::from_millis(200)).await.unwrap();

    assert!(report.budget_exceeded);
    assert!(!report.succeeded());
    let decisive = report.decisive.unwrap();
    assert!(decisive.applied);
    assert_eq!(decisive.success, Some(false));
    assert_eq!(decisive.error_signature.as_deref(), Some(BUDGET_EXCEEDED));
    assert_eq!(s.tasks.get(id).unwrap().status, TaskStatus::Attempted);
}

#[tokio::test(flavor = "current_thread")]
async fn test_store_contention_does_not_stall_the_runtime() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));
    let id = track(&s, &refused("web"));

    // Another writer holds the write lock for two seconds
    let (locked_tx, locked_rx) = mpsc::channel();
    let path = s.path.clone();
    let writer = std::thread::spawn(move || {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_secs(2));
        conn.execute_batch("COMMIT").unwrap();
    });
    locked_rx.recv().unwrap();

    let remediation = tokio::spawn(async move { p.remediate(id).await });
    tokio::task::yield_now().await;

    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "timer held up for {:?}",
        started.elapsed()
    );

    let report = remediation.await.unwrap().unwrap();
    assert!(report.succeeded());
    writer.join().unwrap();
}

// ============================================================================
// Manual resolution
// ============================================================================

#[tokio::test]
async fn test_manual_resolution_closes_and_blocks_remediation() {
    let s = stores();
    let executor = FakeExecutor::succeeding();
    let oracle = FakeOracle::answering("primary", ActionKind::RestartService, 0.9);
    let p = pipeline(&s, &executor, config()).with_oracles(oracles(&[&oracle]));

    let id = track(&s, &refused("web"));
    let attempt = record_manual_resolution(&s.tasks, &s.learning, id, "rotated the cert", 10).unwrap();
    assert_eq!(attempt.strategy, Strategy::Manual);
    assert!(attempt.succeeded());

    let task = s.tasks.get(id).unwrap();
    assert_eq!(task.status, TaskStatus::Closed);
    assert_eq!(task.resolution.as_deref(), Some("manual: rotated the cert"));

    let report = p.remediate(id).await.unwrap();
    assert!(report.attempts.is_empty());
    assert_eq!(oracle.call_count(), 0);

    assert!(record_manual_resolution(&s.tasks, &s.learning, id, "again", 10).is_err());
}
