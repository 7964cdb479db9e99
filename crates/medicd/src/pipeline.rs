//! Graduated remediation pipeline.
//!
//! Stages run in cost order and the first one whose confidence clears its
//! bar gets its action executed:
//!
//! 1. learned pattern replay
//! 2. single oracle diagnosis
//! 3. multi-oracle consensus (only after repeated failures)
//! 4. research fallback
//!
//! Every stage that actually ran writes exactly one FixAttempt. This module
//! is the only writer of attempts.

use medic_common::{
    ActionKind, FixAttempt, MedicError, MedicResult, NewFixAttempt, Strategy, Task, TaskStatus,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actions::RemediationExecutor;
use crate::config::PipelineConfig;
use crate::oracle::{Diagnosis, DiagnosisOracle, IssueContext};
use crate::research::{best_candidate, ResearchSource};
use crate::store::{self, LearningStore, TaskStore};

/// Automatic strategies in the order they are tried
pub const CHAIN: [Strategy; 4] = [
    Strategy::LearnedPattern,
    Strategy::SingleOracle,
    Strategy::MultiOracle,
    Strategy::ResearchFallback,
];

/// Error signature recorded when an oracle errors or times out
pub const ORACLE_UNAVAILABLE: &str = "oracle_unavailable";

/// Error signature recorded when a run is cut off by its task budget
pub const BUDGET_EXCEEDED: &str = "budget_exceeded";

/// What one remediation run did
#[derive(Debug, Clone)]
pub struct RemediationReport {
    pub task_id: i64,
    pub subject: String,
    /// Every attempt written during this run, in order
    pub attempts: Vec<FixAttempt>,
    /// The attempt whose action was executed, if any
    pub decisive: Option<FixAttempt>,
    /// Task status after the run
    pub status: TaskStatus,
    /// The run was cancelled at its deadline
    pub budget_exceeded: bool,
}

impl RemediationReport {
    pub fn succeeded(&self) -> bool {
        self.decisive.as_ref().map_or(false, FixAttempt::succeeded)
    }
}

/// Result of asking one stage for a proposal
enum StageOutcome {
    /// Stage not eligible; nothing was attempted, nothing is recorded
    Skip,
    /// Stage produced a proposal
    Proposal {
        action: ActionKind,
        confidence: f64,
        rationale: String,
        clears_bar: bool,
        /// Set when the proposal replays another strategy's pattern
        replay_of: Option<Strategy>,
    },
    /// Stage ran but had nothing usable
    Inconclusive {
        confidence: f64,
        rationale: String,
        error_signature: Option<String>,
    },
}

pub struct Pipeline {
    tasks: Arc<TaskStore>,
    learning: Arc<LearningStore>,
    oracles: Vec<Arc<dyn DiagnosisOracle>>,
    research: Vec<Arc<dyn ResearchSource>>,
    executor: Arc<dyn RemediationExecutor>,
    config: PipelineConfig,
    dry_run: bool,
}

impl Pipeline {
    pub fn new(
        tasks: Arc<TaskStore>,
        learning: Arc<LearningStore>,
        executor: Arc<dyn RemediationExecutor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            tasks,
            learning,
            oracles: Vec::new(),
            research: Vec::new(),
            executor,
            config,
            dry_run: false,
        }
    }

    pub fn with_oracles(mut self, oracles: Vec<Arc<dyn DiagnosisOracle>>) -> Self {
        self.oracles = oracles;
        self
    }

    pub fn with_research(mut self, research: Vec<Arc<dyn ResearchSource>>) -> Self {
        self.research = research;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn task_store(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    /// Run the stage chain once for a task
    pub async fn remediate(&self, task_id: i64) -> MedicResult<RemediationReport> {
        self.run_chain(task_id, None).await
    }

    /// Run the stage chain with a hard budget.
    ///
    /// A stage or action still in flight at the deadline is dropped (child
    /// processes included) and recorded as a `budget_exceeded` attempt.
    pub async fn remediate_within(
        &self,
        task_id: i64,
        budget: Duration,
    ) -> MedicResult<RemediationReport> {
        self.run_chain(task_id, Some(Instant::now() + budget)).await
    }

    async fn run_chain(
        &self,
        task_id: i64,
        deadline: Option<Instant>,
    ) -> MedicResult<RemediationReport> {
        let task = store::blocking(&self.tasks, move |s| s.get(task_id)).await?;
        let mut report = RemediationReport {
            task_id,
            subject: task.subject.clone(),
            attempts: Vec::new(),
            decisive: None,
            status: task.status,
            budget_exceeded: false,
        };
        if !task.status.is_open() {
            debug!("Task {} is closed, nothing to remediate", task_id);
            return Ok(report);
        }

        let history = store::blocking(&self.tasks, move |s| s.attempts_for_task(task_id)).await?;
        let ctx = IssueContext::new(&task, &history);

        for strategy in CHAIN {
            let Some(outcome) = within(deadline, self.run_stage(strategy, &task, &ctx)).await else {
                warn!("Task {}: budget exhausted during {}", task_id, strategy);
                let attempt = self
                    .record(
                        NewFixAttempt::skipped(&task, strategy, 0.0)
                            .with_error(BUDGET_EXCEEDED)
                            .with_rationale(format!("task budget exhausted during {}", strategy)),
                    )
                    .await?;
                report.attempts.push(attempt);
                report.budget_exceeded = true;
                break;
            };
            let attempt = match outcome? {
                StageOutcome::Skip => continue,
                StageOutcome::Inconclusive {
                    confidence,
                    rationale,
                    error_signature,
                } => {
                    let mut new = NewFixAttempt::skipped(&task, strategy, confidence)
                        .with_rationale(rationale);
                    new.error_signature = error_signature;
                    self.record(new).await?
                }
                StageOutcome::Proposal {
                    action,
                    confidence,
                    rationale,
                    clears_bar,
                    replay_of,
                } => {
                    if !clears_bar {
                        debug!(
                            "Task {}: {} proposed {} at {:.2}, below bar",
                            task_id, strategy, action, confidence
                        );
                        self.record(
                            NewFixAttempt::skipped(&task, strategy, confidence)
                                .with_action(action)
                                .with_rationale(rationale),
                        )
                        .await?
                    } else if !action.mutates() {
                        info!("Task {}: {} suggests diagnosis only: {}", task_id, strategy, rationale);
                        self.record(
                            NewFixAttempt::skipped(&task, strategy, confidence)
                                .with_action(action)
                                .with_rationale(rationale),
                        )
                        .await?
                    } else if self.dry_run {
                        info!(
                            "[DRY-RUN] Would execute {} on {} ({} at {:.2})",
                            action, task.subject, strategy, confidence
                        );
                        let attempt = self
                            .record(
                                NewFixAttempt::skipped(&task, strategy, confidence)
                                    .with_action(action)
                                    .with_rationale(format!("dry run: {}", rationale)),
                            )
                            .await?;
                        report.attempts.push(attempt.clone());
                        report.decisive = Some(attempt);
                        break;
                    } else {
                        let proposed = NewFixAttempt::applied(&task, strategy, action, confidence, false)
                            .with_rationale(rationale)
                            .replaying(replay_of);
                        let attempt = self.execute(&task, proposed, deadline).await?;
                        report.budget_exceeded =
                            attempt.error_signature.as_deref() == Some(BUDGET_EXCEEDED);
                        report.attempts.push(attempt.clone());
                        report.decisive = Some(attempt);
                        break;
                    }
                }
            };
            report.attempts.push(attempt);
        }

        report.status = self.settle(&task, report.succeeded(), report.decisive.as_ref()).await?;
        Ok(report)
    }

    async fn run_stage(
        &self,
        strategy: Strategy,
        task: &Task,
        ctx: &IssueContext,
    ) -> MedicResult<StageOutcome> {
        Ok(match strategy {
            Strategy::LearnedPattern => self.learned_pattern(task).await?,
            Strategy::SingleOracle => self.single_oracle(ctx).await,
            Strategy::MultiOracle => self.multi_oracle(task, ctx).await?,
            Strategy::ResearchFallback => self.research_fallback(ctx).await,
            Strategy::Manual => StageOutcome::Skip,
        })
    }

    async fn learned_pattern(&self, task: &Task) -> MedicResult<StageOutcome> {
        let signature = task.signature.clone();
        let Some(pattern) = store::blocking(&self.learning, move |s| s.best_for(&signature)).await?
        else {
            return Ok(StageOutcome::Skip);
        };
        let Some(action) = pattern.last_action else {
            return Ok(StageOutcome::Skip);
        };
        Ok(StageOutcome::Proposal {
            action,
            confidence: pattern.confidence,
            rationale: format!(
                "{} worked {}/{} times via {}",
                action, pattern.success_count, pattern.attempt_count, pattern.strategy
            ),
            clears_bar: pattern.confidence >= self.config.learned_min_confidence,
            replay_of: Some(pattern.strategy),
        })
    }

    async fn single_oracle(&self, ctx: &IssueContext) -> StageOutcome {
        let Some(oracle) = self.oracles.first() else {
            return StageOutcome::Skip;
        };
        match ask(Arc::clone(oracle), ctx.clone(), self.config.stage_timeout()).await {
            Ok(d) => StageOutcome::Proposal {
                action: d.action,
                confidence: d.confidence,
                clears_bar: d.confidence >= self.config.oracle_min_confidence,
                rationale: format!("{}: {}", oracle.name(), d.rationale),
                replay_of: None,
            },
            Err(reason) => {
                warn!("Oracle {} unavailable for task {}: {}", oracle.name(), ctx.task_id, reason);
                oracle_unavailable(reason)
            }
        }
    }

    async fn multi_oracle(&self, task: &Task, ctx: &IssueContext) -> MedicResult<StageOutcome> {
        if self.oracles.len() < 2 {
            return Ok(StageOutcome::Skip);
        }
        let task_id = task.id;
        let failures =
            store::blocking(&self.tasks, move |s| s.unsuccessful_attempt_count(task_id)).await?;
        if failures < self.config.consensus_after_failures {
            return Ok(StageOutcome::Skip);
        }

        // Dropping the set aborts whatever is still in flight
        let mut calls = JoinSet::new();
        let ctx = Arc::new(ctx.clone());
        for oracle in &self.oracles {
            let oracle = Arc::clone(oracle);
            let ctx = Arc::clone(&ctx);
            let timeout = self.config.stage_timeout();
            calls.spawn(async move {
                let name = oracle.name().to_string();
                (name, ask(oracle, (*ctx).clone(), timeout).await)
            });
        }

        let mut votes: Vec<Diagnosis> = Vec::new();
        let mut unavailable = Vec::new();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((_, Ok(d))) => votes.push(d),
                Ok((name, Err(reason))) => unavailable.push(format!("{}: {}", name, reason)),
                Err(e) => unavailable.push(format!("join: {}", e)),
            }
        }

        Ok(tally(&votes, self.oracles.len(), &unavailable))
    }

    async fn research_fallback(&self, ctx: &IssueContext) -> StageOutcome {
        if self.research.is_empty() {
            return StageOutcome::Skip;
        }
        let mut candidates = Vec::new();
        for source in &self.research {
            match tokio::time::timeout(self.config.stage_timeout(), source.search(ctx)).await {
                Ok(Ok(found)) => candidates.extend(found),
                Ok(Err(e)) => warn!("Research source {} failed: {:#}", source.name(), e),
                Err(_) => warn!("Research source {} timed out", source.name()),
            }
        }
        match best_candidate(candidates) {
            Some(c) => StageOutcome::Proposal {
                action: c.action,
                confidence: c.confidence,
                clears_bar: c.confidence >= self.config.research_min_confidence,
                rationale: format!("research: {}", c.source),
                replay_of: None,
            },
            None => StageOutcome::Inconclusive {
                confidence: 0.0,
                rationale: "no research candidates".to_string(),
                error_signature: None,
            },
        }
    }

    /// Apply the proposed action and record what happened
    async fn execute(
        &self,
        task: &Task,
        mut attempt: NewFixAttempt,
        deadline: Option<Instant>,
    ) -> MedicResult<FixAttempt> {
        let Some(action) = attempt.action else {
            return self.record(attempt).await;
        };
        info!(
            "Task {}: applying {} to {} via {} (confidence {:.2})",
            task.id, action, task.subject, attempt.strategy, attempt.confidence
        );
        let rationale = attempt.rationale.take().unwrap_or_default();
        let (success, rationale) = match within(deadline, self.executor.apply(&task.subject, action)).await {
            Some(Ok(ok)) => (ok, rationale),
            Some(Err(e)) => {
                warn!("Action {} on {} errored: {:#}", action, task.subject, e);
                (false, format!("{} (action error: {:#})", rationale, e))
            }
            None => {
                warn!("Task {}: {} on {} cancelled at the task budget", task.id, action, task.subject);
                attempt.error_signature = Some(BUDGET_EXCEEDED.to_string());
                (false, format!("{} (cancelled: task budget exhausted)", rationale))
            }
        };
        if success {
            info!("Task {}: {} verified on {}", task.id, action, task.subject);
            attempt.error_signature = None;
        } else {
            warn!("Task {}: {} did not fix {}", task.id, action, task.subject);
        }
        attempt.success = Some(success);
        self.record(attempt.with_rationale(rationale)).await
    }

    /// Append the attempt, then refresh every pattern it is evidence for
    async fn record(&self, attempt: NewFixAttempt) -> MedicResult<FixAttempt> {
        let window = self.config.pattern_window;
        let written = store::blocking(&self.tasks, move |s| s.append_attempt(&attempt)).await?;
        let signature = written.signature.clone();
        let keys: Vec<Strategy> = std::iter::once(written.strategy).chain(written.replay_of).collect();
        store::blocking(&self.learning, move |s| {
            for strategy in keys {
                s.recompute(&signature, strategy, window)?;
            }
            Ok(())
        })
        .await?;
        Ok(written)
    }

    async fn settle(
        &self,
        task: &Task,
        succeeded: bool,
        decisive: Option<&FixAttempt>,
    ) -> MedicResult<TaskStatus> {
        let task_id = task.id;
        if succeeded {
            let resolution = decisive
                .map(|a| format!("verified_fixed by {}", a.strategy))
                .unwrap_or_else(|| "verified_fixed".to_string());
            let closed = store::blocking(&self.tasks, move |s| s.close(task_id, &resolution)).await?;
            return Ok(closed.status);
        }
        if task.status == TaskStatus::Escalated {
            // Only metacognition recovery de-escalates
            return Ok(task.status);
        }
        let attempted =
            store::blocking(&self.tasks, move |s| s.transition(task_id, TaskStatus::Attempted)).await?;
        Ok(attempted.status)
    }
}

/// Await `fut` unless the deadline passes first
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn ask(
    oracle: Arc<dyn DiagnosisOracle>,
    ctx: IssueContext,
    timeout: Duration,
) -> Result<Diagnosis, String> {
    match tokio::time::timeout(timeout, oracle.diagnose(&ctx)).await {
        Ok(Ok(d)) => Ok(d),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("timed out after {:?}", timeout)),
    }
}

fn oracle_unavailable(reason: String) -> StageOutcome {
    StageOutcome::Inconclusive {
        confidence: 0.0,
        rationale: reason,
        error_signature: Some(ORACLE_UNAVAILABLE.to_string()),
    }
}

/// Strict majority of all queried oracles on one action
fn tally(votes: &[Diagnosis], queried: usize, unavailable: &[String]) -> StageOutcome {
    if votes.is_empty() {
        return oracle_unavailable(unavailable.join("; "));
    }

    let mut by_action: HashMap<ActionKind, Vec<f64>> = HashMap::new();
    for vote in votes {
        by_action.entry(vote.action).or_default().push(vote.confidence);
    }
    let (action, confidences) = by_action
        .into_iter()
        .max_by_key(|(_, c)| c.len())
        .unwrap_or((ActionKind::DiagnoseOnly, Vec::new()));
    let agreeing = confidences.len();
    let mean = confidences.iter().sum::<f64>() / agreeing.max(1) as f64;

    if agreeing * 2 > queried {
        StageOutcome::Proposal {
            action,
            confidence: mean,
            clears_bar: true,
            rationale: format!("{}/{} oracles agree on {}", agreeing, queried, action),
            replay_of: None,
        }
    } else {
        StageOutcome::Inconclusive {
            confidence: agreeing as f64 / queried as f64,
            rationale: format!(
                "no majority: best was {} with {}/{} votes",
                action, agreeing, queried
            ),
            error_signature: None,
        }
    }
}

/// Human force-close: writes a `manual` attempt and closes the task
pub fn record_manual_resolution(
    tasks: &TaskStore,
    learning: &LearningStore,
    task_id: i64,
    note: &str,
    pattern_window: usize,
) -> MedicResult<FixAttempt> {
    let task = tasks.get(task_id)?;
    if !task.status.is_open() {
        return Err(MedicError::InvalidTransition {
            task_id,
            from: task.status,
            to: TaskStatus::Closed,
        });
    }

    let attempt = tasks.append_attempt(
        &NewFixAttempt {
            applied: true,
            success: Some(true),
            ..NewFixAttempt::skipped(&task, Strategy::Manual, 1.0)
        }
        .with_rationale(note),
    )?;
    learning.recompute(&task.signature, Strategy::Manual, pattern_window)?;
    tasks.close(task_id, &format!("manual: {}", note))?;
    info!("Task {} closed manually: {}", task_id, note);
    Ok(attempt)
}
