//! Control loop: collect, dedupe, remediate, reflect.
//!
//! One cycle per interval. A tick that fires while the previous cycle is
//! still running is skipped, never queued. Remediation fans out to a
//! bounded worker pool; every task runs in its own spawned future under a
//! hard budget, so one slow task cannot hold up the others. Store calls go
//! through the blocking pool.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use medic_common::TaskStatus;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::collectors::Collector;
use crate::config::CoordinatorConfig;
use crate::metacognition::{MetaEvent, Metacognition};
use crate::notifier::NotificationGateway;
use crate::pipeline::Pipeline;
use crate::store::{self, TaskStore};

/// Slack past the task budget for the pipeline to record its cut-off attempt
const BUDGET_GRACE: Duration = Duration::from_secs(5);

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// Another cycle was still running; nothing was done
    pub skipped: bool,
    pub issues: usize,
    pub collector_errors: usize,
    pub new_tasks: usize,
    pub regressions: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub escalations: usize,
    pub recoveries: usize,
    pub digest_sent: usize,
    pub pruned: usize,
}

/// Clears the running flag when a cycle ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum TaskOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

pub struct Coordinator {
    collectors: Vec<Arc<dyn Collector>>,
    tasks: Arc<TaskStore>,
    pipeline: Arc<Pipeline>,
    metacognition: Arc<Metacognition>,
    gateway: Arc<NotificationGateway>,
    config: CoordinatorConfig,
    retention: ChronoDuration,
    running: AtomicBool,
    cycles: AtomicU64,
    last_prune: Mutex<Option<DateTime<Utc>>>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        retention_days: u64,
        collectors: Vec<Arc<dyn Collector>>,
        pipeline: Arc<Pipeline>,
        metacognition: Arc<Metacognition>,
        gateway: Arc<NotificationGateway>,
    ) -> Self {
        Self {
            collectors,
            tasks: Arc::clone(pipeline.task_store()),
            pipeline,
            metacognition,
            gateway,
            config,
            retention: ChronoDuration::days(retention_days as i64),
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            last_prune: Mutex::new(None),
        }
    }

    /// Run cycles every interval until `shutdown` flips to true.
    ///
    /// An in-flight cycle is allowed to finish before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<CycleReport>> = None;

        info!(
            target: "medicd",
            "Coordinator running every {:?} with {} worker(s) and {} collector(s)",
            self.config.interval(),
            self.config.workers,
            self.collectors.len()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if current.as_ref().map_or(false, |h| !h.is_finished()) {
                        warn!("Cycle still running, skipping this tick");
                    } else {
                        let me = Arc::clone(&self);
                        current = Some(tokio::spawn(async move { me.run_cycle().await }));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(target: "medicd", "Shutdown requested, waiting for the current cycle");
        if let Some(handle) = current {
            if let Err(e) = handle.await {
                error!(target: "medicd", "Cycle task failed during shutdown: {}", e);
            }
        }
    }

    /// One full cycle. Returns a skipped report if a cycle is already running.
    pub async fn run_cycle(&self) -> CycleReport {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Cycle still running, skipping this tick");
            return CycleReport {
                skipped: true,
                ..CycleReport::default()
            };
        }
        let _guard = RunningGuard(&self.running);

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };
        debug!("Cycle {} starting", cycle);

        // 1. Collect
        let mut issues = Vec::new();
        for collector in &self.collectors {
            match tokio::time::timeout(self.config.collector_timeout(), collector.poll()).await {
                Ok(Ok(found)) => {
                    debug!("{} reported {} issue(s)", collector.name(), found.len());
                    issues.extend(found);
                }
                Ok(Err(e)) => {
                    warn!("Collector {} failed: {:#}", collector.name(), e);
                    report.collector_errors += 1;
                }
                Err(_) => {
                    warn!(
                        "Collector {} timed out after {:?}",
                        collector.name(),
                        self.config.collector_timeout()
                    );
                    report.collector_errors += 1;
                }
            }
        }
        report.issues = issues.len();

        // 2. Dedupe into tasks
        let mut to_dispatch: BTreeSet<i64> = BTreeSet::new();
        let mut subjects: BTreeSet<String> = BTreeSet::new();
        let issues = Arc::new(issues);
        let upserts = {
            let issues = Arc::clone(&issues);
            store::blocking(&self.tasks, move |s| {
                Ok(issues.iter().map(|issue| s.upsert(issue)).collect::<Vec<_>>())
            })
            .await
        };
        let upserts = match upserts {
            Ok(results) => results,
            Err(e) => {
                error!(critical = true, "Could not fold issues into tasks: {}", e);
                Vec::new()
            }
        };
        for (issue, upserted) in issues.iter().zip(upserts) {
            match upserted {
                Ok(up) => {
                    subjects.insert(issue.subject.clone());
                    report.new_tasks += usize::from(up.is_new);
                    report.regressions += usize::from(up.regression);
                    // Re-detected open tasks go back to the pool whatever their status
                    if up.status.is_open() {
                        to_dispatch.insert(up.task_id);
                    }
                }
                Err(e) if e.is_critical() => {
                    error!(critical = true, "Dropping issue on {}: {}", issue.subject, e)
                }
                Err(e) => warn!("Could not record issue on {}: {}", issue.subject, e),
            }
        }

        // 3. Remediate
        report.dispatched = to_dispatch.len();
        for outcome in self.dispatch(to_dispatch.into_iter().collect()).await {
            match outcome {
                TaskOutcome::Succeeded => report.succeeded += 1,
                TaskOutcome::Failed => report.failed += 1,
                TaskOutcome::TimedOut => report.timed_out += 1,
            }
        }

        // 4. Reflect, including subjects that are escalated but quiet this cycle
        match store::blocking(&self.tasks, |s| s.list(Some(TaskStatus::Escalated), None)).await {
            Ok(escalated) => subjects.extend(escalated.into_iter().map(|t| t.subject)),
            Err(e) => warn!("Could not list escalated tasks: {}", e),
        }
        let subjects: Vec<String> = subjects.into_iter().collect();
        for event in self.metacognition.run_pass(&subjects).await {
            match event {
                MetaEvent::Escalated { .. } => report.escalations += 1,
                MetaEvent::Recovered { .. } => report.recoveries += 1,
            }
        }

        // 5. Housekeeping
        if cycle % self.config.digest_every_cycles.max(1) == 0 {
            match self.gateway.flush_batch().await {
                Ok(n) => report.digest_sent = n,
                Err(e) => warn!("Digest flush failed: {}", e),
            }
        }
        report.pruned = self.prune_if_due().await;

        info!(
            "Cycle {}: {} issue(s), {} new task(s), {} dispatched, {} fixed, {} failed, {} timed out, {} escalation(s)",
            cycle,
            report.issues,
            report.new_tasks,
            report.dispatched,
            report.succeeded,
            report.failed,
            report.timed_out,
            report.escalations
        );
        report
    }

    async fn dispatch(&self, task_ids: Vec<i64>) -> Vec<TaskOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let budget = self.config.task_budget();
        let mut workers = JoinSet::new();

        for task_id in task_ids {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let pipeline = Arc::clone(&self.pipeline);
            workers.spawn(async move {
                let _permit = permit;
                let result = tokio::time::timeout(
                    budget + BUDGET_GRACE,
                    pipeline.remediate_within(task_id, budget),
                )
                .await;
                (task_id, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok((task_id, Ok(Ok(report)))) if report.budget_exceeded => {
                    warn!("Task {} exceeded its {:?} budget", task_id, budget);
                    TaskOutcome::TimedOut
                }
                Ok((_, Ok(Ok(report)))) if report.succeeded() => TaskOutcome::Succeeded,
                Ok((_, Ok(Ok(_)))) => TaskOutcome::Failed,
                Ok((task_id, Ok(Err(e)))) => {
                    if e.is_critical() {
                        error!(critical = true, "Task {} remediation aborted: {}", task_id, e);
                    } else {
                        warn!("Task {} remediation failed: {}", task_id, e);
                    }
                    TaskOutcome::Failed
                }
                Ok((task_id, Err(_))) => {
                    error!(
                        critical = true,
                        "Task {} still running {:?} past its budget, abandoned",
                        task_id, BUDGET_GRACE
                    );
                    TaskOutcome::TimedOut
                }
                Err(e) => {
                    error!("Remediation worker panicked: {}", e);
                    TaskOutcome::Failed
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Prune old closed tasks at most once a day
    async fn prune_if_due(&self) -> usize {
        let now = Utc::now();
        {
            let Ok(mut last) = self.last_prune.lock() else {
                return 0;
            };
            if matches!(*last, Some(at) if now - at < ChronoDuration::days(1)) {
                return 0;
            }
            *last = Some(now);
        }
        let cutoff = now - self.retention;
        match store::blocking(&self.tasks, move |s| s.prune_closed(cutoff)).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Pruning closed tasks failed: {}", e);
                0
            }
        }
    }
}
