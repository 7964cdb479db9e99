//! Daemon glue: wires config into live components and owns the pidfile.

use anyhow::{Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::actions::{RemediationExecutor, SystemExecutor};
use crate::collectors;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::metacognition::Metacognition;
use crate::notifier::NotificationGateway;
use crate::oracle::{DiagnosisOracle, HttpOracle};
use crate::pipeline::Pipeline;
use crate::research::{HttpResearchSource, ResearchSource, RunbookSource};
use crate::store::{LearningStore, TaskStore};

/// Build the coordinator and everything behind it
pub fn build(config: &Config) -> Result<Arc<Coordinator>> {
    let tasks = Arc::new(
        TaskStore::open(&config.store)
            .with_context(|| format!("Failed to open task store at {}", config.store.path.display()))?,
    );
    let learning = Arc::new(LearningStore::open(&config.store).context("Failed to open learning store")?);

    let stage_timeout = config.pipeline.stage_timeout();
    let oracles = config
        .oracles
        .iter()
        .map(|e| -> Result<Arc<dyn DiagnosisOracle>> {
            Ok(Arc::new(HttpOracle::new(e, stage_timeout)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut research: Vec<Arc<dyn ResearchSource>> = Vec::new();
    if !config.research.runbook.is_empty() {
        research.push(Arc::new(RunbookSource::new(config.research.runbook.clone())));
    }
    for endpoint in &config.research.endpoints {
        research.push(Arc::new(HttpResearchSource::new(endpoint, stage_timeout)?));
    }

    let executor: Arc<dyn RemediationExecutor> = Arc::new(SystemExecutor::new(&config.actions));
    if config.actions.dry_run {
        warn!(target: "medicd", "Dry-run mode: remediation actions will only be logged");
    }

    let pipeline = Arc::new(
        Pipeline::new(Arc::clone(&tasks), learning, executor, config.pipeline.clone())
            .with_oracles(oracles)
            .with_research(research)
            .with_dry_run(config.actions.dry_run),
    );
    let gateway = Arc::new(NotificationGateway::from_config(&config.notify)?);
    let metacognition = Arc::new(Metacognition::new(
        tasks,
        Arc::clone(&gateway),
        config.metacognition.clone(),
    ));
    let collectors = collectors::from_config(&config.collectors, &config.actions)?;

    info!(
        target: "medicd",
        "{} oracle(s), {} collector(s), store at {}",
        config.oracles.len(),
        collectors.len(),
        config.store.path.display()
    );

    Ok(Arc::new(Coordinator::new(
        config.coordinator.clone(),
        config.store.retention_days,
        collectors,
        pipeline,
        metacognition,
        gateway,
    )))
}

/// Pidfile removed on drop
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our pid, refusing if another live medicd owns the file
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = read_pid(path) {
            if kill(Pid::from_raw(pid), None).is_ok() && pid != std::process::id() as i32 {
                anyhow::bail!("medicd already running with pid {}", pid);
            }
            warn!(target: "medicd", "Removing stale pidfile for pid {}", pid);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Pid recorded in a pidfile, if any
pub fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
