//! Remediation actions: the only side effects medic has on the fleet.
//!
//! Production code uses `SystemExecutor`, which shells out to systemctl and
//! the container runtime. Tests use `FakeExecutor` with scripted outcomes.
//!
//! Every child is spawned with `kill_on_drop`, so a remediation cancelled at
//! its budget takes its in-flight restart down with it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use medic_common::ActionKind;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ActionsConfig;

// ============================================================================
// Executor Trait
// ============================================================================

/// Executes one remediation action and reports whether it verifiably worked
#[async_trait]
pub trait RemediationExecutor: Send + Sync {
    /// `Ok(true)` only when the action ran and the subject is healthy after.
    /// `diagnose_only` must return `Ok(false)` without side effects.
    async fn apply(&self, subject: &str, action: ActionKind) -> Result<bool>;
}

// ============================================================================
// System Executor (Production)
// ============================================================================

pub struct SystemExecutor {
    runtime: String,
    verify_delay: Duration,
}

impl SystemExecutor {
    pub fn new(config: &ActionsConfig) -> Self {
        Self {
            runtime: config.container_runtime.clone(),
            verify_delay: Duration::from_secs(config.verify_delay_secs),
        }
    }

    async fn restart_service(&self, unit: &str) -> Result<bool> {
        let unit = service_unit(unit);
        info!("Executing: systemctl restart {}", unit);
        let output = Command::new("systemctl")
            .args(["restart", &unit])
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute systemctl restart")?;
        if !output.status.success() {
            warn!(
                "systemctl restart {} failed: {}",
                unit,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(false);
        }

        tokio::time::sleep(self.verify_delay).await;

        let output = Command::new("systemctl")
            .args(["is-active", &unit])
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute systemctl is-active")?;
        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("{} is {} after restart", unit, state);
        Ok(output.status.success() && state == "active")
    }

    async fn restart_container(&self, name: &str) -> Result<bool> {
        info!("Executing: {} restart {}", self.runtime, name);
        let output = Command::new(&self.runtime)
            .args(["restart", name])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {} restart", self.runtime))?;
        if !output.status.success() {
            warn!(
                "{} restart {} failed: {}",
                self.runtime,
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(false);
        }

        tokio::time::sleep(self.verify_delay).await;

        let output = Command::new(&self.runtime)
            .args(["inspect", "-f", "{{.State.Running}}", name])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {} inspect", self.runtime))?;
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        info!("{} running after restart: {}", name, running);
        Ok(output.status.success() && running)
    }
}

#[async_trait]
impl RemediationExecutor for SystemExecutor {
    async fn apply(&self, subject: &str, action: ActionKind) -> Result<bool> {
        match action {
            ActionKind::RestartService => self.restart_service(subject).await,
            ActionKind::RestartContainer => self.restart_container(subject).await,
            ActionKind::DiagnoseOnly => Ok(false),
        }
    }
}

/// Subjects coming from logs are bare names ("nginx"); systemctl wants units
fn service_unit(subject: &str) -> String {
    if subject.contains('.') {
        subject.to_string()
    } else {
        format!("{}.service", subject)
    }
}

// ============================================================================
// Fake Executor (Testing)
// ============================================================================

/// Scripted executor for deterministic tests.
///
/// Outcomes are consumed per subject in order; once a subject's script runs
/// out, `default_outcome` is returned.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    scripts: Arc<Mutex<HashMap<String, VecDeque<bool>>>>,
    default_outcome: bool,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<(String, ActionKind)>>>,
}

impl FakeExecutor {
    /// Every mutating action succeeds
    pub fn succeeding() -> Self {
        Self {
            default_outcome: true,
            ..Default::default()
        }
    }

    /// Every mutating action fails verification
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn with_script(self, subject: &str, outcomes: &[bool]) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(subject.to_string(), outcomes.iter().copied().collect());
        }
        self
    }

    /// Hang for `delay` before every action, like a restart that never returns
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every (subject, action) the executor was asked to run
    pub fn calls(&self) -> Vec<(String, ActionKind)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RemediationExecutor for FakeExecutor {
    async fn apply(&self, subject: &str, action: ActionKind) -> Result<bool> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((subject.to_string(), action));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !action.mutates() {
            return Ok(false);
        }
        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(subject).and_then(|q| q.pop_front()));
        Ok(scripted.unwrap_or(self.default_outcome))
    }
}
