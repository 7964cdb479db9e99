//! Container runtime state (docker / podman)

use anyhow::{Context, Result};
use async_trait::async_trait;
use medic_common::{Issue, IssueKind, Severity};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use super::Collector;
use crate::config::ContainerCollectorConfig;

static EXIT_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)exited \((\d+)\)").expect("valid exit code regex"));

pub struct ContainerStatusPoller {
    runtime: String,
    containers: Vec<String>,
}

impl ContainerStatusPoller {
    pub fn new(config: &ContainerCollectorConfig, runtime: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            containers: config.containers.clone(),
        }
    }
}

#[async_trait]
impl Collector for ContainerStatusPoller {
    fn name(&self) -> &str {
        "containers"
    }

    async fn poll(&self) -> Result<Vec<Issue>> {
        let output = Command::new(&self.runtime)
            .args(["ps", "-a", "--format", "{{.Names}}\t{{.State}}\t{{.Status}}"])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {} ps", self.runtime))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} ps exited with {}: {}",
                self.runtime,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let issues: Vec<Issue> = parse_container_ps(&stdout, self.name())
            .into_iter()
            .filter(|i| self.containers.is_empty() || self.containers.contains(&i.subject))
            .collect();
        debug!("containers: {} unhealthy", issues.len());
        Ok(issues)
    }
}

/// Parse `ps --format '{{.Names}}\t{{.State}}\t{{.Status}}'` output.
///
/// Reported: exited with a non-zero code, restarting, dead, unhealthy.
/// A clean `Exited (0)` is a finished job, not a crash.
pub fn parse_container_ps(stdout: &str, source: &str) -> Vec<Issue> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let name = cols.next()?.trim();
            let state = cols.next()?.trim().to_lowercase();
            let status = cols.next().unwrap_or("").trim();
            if name.is_empty() {
                return None;
            }

            let severity = match state.as_str() {
                "restarting" | "dead" => Severity::Critical,
                "exited" => {
                    let code = EXIT_CODE_RE
                        .captures(status)
                        .and_then(|c| c[1].parse::<i32>().ok())
                        .unwrap_or(0);
                    if code == 0 {
                        return None;
                    }
                    Severity::Critical
                }
                "running" if status.to_lowercase().contains("(unhealthy)") => Severity::Warning,
                _ => return None,
            };

            Some(
                Issue::new(
                    source,
                    IssueKind::ContainerCrash,
                    name,
                    format!("container {} is {}: {}", name, state, status),
                )
                .with_severity(severity),
            )
        })
        .collect()
}
