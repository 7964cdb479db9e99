//! Failed systemd units

use anyhow::{Context, Result};
use async_trait::async_trait;
use medic_common::{Issue, IssueKind, Severity};
use tokio::process::Command;
use tracing::debug;

use super::Collector;
use crate::config::ServiceCollectorConfig;

pub struct ServiceStatusPoller {
    units: Vec<String>,
}

impl ServiceStatusPoller {
    pub fn new(config: &ServiceCollectorConfig) -> Self {
        Self {
            units: config.units.clone(),
        }
    }
}

#[async_trait]
impl Collector for ServiceStatusPoller {
    fn name(&self) -> &str {
        "services"
    }

    async fn poll(&self) -> Result<Vec<Issue>> {
        let output = Command::new("systemctl")
            .args(["list-units", "--failed", "--no-legend", "--plain", "--no-pager"])
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to get failed units")?;
        if !output.status.success() {
            anyhow::bail!(
                "systemctl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let issues: Vec<Issue> = parse_failed_units(&stdout)
            .into_iter()
            .filter(|(unit, _)| self.units.is_empty() || self.units.iter().any(|u| unit_matches(u, unit)))
            .map(|(unit, description)| {
                Issue::new(
                    self.name(),
                    IssueKind::ServiceFailure,
                    unit.clone(),
                    format!("{} failed: {}", unit, description),
                )
                .with_severity(Severity::Critical)
            })
            .collect();
        debug!("services: {} failed unit(s)", issues.len());
        Ok(issues)
    }
}

/// "nginx" in the allow-list matches "nginx.service"
fn unit_matches(allowed: &str, unit: &str) -> bool {
    allowed == unit || unit.strip_suffix(".service") == Some(allowed)
}

/// Parse `systemctl list-units --failed --no-legend --plain` output into
/// `(unit, description)` pairs.
///
/// Columns: UNIT LOAD ACTIVE SUB DESCRIPTION...
pub fn parse_failed_units(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            // Older systemd prints a bullet in front of the unit
            let mut unit = parts.next()?;
            if unit == "●" || unit == "*" {
                unit = parts.next()?;
            }
            let rest: Vec<&str> = parts.collect();
            let description = if rest.len() > 3 {
                rest[3..].join(" ")
            } else {
                rest.join(" ")
            };
            Some((unit.to_string(), description))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failed_units() {
        let out = "nginx.service   loaded failed failed A high performance web server\n\
                   ● backup.timer loaded failed failed Nightly backup\n\
                   \n";
        let units = parse_failed_units(out);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].0, "nginx.service");
        assert_eq!(units[0].1, "A high performance web server");
        assert_eq!(units[1].0, "backup.timer");
        assert_eq!(units[1].1, "Nightly backup");
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_failed_units("").is_empty());
    }

    #[test]
    fn test_allow_list_matching() {
        assert!(unit_matches("nginx", "nginx.service"));
        assert!(unit_matches("nginx.service", "nginx.service"));
        assert!(!unit_matches("nginx", "nginx-exporter.service"));
    }
}
