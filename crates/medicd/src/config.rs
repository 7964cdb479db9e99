//! Configuration management for medicd.
//!
//! Loads settings from /etc/medic/config.toml or uses defaults. Every field
//! has a serde default so partial files are fine.

use anyhow::{Context, Result};
use medic_common::paths::{CONFIG_PATH, DB_PATH, DEFAULT_CONFIG_PATH, FALLBACK_LOG_PATH};
use medic_common::{ActionKind, IssueKind, Severity};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Control loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Seconds between cycles
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Hard budget for remediating one task, all stages included
    #[serde(default = "default_task_budget")]
    pub task_budget_secs: u64,

    /// Per-collector poll timeout
    #[serde(default = "default_collector_timeout")]
    pub collector_timeout_secs: u64,

    /// Flush the batched notification queue every N cycles
    #[serde(default = "default_digest_every")]
    pub digest_every_cycles: u64,
}

fn default_interval() -> u64 {
    300 // 5 minutes
}

fn default_workers() -> usize {
    4
}

fn default_task_budget() -> u64 {
    180
}

fn default_collector_timeout() -> u64 {
    30
}

fn default_digest_every() -> u64 {
    12 // hourly at the default interval
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            workers: default_workers(),
            task_budget_secs: default_task_budget(),
            collector_timeout_secs: default_collector_timeout(),
            digest_every_cycles: default_digest_every(),
        }
    }
}

impl CoordinatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn task_budget(&self) -> Duration {
        Duration::from_secs(self.task_budget_secs.max(1))
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_secs(self.collector_timeout_secs.max(1))
    }
}

/// Task/learning store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// SQLite lock-wait timeout. Must stay well above the hold time of a
    /// concurrent writer; a zero timeout yields spurious "database is locked".
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,

    /// First backoff step when a statement still hits SQLITE_BUSY
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// A closed task whose hash reappears after this many hours becomes a new
    /// task. 0 disables reopening.
    #[serde(default = "default_reopen_after")]
    pub reopen_after_hours: u64,

    /// Closed tasks (and their attempts) older than this are pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DB_PATH)
}

fn default_busy_timeout() -> u64 {
    30
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_reopen_after() -> u64 {
    24
}

fn default_retention_days() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_secs: default_busy_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            reopen_after_hours: default_reopen_after(),
            retention_days: default_retention_days(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }

    pub fn reopen_after(&self) -> Option<chrono::Duration> {
        (self.reopen_after_hours > 0).then(|| chrono::Duration::hours(self.reopen_after_hours as i64))
    }
}

/// Graduated remediation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_learned_min")]
    pub learned_min_confidence: f64,

    #[serde(default = "default_oracle_min")]
    pub oracle_min_confidence: f64,

    #[serde(default = "default_research_min")]
    pub research_min_confidence: f64,

    /// Failed or inconclusive attempts on a task before consensus is tried
    #[serde(default = "default_consensus_after")]
    pub consensus_after_failures: u32,

    /// Timeout for each oracle / research call
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    /// Attempts per (signature, strategy) used for learned confidence
    #[serde(default = "default_pattern_window")]
    pub pattern_window: usize,
}

fn default_learned_min() -> f64 {
    0.6
}

fn default_oracle_min() -> f64 {
    0.6
}

fn default_research_min() -> f64 {
    0.5
}

fn default_consensus_after() -> u32 {
    3
}

fn default_stage_timeout() -> u64 {
    45
}

fn default_pattern_window() -> usize {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            learned_min_confidence: default_learned_min(),
            oracle_min_confidence: default_oracle_min(),
            research_min_confidence: default_research_min(),
            consensus_after_failures: default_consensus_after(),
            stage_timeout_secs: default_stage_timeout(),
            pattern_window: default_pattern_window(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs.max(1))
    }
}

/// Self-monitoring thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetacognitionConfig {
    /// Attempts per subject considered
    #[serde(default = "default_meta_window")]
    pub window: usize,

    /// Stuck when the success rate is strictly below this
    #[serde(default = "default_stuck_rate")]
    pub stuck_rate: f64,

    /// Stuck when one error signature shows up at least this often
    #[serde(default = "default_repeated_error_min")]
    pub repeated_error_min: usize,

    /// Notify when confidence is strictly above this
    #[serde(default = "default_escalate_confidence")]
    pub escalate_confidence: f64,

    /// A stuck subject counts as recovered at this success rate
    #[serde(default = "default_recovery_rate")]
    pub recovery_rate: f64,
}

fn default_meta_window() -> usize {
    10
}

fn default_stuck_rate() -> f64 {
    0.10
}

fn default_repeated_error_min() -> usize {
    5
}

fn default_escalate_confidence() -> f64 {
    0.85
}

fn default_recovery_rate() -> f64 {
    0.5
}

impl Default for MetacognitionConfig {
    fn default() -> Self {
        Self {
            window: default_meta_window(),
            stuck_rate: default_stuck_rate(),
            repeated_error_min: default_repeated_error_min(),
            escalate_confidence: default_escalate_confidence(),
            recovery_rate: default_recovery_rate(),
        }
    }
}

/// Notification channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// POST JSON payloads here when set
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Delivery attempts per channel
    #[serde(default = "default_notify_retries")]
    pub retries: u32,

    #[serde(default = "default_notify_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,

    /// Last-resort sink when every channel failed
    #[serde(default = "default_fallback_log")]
    pub fallback_log: PathBuf,
}

fn default_notify_retries() -> u32 {
    3
}

fn default_notify_backoff() -> u64 {
    500
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_fallback_log() -> PathBuf {
    PathBuf::from(FALLBACK_LOG_PATH)
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            retries: default_notify_retries(),
            retry_backoff_ms: default_notify_backoff(),
            timeout_secs: default_notify_timeout(),
            fallback_log: default_fallback_log(),
        }
    }
}

/// A diagnosis or research HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
}

/// Runbook entry consulted by the research fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookEntry {
    pub signature: String,
    pub action: ActionKind,
    #[serde(default = "default_runbook_confidence")]
    pub confidence: f64,
    /// Only applies to subjects starting with this prefix
    #[serde(default)]
    pub subject_prefix: Option<String>,
    /// Where the fix comes from (doc URL, ticket)
    #[serde(default)]
    pub reference: Option<String>,
}

fn default_runbook_confidence() -> f64 {
    0.6
}

/// External knowledge used by the research fallback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchConfig {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    pub runbook: Vec<RunbookEntry>,
}

/// Remediation action settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Log actions instead of executing them
    #[serde(default)]
    pub dry_run: bool,

    /// Container runtime binary
    #[serde(default = "default_runtime")]
    pub container_runtime: String,

    /// Wait before checking whether a restart stuck
    #[serde(default = "default_verify_delay")]
    pub verify_delay_secs: u64,
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_verify_delay() -> u64 {
    5
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            container_runtime: default_runtime(),
            verify_delay_secs: default_verify_delay(),
        }
    }
}

/// One log pattern: a regex plus how to classify its matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPatternConfig {
    pub name: String,
    pub regex: String,
    pub kind: IssueKind,
    #[serde(default = "default_pattern_severity")]
    pub severity: Severity,
}

fn default_pattern_severity() -> Severity {
    Severity::Warning
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogCollectorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Empty means the built-in set
    #[serde(default)]
    pub patterns: Vec<LogPatternConfig>,

    /// Cap on issues returned per poll, so a log storm cannot flood the store
    #[serde(default = "default_max_issues")]
    pub max_issues_per_poll: usize,
}

fn default_max_issues() -> usize {
    200
}

impl Default for LogCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: Vec::new(),
            patterns: Vec::new(),
            max_issues_per_poll: default_max_issues(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCollectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Only report these units; empty means every failed unit
    #[serde(default)]
    pub units: Vec<String>,
}

impl Default for ServiceCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            units: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerCollectorConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Only report these containers; empty means all
    #[serde(default)]
    pub containers: Vec<String>,
}

impl Default for ContainerCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            containers: Vec::new(),
        }
    }
}

/// One HTTP health target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTargetConfig {
    /// Subject reported for failures; defaults to the URL
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    /// GET or HEAD
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCollectorConfig {
    #[serde(default)]
    pub targets: Vec<HttpTargetConfig>,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    10
}

impl Default for HttpCollectorConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorsConfig {
    #[serde(default)]
    pub logs: LogCollectorConfig,

    #[serde(default)]
    pub services: ServiceCollectorConfig,

    #[serde(default)]
    pub containers: ContainerCollectorConfig,

    #[serde(default)]
    pub http: HttpCollectorConfig,
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub metacognition: MetacognitionConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub actions: ActionsConfig,

    /// Diagnosis oracles; the first one is the single-oracle stage
    #[serde(default)]
    pub oracles: Vec<EndpointConfig>,

    #[serde(default)]
    pub research: ResearchConfig,

    #[serde(default)]
    pub collectors: CollectorsConfig,
}

impl Config {
    /// Load config from the system path, then the fallback path, then defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from an explicit path; unlike `load`, a bad file is an error
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save default config to path (for init)
    pub fn save_default(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(&Config::default())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        info!("Saved default config to {}", path.display());
        Ok(())
    }

    /// Reject values that would break the loop's invariants
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.workers == 0 {
            anyhow::bail!("coordinator.workers must be at least 1");
        }
        if self.metacognition.window == 0 || self.pipeline.pattern_window == 0 {
            anyhow::bail!("metacognition.window and pipeline.pattern_window must be positive");
        }
        for (name, value) in [
            ("pipeline.learned_min_confidence", self.pipeline.learned_min_confidence),
            ("pipeline.oracle_min_confidence", self.pipeline.oracle_min_confidence),
            ("pipeline.research_min_confidence", self.pipeline.research_min_confidence),
            ("metacognition.stuck_rate", self.metacognition.stuck_rate),
            ("metacognition.escalate_confidence", self.metacognition.escalate_confidence),
            ("metacognition.recovery_rate", self.metacognition.recovery_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be within 0.0..=1.0 (got {})", name, value);
            }
        }
        for pattern in &self.collectors.logs.patterns {
            regex::Regex::new(&pattern.regex)
                .with_context(|| format!("Invalid regex for log pattern '{}'", pattern.name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.coordinator.interval_secs, 300);
        assert_eq!(config.coordinator.workers, 4);
        assert_eq!(config.store.busy_timeout_secs, 30);
        assert_eq!(config.metacognition.window, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[coordinator]
interval_secs = 60
workers = 2

[store]
path = "/tmp/medic-test.db"
reopen_after_hours = 0

[[oracles]]
name = "primary"
url = "http://127.0.0.1:9000/diagnose"

[[research.runbook]]
signature = "docker_dns_failure"
action = "restart_container"
confidence = 0.7

[[collectors.logs.patterns]]
name = "segv"
regex = "segfault"
kind = "log_error"
severity = "critical"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.coordinator.interval_secs, 60);
        assert_eq!(config.coordinator.workers, 2);
        // Defaults for missing fields
        assert_eq!(config.coordinator.task_budget_secs, 180);
        assert!(config.store.reopen_after().is_none());
        assert_eq!(config.oracles[0].name, "primary");
        assert_eq!(config.research.runbook[0].action, ActionKind::RestartContainer);
        assert_eq!(config.collectors.logs.patterns[0].severity, Severity::Critical);
        assert!(config.collectors.services.enabled);
    }

    #[test]
    fn test_reopen_window() {
        let store = StoreConfig::default();
        assert_eq!(store.reopen_after(), Some(chrono::Duration::hours(24)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.coordinator.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.oracle_min_confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.collectors.logs.patterns.push(LogPatternConfig {
            name: "broken".to_string(),
            regex: "(unclosed".to_string(),
            kind: IssueKind::LogError,
            severity: Severity::Warning,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        Config::save_default(&path).unwrap();
        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.coordinator.workers, 4);
    }
}
