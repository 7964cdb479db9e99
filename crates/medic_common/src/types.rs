//! Core data model: issues, tasks, fix attempts, learned patterns, stuck states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Implements `as_str`, `Display` and `FromStr` for a snake_case enum so it can
/// round-trip through SQLite text columns.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn all() -> &'static [$name] {
                &[$($name::$variant),+]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

/// What kind of anomaly a collector observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ServiceFailure,
    ContainerCrash,
    HttpFailure,
    LogError,
    ResourcePressure,
    MemoryLeakSuspect,
    PortConflict,
}

string_enum!(IssueKind {
    ServiceFailure => "service_failure",
    ContainerCrash => "container_crash",
    HttpFailure => "http_failure",
    LogError => "log_error",
    ResourcePressure => "resource_pressure",
    MemoryLeakSuspect => "memory_leak_suspect",
    PortConflict => "port_conflict",
});

impl IssueKind {
    /// Action a naive operator would try first for this kind of problem
    pub fn default_action(&self) -> ActionKind {
        match self {
            IssueKind::ServiceFailure | IssueKind::PortConflict => ActionKind::RestartService,
            IssueKind::ContainerCrash | IssueKind::MemoryLeakSuspect => {
                ActionKind::RestartContainer
            }
            IssueKind::HttpFailure | IssueKind::LogError | IssueKind::ResourcePressure => {
                ActionKind::DiagnoseOnly
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

string_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

/// One raw observation from a collector. Never persisted; folded into a Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Collector identity
    pub source: String,
    pub kind: IssueKind,
    pub message: String,
    /// Service, container or endpoint the issue is about
    pub subject: String,
    pub observed_at: DateTime<Utc>,
    pub severity: Severity,
}

impl Issue {
    pub fn new(
        source: impl Into<String>,
        kind: IssueKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            kind,
            message: message.into(),
            subject: subject.into(),
            observed_at: Utc::now(),
            severity: Severity::Warning,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }
}

/// Task lifecycle.
///
/// ```text
/// detected ──remediate──▶ attempted ──stuck──▶ escalated
///     │                    ▲     │                 │
///     │                    └─────┼───recovered─────┘
///     └──────────── verified_fixed ──────────────▶ closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Detected,
    Attempted,
    Escalated,
    Closed,
}

string_enum!(TaskStatus {
    Detected => "detected",
    Attempted => "attempted",
    Escalated => "escalated",
    Closed => "closed",
});

impl TaskStatus {
    /// Transitions allowed by the automatic loop.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Closed, _) => false,
            (Detected | Attempted | Escalated, Attempted) => true,
            (Attempted, Escalated) => true,
            (_, Closed) => true,
            _ => false,
        }
    }

    /// Transitions a human may force on top of the automatic ones.
    pub fn can_force_to(&self, to: TaskStatus) -> bool {
        self.can_transition_to(to) || matches!((self, to), (TaskStatus::Detected, TaskStatus::Escalated))
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, TaskStatus::Closed)
    }
}

/// Durable unit of work: one deduplicated operational problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// Deduplication key
    pub issue_hash: String,
    pub kind: IssueKind,
    pub subject: String,
    /// Failure class used to look up learned patterns
    pub signature: String,
    /// Most recently observed message
    pub message: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub detection_count: u32,
    pub status: TaskStatus,
    pub fix_attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// External ticket / notification reference
    pub escalation_ref: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

/// Remediation strategy, in cost order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LearnedPattern,
    SingleOracle,
    MultiOracle,
    ResearchFallback,
    Manual,
}

string_enum!(Strategy {
    LearnedPattern => "learned_pattern",
    SingleOracle => "single_oracle",
    MultiOracle => "multi_oracle",
    ResearchFallback => "research_fallback",
    Manual => "manual",
});

/// The only things medic is allowed to do to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RestartService,
    RestartContainer,
    DiagnoseOnly,
}

string_enum!(ActionKind {
    RestartService => "restart_service",
    RestartContainer => "restart_container",
    DiagnoseOnly => "diagnose_only",
});

impl ActionKind {
    /// Whether executing this action mutates external state
    pub fn mutates(&self) -> bool {
        !matches!(self, ActionKind::DiagnoseOnly)
    }
}

/// One immutable record of trying (or deciding not to try) a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    pub id: i64,
    pub task_id: i64,
    pub subject: String,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub strategy: Strategy,
    pub action: Option<ActionKind>,
    /// Whether an action was actually executed
    pub applied: bool,
    /// `None` when nothing was executed
    pub success: Option<bool>,
    /// Pre-execution belief, 0.0..=1.0
    pub confidence: f64,
    pub error_signature: Option<String>,
    pub rationale: Option<String>,
    /// Strategy whose learned pattern a replay re-ran
    #[serde(default)]
    pub replay_of: Option<Strategy>,
}

impl FixAttempt {
    pub fn succeeded(&self) -> bool {
        self.success == Some(true)
    }
}

/// Insert payload for a FixAttempt; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewFixAttempt {
    pub task_id: i64,
    pub subject: String,
    pub signature: String,
    pub strategy: Strategy,
    pub action: Option<ActionKind>,
    pub applied: bool,
    pub success: Option<bool>,
    pub confidence: f64,
    pub error_signature: Option<String>,
    pub rationale: Option<String>,
    pub replay_of: Option<Strategy>,
}

impl NewFixAttempt {
    /// A stage that looked at the task but did not execute anything
    pub fn skipped(task: &Task, strategy: Strategy, confidence: f64) -> Self {
        Self {
            task_id: task.id,
            subject: task.subject.clone(),
            signature: task.signature.clone(),
            strategy,
            action: None,
            applied: false,
            success: None,
            confidence: confidence.clamp(0.0, 1.0),
            error_signature: None,
            rationale: None,
            replay_of: None,
        }
    }

    /// A stage that executed `action` and observed `success`
    pub fn applied(
        task: &Task,
        strategy: Strategy,
        action: ActionKind,
        confidence: f64,
        success: bool,
    ) -> Self {
        Self {
            action: Some(action),
            applied: true,
            success: Some(success),
            error_signature: (!success).then(|| task.signature.clone()),
            ..Self::skipped(task, strategy, confidence)
        }
    }

    pub fn with_action(mut self, action: ActionKind) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_error(mut self, error_signature: impl Into<String>) -> Self {
        self.error_signature = Some(error_signature.into());
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// Mark this attempt as a replay of another strategy's pattern
    pub fn replaying(mut self, source: Option<Strategy>) -> Self {
        self.replay_of = source.filter(|s| *s != self.strategy);
        self
    }
}

/// Sliding-window aggregate per (signature, strategy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub signature: String,
    pub strategy: Strategy,
    pub success_count: u32,
    pub attempt_count: u32,
    pub confidence: f64,
    /// Most recent action that worked for this key
    pub last_action: Option<ActionKind>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a stuck check. Recomputed every time, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckState {
    pub subject: String,
    pub is_stuck: bool,
    pub reason: String,
    pub confidence: f64,
    pub success_rate: f64,
    /// Attempts the verdict is based on
    pub window_len: usize,
    pub evidence: Vec<String>,
    pub recommendations: Vec<String>,
    pub should_escalate: bool,
}

impl StuckState {
    pub fn not_stuck(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            is_stuck: false,
            reason: reason.into(),
            confidence: 0.0,
            success_rate: 0.0,
            window_len: 0,
            evidence: Vec::new(),
            recommendations: Vec::new(),
            should_escalate: false,
        }
    }
}
