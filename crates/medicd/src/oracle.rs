//! Diagnosis oracles: external "experts" asked to propose a fix.

use anyhow::{Context, Result};
use async_trait::async_trait;
use medic_common::{ActionKind, FixAttempt, IssueKind, Strategy, Task};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EndpointConfig;

/// What an oracle gets to look at. Also the JSON body sent to HTTP oracles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueContext {
    pub task_id: i64,
    pub subject: String,
    pub kind: IssueKind,
    pub signature: String,
    pub message: String,
    pub detection_count: u32,
    /// Previous attempts on this task, oldest first
    pub history: Vec<AttemptSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub strategy: Strategy,
    pub action: Option<ActionKind>,
    pub applied: bool,
    pub success: Option<bool>,
}

impl IssueContext {
    pub fn new(task: &Task, attempts: &[FixAttempt]) -> Self {
        Self {
            task_id: task.id,
            subject: task.subject.clone(),
            kind: task.kind,
            signature: task.signature.clone(),
            message: task.message.clone(),
            detection_count: task.detection_count,
            history: attempts
                .iter()
                .map(|a| AttemptSummary {
                    strategy: a.strategy,
                    action: a.action,
                    applied: a.applied,
                    success: a.success,
                })
                .collect(),
        }
    }
}

/// An oracle's proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub action: ActionKind,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

impl Diagnosis {
    pub fn new(action: ActionKind, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            action,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
        }
    }
}

#[async_trait]
pub trait DiagnosisOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn diagnose(&self, ctx: &IssueContext) -> Result<Diagnosis>;
}

/// Oracle behind an HTTP endpoint: POST `IssueContext`, read `Diagnosis`
pub struct HttpOracle {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpOracle {
    pub fn new(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            name: endpoint.name.clone(),
            url: endpoint.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl DiagnosisOracle for HttpOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn diagnose(&self, ctx: &IssueContext) -> Result<Diagnosis> {
        let response = self
            .client
            .post(&self.url)
            .json(ctx)
            .send()
            .await
            .with_context(|| format!("oracle {} unreachable", self.name))?
            .error_for_status()
            .with_context(|| format!("oracle {} returned an error", self.name))?;
        let diagnosis: Diagnosis = response
            .json()
            .await
            .with_context(|| format!("oracle {} sent an invalid diagnosis", self.name))?;
        Ok(Diagnosis::new(diagnosis.action, diagnosis.confidence, diagnosis.rationale))
    }
}

/// Canned oracle for tests
#[derive(Clone)]
pub struct FakeOracle {
    name: String,
    response: Option<Diagnosis>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl FakeOracle {
    pub fn answering(name: &str, action: ActionKind, confidence: f64) -> Self {
        Self {
            name: name.to_string(),
            response: Some(Diagnosis::new(action, confidence, format!("{} says so", name))),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always errors, like an unreachable endpoint
    pub fn unavailable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response: None,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep before answering, to exercise timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosisOracle for FakeOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn diagnose(&self, _ctx: &IssueContext) -> Result<Diagnosis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response
            .clone()
            .ok_or_else(|| anyhow::anyhow!("oracle {} unavailable", self.name))
    }
}
