//! Research fallback: cheap, non-oracle knowledge sources.
//!
//! The runbook is local config; the HTTP source queries a knowledge endpoint
//! that answers with a list of candidates.

use anyhow::{Context, Result};
use async_trait::async_trait;
use medic_common::ActionKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{EndpointConfig, RunbookEntry};
use crate::oracle::IssueContext;

/// A candidate fix found by research
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub action: ActionKind,
    pub confidence: f64,
    /// Where the suggestion came from
    #[serde(default)]
    pub source: String,
}

#[async_trait]
pub trait ResearchSource: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, ctx: &IssueContext) -> Result<Vec<Candidate>>;
}

/// Operator-maintained runbook from the config file
pub struct RunbookSource {
    entries: Vec<RunbookEntry>,
}

impl RunbookSource {
    pub fn new(entries: Vec<RunbookEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl ResearchSource for RunbookSource {
    fn name(&self) -> &str {
        "runbook"
    }

    async fn search(&self, ctx: &IssueContext) -> Result<Vec<Candidate>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.signature == ctx.signature || e.signature == ctx.kind.as_str())
            .filter(|e| {
                e.subject_prefix
                    .as_deref()
                    .map_or(true, |prefix| ctx.subject.starts_with(prefix))
            })
            .map(|e| Candidate {
                action: e.action,
                confidence: e.confidence.clamp(0.0, 1.0),
                source: e
                    .reference
                    .clone()
                    .unwrap_or_else(|| format!("runbook:{}", e.signature)),
            })
            .collect())
    }
}

/// Knowledge endpoint: POST `IssueContext`, read `[Candidate]`
pub struct HttpResearchSource {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpResearchSource {
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
impl ResearchSource for HttpResearchSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, ctx: &IssueContext) -> Result<Vec<Candidate>> {
        let candidates: Vec<Candidate> = self
            .client
            .post(&self.url)
            .json(ctx)
            .send()
            .await
            .with_context(|| format!("research source {} unreachable", self.name))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("research source {} sent invalid candidates", self.name))?;
        Ok(candidates
            .into_iter()
            .map(|mut c| {
                c.confidence = c.confidence.clamp(0.0, 1.0);
                if c.source.is_empty() {
                    c.source = self.name.clone();
                }
                c
            })
            .collect())
    }
}

/// Highest-confidence candidate; ties go to the earlier one
pub fn best_candidate(candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates.into_iter().fold(None, |best, c| match best {
        Some(b) if b.confidence >= c.confidence => Some(b),
        _ => Some(c),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use medic_common::IssueKind;

    fn ctx(subject: &str, signature: &str) -> IssueContext {
        IssueContext {
            task_id: 1,
            subject: subject.to_string(),
            kind: IssueKind::ContainerCrash,
            signature: signature.to_string(),
            message: String::new(),
            detection_count: 1,
            history: Vec::new(),
        }
    }

    fn entry(signature: &str, action: ActionKind, confidence: f64, prefix: Option<&str>) -> RunbookEntry {
        RunbookEntry {
            signature: signature.to_string(),
            action,
            confidence,
            subject_prefix: prefix.map(str::to_string),
            reference: None,
        }
    }

    #[tokio::test]
    async fn test_runbook_matches_signature_and_prefix() {
        let source = RunbookSource::new(vec![
            entry("docker_dns_failure", ActionKind::RestartContainer, 0.7, None),
            entry("docker_dns_failure", ActionKind::DiagnoseOnly, 0.9, Some("db-")),
            entry("port_in_use", ActionKind::RestartService, 0.8, None),
            entry("container_crash", ActionKind::RestartContainer, 0.4, None),
        ]);

        let found = source.search(&ctx("web", "docker_dns_failure")).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].source, "runbook:docker_dns_failure");

        let found = source.search(&ctx("db-main", "docker_dns_failure")).await.unwrap();
        assert_eq!(found.len(), 3);
        let best = best_candidate(found).unwrap();
        assert_eq!(best.action, ActionKind::DiagnoseOnly);
    }

    #[test]
    fn test_best_candidate_tie_keeps_first() {
        let a = Candidate {
            action: ActionKind::RestartService,
            confidence: 0.6,
            source: "a".to_string(),
        };
        let b = Candidate {
            source: "b".to_string(),
            ..a.clone()
        };
        assert_eq!(best_candidate(vec![a, b]).unwrap().source, "a");
        assert!(best_candidate(Vec::new()).is_none());
    }
}
