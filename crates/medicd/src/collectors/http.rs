//! HTTP health endpoints

use anyhow::{Context, Result};
use async_trait::async_trait;
use medic_common::{Issue, IssueKind, Severity};
use std::time::Duration;
use tracing::debug;

use super::Collector;
use crate::config::{HttpCollectorConfig, HttpTargetConfig};

pub struct HttpProber {
    targets: Vec<HttpTargetConfig>,
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(config: &HttpCollectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            targets: config.targets.clone(),
            client,
        })
    }

    async fn probe(&self, target: &HttpTargetConfig) -> Option<Issue> {
        let subject = target.name.clone().unwrap_or_else(|| target.url.clone());
        let request = if target.method.eq_ignore_ascii_case("HEAD") {
            self.client.head(&target.url)
        } else {
            self.client.get(&target.url)
        };

        let message = match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!("{} healthy ({})", target.url, response.status());
                return None;
            }
            Ok(response) => format!(
                "{} {} returned HTTP {}",
                target.method.to_uppercase(),
                target.url,
                response.status().as_u16()
            ),
            Err(e) if e.is_timeout() => format!("{} {} timed out", target.method.to_uppercase(), target.url),
            Err(e) if e.is_connect() => {
                format!("{} {}: connection refused ({})", target.method.to_uppercase(), target.url, e)
            }
            Err(e) => format!("{} {} failed: {}", target.method.to_uppercase(), target.url, e),
        };

        Some(
            Issue::new(self.name(), IssueKind::HttpFailure, subject, message)
                .with_severity(Severity::Critical),
        )
    }
}

#[async_trait]
impl Collector for HttpProber {
    fn name(&self) -> &str {
        "http"
    }

    async fn poll(&self) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        for target in &self.targets {
            if let Some(issue) = self.probe(target).await {
                issues.push(issue);
            }
        }
        Ok(issues)
    }
}
