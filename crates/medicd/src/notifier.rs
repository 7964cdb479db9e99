//! Escalation and notification gateway.
//!
//! Two tiers:
//! - Immediate: every channel is tried with retries; if none accepts the
//!   message it is appended to a local JSONL file. Escalations are never
//!   dropped.
//! - Batched: queued in memory and sent as one digest by `flush_batch`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medic_common::{MedicError, MedicResult};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::NotifyConfig;

/// Delivery urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Immediate,
    Batched,
}

/// Message payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(title: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subject: subject.into(),
            body: body.into(),
            evidence: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Where a notification ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Name of the first channel that accepted it, `fallback` or `batch`
    pub channel: String,
    /// Stable id, stored on escalated tasks
    pub reference: String,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, reference: &str, notification: &Notification) -> Result<()>;
}

// ============================================================================
// Channels
// ============================================================================

/// Writes notifications to the daemon log
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, reference: &str, notification: &Notification) -> Result<()> {
        warn!(
            target: "medicd::notify",
            reference,
            subject = %notification.subject,
            "{}: {}",
            notification.title,
            notification.body
        );
        for line in &notification.evidence {
            info!(target: "medicd::notify", reference, "  {}", line);
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    reference: &'a str,
    #[serde(flatten)]
    notification: &'a Notification,
}

/// POSTs notifications as JSON
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, reference: &str, notification: &Notification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookPayload {
                reference,
                notification,
            })
            .send()
            .await
            .context("webhook unreachable")?
            .error_for_status()
            .context("webhook rejected notification")?;
        Ok(())
    }
}

/// Keeps every notification in memory; can be told to fail
#[derive(Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<(String, Notification)>>>,
    calls: Arc<AtomicUsize>,
    failing: bool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose every send errors
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Delivered (reference, notification) pairs
    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Send attempts, failed ones included
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, reference: &str, notification: &Notification) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            anyhow::bail!("recording channel set to fail");
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((reference.to_string(), notification.clone()));
        }
        Ok(())
    }
}

// ============================================================================
// Gateway
// ============================================================================

#[derive(Serialize)]
struct FallbackRecord<'a> {
    reference: &'a str,
    tier: Tier,
    #[serde(flatten)]
    notification: &'a Notification,
}

pub struct NotificationGateway {
    channels: Vec<Arc<dyn NotificationChannel>>,
    retries: u32,
    backoff: Duration,
    fallback_log: PathBuf,
    batch: Mutex<Vec<Notification>>,
}

impl NotificationGateway {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, config: &NotifyConfig) -> Self {
        Self {
            channels,
            retries: config.retries.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            fallback_log: config.fallback_log.clone(),
            batch: Mutex::new(Vec::new()),
        }
    }

    /// Webhook when configured, otherwise the daemon log
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        let channel: Arc<dyn NotificationChannel> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookChannel::new(
                url,
                Duration::from_secs(config.timeout_secs.max(1)),
            )?),
            None => Arc::new(LogChannel),
        };
        Ok(Self::new(vec![channel], config))
    }

    pub async fn notify(&self, tier: Tier, notification: Notification) -> MedicResult<Delivery> {
        let reference = format!("medic-{}", uuid::Uuid::new_v4());
        match tier {
            Tier::Immediate => self.deliver(reference, tier, &notification).await,
            Tier::Batched => {
                self.batch
                    .lock()
                    .map_err(|_| MedicError::Notify("batch queue poisoned".to_string()))?
                    .push(notification);
                Ok(Delivery {
                    channel: "batch".to_string(),
                    reference,
                })
            }
        }
    }

    /// Number of queued batched notifications
    pub fn pending(&self) -> usize {
        self.batch.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Send everything queued as one digest. Returns how many were included.
    pub async fn flush_batch(&self) -> MedicResult<usize> {
        let queued: Vec<Notification> = {
            let mut batch = self
                .batch
                .lock()
                .map_err(|_| MedicError::Notify("batch queue poisoned".to_string()))?;
            std::mem::take(&mut *batch)
        };
        if queued.is_empty() {
            return Ok(0);
        }

        let digest = Notification::new(
            format!("medic digest: {} event(s)", queued.len()),
            "digest",
            queued
                .iter()
                .map(|n| format!("[{}] {}: {}", n.subject, n.title, n.body))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        let reference = format!("digest-{}", uuid::Uuid::new_v4());
        self.deliver(reference, Tier::Batched, &digest).await?;
        Ok(queued.len())
    }

    async fn deliver(
        &self,
        reference: String,
        tier: Tier,
        notification: &Notification,
    ) -> MedicResult<Delivery> {
        let mut delivered_via: Option<String> = None;

        for channel in &self.channels {
            let mut backoff = self.backoff;
            for attempt in 1..=self.retries {
                match channel.send(&reference, notification).await {
                    Ok(()) => {
                        delivered_via.get_or_insert_with(|| channel.name().to_string());
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "Channel {} failed ({}/{}): {:#}",
                            channel.name(),
                            attempt,
                            self.retries,
                            e
                        );
                        if attempt < self.retries {
                            tokio::time::sleep(backoff).await;
                            backoff = backoff.saturating_mul(2);
                        }
                    }
                }
            }
        }

        if let Some(channel) = delivered_via {
            info!("Notification {} delivered via {}", reference, channel);
            return Ok(Delivery { channel, reference });
        }

        self.write_fallback(&reference, tier, notification)?;
        error!(
            reference = %reference,
            subject = %notification.subject,
            "All notification channels failed, wrote to {}: {}",
            self.fallback_log.display(),
            notification.title
        );
        Ok(Delivery {
            channel: "fallback".to_string(),
            reference,
        })
    }

    fn write_fallback(&self, reference: &str, tier: Tier, notification: &Notification) -> MedicResult<()> {
        if let Some(parent) = self.fallback_log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&FallbackRecord {
            reference,
            tier,
            notification,
        })?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_log)
            .map_err(|e| {
                MedicError::Notify(format!(
                    "cannot open fallback log {}: {}",
                    self.fallback_log.display(),
                    e
                ))
            })?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}
