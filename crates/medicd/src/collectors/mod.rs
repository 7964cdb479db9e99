//! Signal collectors: turn logs, unit states, container states and HTTP
//! health checks into `Issue`s.
//!
//! Collectors are polled sequentially by the coordinator. Output parsing is
//! kept in plain functions so it can be tested without the real tools.

mod containers;
mod http;
mod logs;
mod services;

pub use containers::{parse_container_ps, ContainerStatusPoller};
pub use http::HttpProber;
pub use logs::{extract_subject, LogScraper};
pub use services::{parse_failed_units, ServiceStatusPoller};

use anyhow::Result;
use async_trait::async_trait;
use medic_common::Issue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{ActionsConfig, CollectorsConfig};

#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    async fn poll(&self) -> Result<Vec<Issue>>;
}

/// Build the enabled collectors from config
pub fn from_config(
    config: &CollectorsConfig,
    actions: &ActionsConfig,
) -> Result<Vec<Arc<dyn Collector>>> {
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();
    if config.services.enabled {
        collectors.push(Arc::new(ServiceStatusPoller::new(&config.services)));
    }
    if config.containers.enabled {
        collectors.push(Arc::new(ContainerStatusPoller::new(
            &config.containers,
            &actions.container_runtime,
        )));
    }
    if config.logs.enabled && !config.logs.paths.is_empty() {
        collectors.push(Arc::new(LogScraper::new(&config.logs)?));
    }
    if !config.http.targets.is_empty() {
        collectors.push(Arc::new(HttpProber::new(&config.http)?));
    }
    Ok(collectors)
}

/// Scripted collector for tests: each poll pops the next batch
#[derive(Clone)]
pub struct FakeCollector {
    name: String,
    batches: Arc<Mutex<VecDeque<Result<Vec<Issue>, String>>>>,
    polls: Arc<AtomicUsize>,
}

impl FakeCollector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            batches: Arc::new(Mutex::new(VecDeque::new())),
            polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn then_issues(self, issues: Vec<Issue>) -> Self {
        if let Ok(mut b) = self.batches.lock() {
            b.push_back(Ok(issues));
        }
        self
    }

    pub fn then_error(self, message: &str) -> Self {
        if let Ok(mut b) = self.batches.lock() {
            b.push_back(Err(message.to_string()));
        }
        self
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for FakeCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<Vec<Issue>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.batches.lock().ok().and_then(|mut b| b.pop_front());
        match next {
            Some(Ok(issues)) => Ok(issues),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(Vec::new()),
        }
    }
}
