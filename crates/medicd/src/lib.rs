//! medicd - autonomous healing daemon
//!
//! Detects problems on services and containers, folds them into durable
//! tasks, tries graduated fixes and escalates to a human when it notices it
//! is not getting anywhere.

pub mod actions;
pub mod collectors;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod metacognition;
pub mod notifier;
pub mod oracle;
pub mod pipeline;
pub mod research;
pub mod store;

pub use config::Config;
pub use coordinator::{Coordinator, CycleReport};
pub use pipeline::{Pipeline, RemediationReport};
pub use store::{LearningStore, TaskStore};
