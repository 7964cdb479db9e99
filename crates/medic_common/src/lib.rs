//! Shared types for the medic healing orchestrator.
//!
//! Used by both the daemon (`medicd`) and the operator CLI (`medicctl`).

pub mod dedup;
pub mod error;
pub mod paths;
pub mod types;

pub use dedup::{canonicalize, classify_signature, normalize_message};
pub use error::{MedicError, MedicResult};
pub use types::{
    ActionKind, FixAttempt, Issue, IssueKind, LearnedPattern, NewFixAttempt, Severity, Strategy,
    StuckState, Task, TaskStatus,
};
