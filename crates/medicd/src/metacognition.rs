//! Metacognition: medic watching its own success rate.
//!
//! A subject is "stuck" when the last `window` attempts on it mostly failed
//! or keep failing the same way. Escalation to a human is edge-triggered per
//! subject; recovery de-escalates and is reported through the batched tier.
//!
//! The edge memory lives in process only. After a restart the first stuck
//! check may notify once more.

use medic_common::{FixAttempt, MedicResult, StuckState, TaskStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::MetacognitionConfig;
use crate::notifier::{Notification, NotificationGateway, Tier};
use crate::store::{self, TaskStore};

pub const REASON_INSUFFICIENT: &str = "insufficient_evidence";
pub const REASON_LOW_SUCCESS: &str = "low_success_rate";
pub const REASON_REPEATED_ERROR: &str = "repeated_error";

/// Something a metacognition pass did
#[derive(Debug, Clone, PartialEq)]
pub enum MetaEvent {
    Escalated {
        subject: String,
        reference: String,
        task_ids: Vec<i64>,
        confidence: f64,
    },
    Recovered {
        subject: String,
        task_ids: Vec<i64>,
        success_rate: f64,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct SubjectMemory {
    /// `should_escalate` on the previous check
    escalating: bool,
    /// Stuck at some point since the last recovery
    stuck: bool,
}

/// Pure stuck verdict over a subject's newest-first attempts
pub fn assess(subject: &str, attempts: &[FixAttempt], config: &MetacognitionConfig) -> StuckState {
    let window: Vec<&FixAttempt> = attempts.iter().take(config.window).collect();
    let successes = window.iter().filter(|a| a.succeeded()).count();

    if window.len() < config.window {
        let mut state = StuckState::not_stuck(subject, REASON_INSUFFICIENT);
        state.window_len = window.len();
        if !window.is_empty() {
            state.success_rate = successes as f64 / window.len() as f64;
        }
        state.evidence.push(format!(
            "{} of {} attempts needed",
            window.len(),
            config.window
        ));
        return state;
    }

    let success_rate = successes as f64 / config.window as f64;

    let mut by_error: HashMap<&str, usize> = HashMap::new();
    for attempt in &window {
        if let Some(sig) = attempt.error_signature.as_deref() {
            *by_error.entry(sig).or_default() += 1;
        }
    }
    // Highest count wins; ties broken by name so the verdict is stable
    let dominant = by_error
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(sig, n)| (sig.to_string(), *n));

    let mut reasons = Vec::new();
    let mut recommendations = Vec::new();
    if success_rate < config.stuck_rate {
        reasons.push(REASON_LOW_SUCCESS.to_string());
        recommendations.push(format!(
            "Automatic remediation keeps failing on {}; inspect it by hand",
            subject
        ));
    }
    if let Some((sig, n)) = &dominant {
        if *n >= config.repeated_error_min {
            reasons.push(format!("{}:{}", REASON_REPEATED_ERROR, sig));
            recommendations.push(recommendation_for(sig));
        }
    }

    let mut evidence = vec![format!(
        "{}/{} recent attempts succeeded",
        successes, config.window
    )];
    if let Some((sig, n)) = &dominant {
        evidence.push(format!("{} seen in {} of {} attempts", sig, n, config.window));
    }

    let is_stuck = !reasons.is_empty();
    let confidence = 1.0 - success_rate;
    StuckState {
        subject: subject.to_string(),
        is_stuck,
        reason: if is_stuck { reasons.join("; ") } else { "healthy".to_string() },
        confidence,
        success_rate,
        window_len: window.len(),
        evidence,
        recommendations,
        should_escalate: is_stuck && confidence > config.escalate_confidence,
    }
}

fn recommendation_for(signature: &str) -> String {
    match signature {
        "docker_dns_failure" => "Check the container network and embedded DNS (docker network inspect)".to_string(),
        "port_in_use" => "Find the process holding the port (ss -ltnp) before restarting".to_string(),
        "oom_killed" => "Raise the memory limit or look for a leak; restarts only reset the clock".to_string(),
        "disk_full" => "Free disk space; restarts cannot fix a full filesystem".to_string(),
        "permission_denied" => "Check file ownership and the unit's User= / volume permissions".to_string(),
        "dependency_failed" => "Fix the failing dependency unit first".to_string(),
        "oracle_unavailable" => "Diagnosis oracles are unreachable; check their endpoints".to_string(),
        "budget_exceeded" => "Remediation keeps running out of time; check for hung restarts or slow oracles".to_string(),
        other => format!("Investigate the recurring '{}' failure manually", other),
    }
}

pub struct Metacognition {
    tasks: Arc<TaskStore>,
    gateway: Arc<NotificationGateway>,
    config: MetacognitionConfig,
    memory: Mutex<HashMap<String, SubjectMemory>>,
}

impl Metacognition {
    pub fn new(
        tasks: Arc<TaskStore>,
        gateway: Arc<NotificationGateway>,
        config: MetacognitionConfig,
    ) -> Self {
        Self {
            tasks,
            gateway,
            config,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Recompute the stuck verdict for a subject from the store
    pub async fn check_stuck(&self, subject: &str) -> MedicResult<StuckState> {
        let (key, window) = (subject.to_string(), self.config.window);
        let attempts =
            store::blocking(&self.tasks, move |s| s.recent_attempts_for_subject(&key, window)).await?;
        Ok(assess(subject, &attempts, &self.config))
    }

    /// Check every subject, escalating and recovering as needed
    pub async fn run_pass(&self, subjects: &[String]) -> Vec<MetaEvent> {
        let mut events = Vec::new();
        for subject in subjects {
            match self.check_subject(subject).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!("Metacognition check failed for {}: {}", subject, e),
            }
        }
        events
    }

    async fn check_subject(&self, subject: &str) -> MedicResult<Option<MetaEvent>> {
        let state = self.check_stuck(subject).await?;
        let previous = self.remember(subject, |_| {});

        if state.should_escalate && !previous.escalating {
            return self.escalate(&state).await;
        }

        if state.is_stuck {
            debug!("{} still stuck ({}), no new escalation", subject, state.reason);
            self.remember(subject, |m| {
                m.stuck = true;
                m.escalating = state.should_escalate;
            });
            return Ok(None);
        }

        let key = subject.to_string();
        let escalated =
            store::blocking(&self.tasks, move |s| s.list(Some(TaskStatus::Escalated), Some(&key))).await?;
        let was_stuck = previous.stuck || previous.escalating || !escalated.is_empty();
        if was_stuck && state.window_len > 0 && state.success_rate >= self.config.recovery_rate {
            return self.recover(&state, escalated.iter().map(|t| t.id).collect()).await;
        }

        self.remember(subject, |m| m.escalating = false);
        Ok(None)
    }

    async fn escalate(&self, state: &StuckState) -> MedicResult<Option<MetaEvent>> {
        let subject = &state.subject;
        warn!(
            "{} is stuck: {} (confidence {:.2}), escalating",
            subject, state.reason, state.confidence
        );

        let mut body = format!(
            "medic cannot fix {} on its own: {} (success rate {:.0}%)",
            subject,
            state.reason,
            state.success_rate * 100.0
        );
        for rec in &state.recommendations {
            body.push_str("\n- ");
            body.push_str(rec);
        }
        let notification = Notification::new(format!("medic escalation: {}", subject), subject, body)
            .with_evidence(state.evidence.clone());

        let delivery = match self.gateway.notify(Tier::Immediate, notification).await {
            Ok(d) => d,
            Err(e) => {
                // Not remembered, so the next pass tries again
                error!("Escalation for {} could not be delivered: {}", subject, e);
                return Ok(None);
            }
        };

        let (key, reference) = (subject.clone(), delivery.reference.clone());
        let results = store::blocking(&self.tasks, move |s| {
            Ok(s.list(Some(TaskStatus::Attempted), Some(&key))?
                .into_iter()
                .map(|task| (task.id, s.escalate(task.id, Some(&reference))))
                .collect::<Vec<_>>())
        })
        .await?;
        let mut task_ids = Vec::new();
        for (id, result) in results {
            match result {
                Ok(_) => task_ids.push(id),
                Err(e) => warn!("Could not escalate task {}: {}", id, e),
            }
        }
        self.remember(subject, |m| {
            m.stuck = true;
            m.escalating = true;
        });

        info!(
            "Escalated {} task(s) on {} via {} ({})",
            task_ids.len(),
            subject,
            delivery.channel,
            delivery.reference
        );
        Ok(Some(MetaEvent::Escalated {
            subject: subject.clone(),
            reference: delivery.reference,
            task_ids,
            confidence: state.confidence,
        }))
    }

    async fn recover(&self, state: &StuckState, escalated: Vec<i64>) -> MedicResult<Option<MetaEvent>> {
        let subject = &state.subject;
        info!(
            "{} recovered: success rate {:.0}%",
            subject,
            state.success_rate * 100.0
        );

        let notification = Notification::new(
            format!("medic recovered: {}", subject),
            subject,
            format!(
                "Automatic remediation is working again (success rate {:.0}%)",
                state.success_rate * 100.0
            ),
        );
        if let Err(e) = self.gateway.notify(Tier::Batched, notification).await {
            warn!("Could not queue recovery notice for {}: {}", subject, e);
        }

        let results = store::blocking(&self.tasks, move |s| {
            Ok(escalated
                .into_iter()
                .map(|id| (id, s.transition(id, TaskStatus::Attempted)))
                .collect::<Vec<_>>())
        })
        .await?;
        let mut task_ids = Vec::new();
        for (id, result) in results {
            match result {
                Ok(_) => task_ids.push(id),
                Err(e) => warn!("Could not de-escalate task {}: {}", id, e),
            }
        }
        if let Ok(mut memory) = self.memory.lock() {
            memory.remove(subject.as_str());
        }

        Ok(Some(MetaEvent::Recovered {
            subject: subject.clone(),
            task_ids,
            success_rate: state.success_rate,
        }))
    }

    /// Apply `update` to a subject's memory and return the state before it
    fn remember(&self, subject: &str, update: impl FnOnce(&mut SubjectMemory)) -> SubjectMemory {
        match self.memory.lock() {
            Ok(mut memory) => {
                let entry = memory.entry(subject.to_string()).or_default();
                let before = *entry;
                update(entry);
                before
            }
            Err(_) => SubjectMemory::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;
    use medic_common::{ActionKind, Strategy};

    fn attempt(id: i64, success: bool, error: Option<&str>) -> FixAttempt {
        FixAttempt {
            id,
            task_id: 1,
            subject: "web".to_string(),
            signature: "docker_dns_failure".to_string(),
            timestamp: Utc::now(),
            strategy: Strategy::SingleOracle,
            action: Some(ActionKind::RestartContainer),
            applied: true,
            success: Some(success),
            confidence: 0.7,
            error_signature: error.map(str::to_string),
            rationale: None,
            replay_of: None,
        }
    }

    /// Newest first, as the store returns them
    fn history(outcomes: &[(bool, Option<&str>)]) -> Vec<FixAttempt> {
        let mut attempts: Vec<FixAttempt> = outcomes
            .iter()
            .enumerate()
            .map(|(i, (ok, err))| attempt(i as i64 + 1, *ok, *err))
            .collect();
        attempts.reverse();
        attempts
    }

    #[test]
    fn test_insufficient_evidence_is_never_stuck() {
        let config = MetacognitionConfig::default();
        let attempts = history(&[(false, Some("docker_dns_failure")); 9]);
        let state = assess("web", &attempts, &config);
        assert!(!state.is_stuck);
        assert!(!state.should_escalate);
        assert_eq!(state.reason, REASON_INSUFFICIENT);
        assert_eq!(state.window_len, 9);
    }

    #[test]
    fn test_ten_identical_failures_are_stuck_with_full_confidence() {
        let config = MetacognitionConfig::default();
        let attempts = history(&[(false, Some("docker_dns_failure")); 10]);
        let state = assess("web", &attempts, &config);
        assert!(state.is_stuck);
        assert!(state.reason.contains("repeated_error"));
        assert!(state.reason.contains("low_success_rate"));
        assert_relative_eq!(state.confidence, 1.0);
        assert!(state.should_escalate);
        assert!(!state.recommendations.is_empty());
    }

    #[test]
    fn test_one_success_in_ten_sits_on_the_rate_boundary() {
        let config = MetacognitionConfig::default();
        let mut outcomes = vec![(false, Some("docker_dns_failure")); 10];
        outcomes.push((true, None));
        // Window covers attempts 2..=11
        let state = assess("web", &history(&outcomes), &config);

        assert_relative_eq!(state.success_rate, 0.10);
        // 0.10 is not strictly below the 0.10 threshold...
        assert!(!state.reason.contains(REASON_LOW_SUCCESS));
        // ...but 9 identical errors keep the subject stuck
        assert!(state.is_stuck);
        assert!(state.reason.starts_with("repeated_error:docker_dns_failure"));
        assert_relative_eq!(state.confidence, 0.9);
        assert!(state.should_escalate);
    }

    #[test]
    fn test_confidence_is_monotonic_in_failures() {
        let config = MetacognitionConfig::default();
        let mut last = -1.0;
        for failures in 0..=10 {
            let outcomes: Vec<(bool, Option<&str>)> = (0..10)
                .map(|i| if i < failures { (false, Some("timeout")) } else { (true, None) })
                .collect();
            let state = assess("web", &history(&outcomes), &config);
            assert!(state.confidence >= last);
            last = state.confidence;
        }
    }

    #[test]
    fn test_varied_errors_with_low_rate_still_stuck() {
        let config = MetacognitionConfig::default();
        let sigs = ["a", "b", "c", "d", "e", "a", "b", "c", "d", "e"];
        let outcomes: Vec<(bool, Option<&str>)> = sigs.iter().map(|s| (false, Some(*s))).collect();
        let state = assess("web", &history(&outcomes), &config);
        assert!(state.is_stuck);
        assert_eq!(state.reason, REASON_LOW_SUCCESS);
    }

    #[tokio::test]
    async fn test_recovery_at_half_success_with_default_window() {
        use crate::config::NotifyConfig;
        use crate::notifier::{NotificationChannel, RecordingChannel};
        use medic_common::{Issue, IssueKind, NewFixAttempt};

        let dir = tempfile::tempdir().unwrap();
        let tasks = Arc::new(TaskStore::open_at(dir.path().join("medic.db")).unwrap());
        let channel = RecordingChannel::new();
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(channel.clone())];
        let gateway = Arc::new(NotificationGateway::new(
            channels,
            &NotifyConfig {
                fallback_log: dir.path().join("escalations.jsonl"),
                ..NotifyConfig::default()
            },
        ));
        let meta = Metacognition::new(Arc::clone(&tasks), Arc::clone(&gateway), MetacognitionConfig::default());

        let id = tasks
            .upsert(&Issue::new("test", IssueKind::ContainerCrash, "web", "container web exited (1)"))
            .unwrap()
            .task_id;
        let task = tasks.transition(id, TaskStatus::Attempted).unwrap();
        let outcome = |success: bool, error: &str| {
            let attempt = NewFixAttempt::applied(&task, Strategy::SingleOracle, ActionKind::RestartContainer, 0.7, success);
            let attempt = if success { attempt } else { attempt.with_error(error) };
            tasks.append_attempt(&attempt).unwrap();
        };
        let subjects = vec!["web".to_string()];

        // Ten failures, no error repeated often enough to dominate
        for sig in ["a", "b", "c", "d", "e", "a", "b", "c", "d", "e"] {
            outcome(false, sig);
        }
        let events = meta.run_pass(&subjects).await;
        assert!(matches!(events.as_slice(), [MetaEvent::Escalated { .. }]));
        assert_eq!(tasks.get(id).unwrap().status, TaskStatus::Escalated);

        // 4 of 10 is healthy again but under the recovery bar
        for _ in 0..4 {
            outcome(true, "");
        }
        assert!(!meta.check_stuck("web").await.unwrap().is_stuck);
        assert!(meta.run_pass(&subjects).await.is_empty());
        assert_eq!(tasks.get(id).unwrap().status, TaskStatus::Escalated);

        // 5 of 10 meets it exactly
        outcome(true, "");
        let events = meta.run_pass(&subjects).await;
        match events.as_slice() {
            [MetaEvent::Recovered { task_ids, success_rate, .. }] => {
                assert_eq!(task_ids, &vec![id]);
                assert_relative_eq!(*success_rate, 0.5);
            }
            other => panic!("expected a recovery, got {:?}", other),
        }
        assert_eq!(tasks.get(id).unwrap().status, TaskStatus::Attempted);
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(gateway.pending(), 1);

        // Recovery is an edge too
        assert!(meta.run_pass(&subjects).await.is_empty());
    }

    #[test]
    fn test_healthy_subject() {
        let config = MetacognitionConfig::default();
        let state = assess("web", &history(&[(true, None); 10]), &config);
        assert!(!state.is_stuck);
        assert_relative_eq!(state.confidence, 0.0);
    }
}
