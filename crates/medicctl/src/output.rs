//! Terminal output, ASCII only

use chrono::{DateTime, Utc};
use medic_common::{FixAttempt, LearnedPattern, StuckState, Task, TaskStatus};
use owo_colors::OwoColorize;

const SEPARATOR: &str = "------------------------------------------------------------";

pub fn header(title: &str) {
    println!("{}", title.bold());
    println!("{}", SEPARATOR.dimmed());
}

pub fn ok(message: &str) {
    println!("{} {}", "[OK]".bright_green(), message);
}

pub fn warn(message: &str) {
    println!("{} {}", "[WARN]".yellow(), message);
}

fn colored_status(status: TaskStatus) -> String {
    let text = format!("{:<10}", status.as_str());
    match status {
        TaskStatus::Detected => text.cyan().to_string(),
        TaskStatus::Attempted => text.yellow().to_string(),
        TaskStatus::Escalated => text.bright_red().to_string(),
        TaskStatus::Closed => text.dimmed().to_string(),
    }
}

fn colored_confidence(confidence: f64) -> String {
    let text = format!("{:.2}", confidence);
    if confidence >= 0.8 {
        text.bright_green().to_string()
    } else if confidence >= 0.5 {
        text.yellow().to_string()
    } else {
        text.bright_red().to_string()
    }
}

fn ago(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s ago", s),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let cut: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", cut)
}

pub fn status_counts(counts: &[(TaskStatus, u64)]) {
    println!("{}", "Tasks:".bold());
    for (status, n) in counts {
        println!("  {} {}", colored_status(*status), n);
    }
}

pub fn task_table(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("{}", "No tasks".dimmed());
        return;
    }
    println!(
        "{}",
        format!(
            "{:>5}  {:<10}  {:<20}  {:<16}  {:>5}  {:>5}  {}",
            "ID", "STATUS", "SUBJECT", "KIND", "SEEN", "FIXES", "LAST SEEN"
        )
        .bold()
    );
    for task in tasks {
        println!(
            "{:>5}  {}  {:<20}  {:<16}  {:>5}  {:>5}  {}",
            task.id,
            colored_status(task.status),
            truncate(&task.subject, 20),
            task.kind.as_str(),
            task.detection_count,
            task.fix_attempt_count,
            ago(task.last_seen_at).dimmed()
        );
    }
}

pub fn task_detail(task: &Task, attempts: &[FixAttempt]) {
    header(&format!("Task {}", task.id));
    println!("  Status:     {}", colored_status(task.status));
    println!("  Subject:    {}", task.subject);
    println!("  Kind:       {}", task.kind);
    println!("  Signature:  {}", task.signature.cyan());
    println!("  Message:    {}", task.message);
    println!(
        "  Seen:       {} time(s), first {}, last {}",
        task.detection_count,
        ago(task.first_seen_at),
        ago(task.last_seen_at)
    );
    if let Some(reference) = &task.escalation_ref {
        println!("  Escalation: {}", reference.bright_red());
    }
    if let Some(resolution) = &task.resolution {
        println!("  Resolution: {}", resolution.bright_green());
    }

    println!();
    println!("{}", "Fix attempts:".bold());
    if attempts.is_empty() {
        println!("  {}", "none".dimmed());
        return;
    }
    for attempt in attempts {
        let outcome = match (attempt.applied, attempt.success) {
            (true, Some(true)) => "[FIXED]".bright_green().to_string(),
            (true, _) => "[FAILED]".bright_red().to_string(),
            (false, _) => "[SKIPPED]".dimmed().to_string(),
        };
        let action = attempt.action.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:<18} {:<20} conf {}  {}",
            outcome,
            attempt.strategy.as_str(),
            action,
            colored_confidence(attempt.confidence),
            ago(attempt.timestamp).dimmed()
        );
        if let Some(err) = &attempt.error_signature {
            println!("      error: {}", err.yellow());
        }
        if let Some(why) = &attempt.rationale {
            println!("      {}", truncate(why, 100).dimmed());
        }
    }
}

pub fn stuck_state(state: &StuckState) {
    header(&format!("Stuck check: {}", state.subject));
    if state.is_stuck {
        println!("  {} {}", "[STUCK]".bright_red(), state.reason);
    } else {
        println!("  {} {}", "[OK]".bright_green(), state.reason);
    }
    println!("  Confidence:   {}", colored_confidence(state.confidence));
    println!(
        "  Success rate: {:.0}% over {} attempt(s)",
        state.success_rate * 100.0,
        state.window_len
    );
    if state.should_escalate {
        println!("  {}", "Would escalate to a human".bright_red());
    }
    if !state.evidence.is_empty() {
        println!();
        println!("[EVIDENCE]");
        for line in &state.evidence {
            println!("  * {}", line);
        }
    }
    if !state.recommendations.is_empty() {
        println!();
        println!("[RECOMMENDATIONS]");
        for line in &state.recommendations {
            println!("  * {}", line.cyan());
        }
    }
}

pub fn pattern_table(patterns: &[LearnedPattern]) {
    if patterns.is_empty() {
        println!("{}", "No learned patterns".dimmed());
        return;
    }
    println!(
        "{}",
        format!(
            "{:<36}  {:<18}  {:>7}  {:>5}  {}",
            "SIGNATURE", "STRATEGY", "SUCCESS", "CONF", "LAST ACTION"
        )
        .bold()
    );
    for p in patterns {
        println!(
            "{:<36}  {:<18}  {:>7}  {}  {}",
            truncate(&p.signature, 36),
            p.strategy.as_str(),
            format!("{}/{}", p.success_count, p.attempt_count),
            colored_confidence(p.confidence),
            p.last_action.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-subject-name", 10), "a-very-...");
    }

    #[test]
    fn test_ago() {
        assert_eq!(ago(Utc::now() - chrono::Duration::minutes(5)), "5m ago");
        assert_eq!(ago(Utc::now() - chrono::Duration::days(3)), "3d ago");
    }
}
