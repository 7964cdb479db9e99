//! Subcommand implementations

use anyhow::{bail, Context, Result};
use medic_common::TaskStatus;
use medicd::config::Config;
use medicd::daemon::read_pid;
use medicd::metacognition::assess;
use medicd::notifier::{Notification, NotificationGateway, Tier};
use medicd::pipeline::record_manual_resolution;
use medicd::store::{LearningStore, TaskStore};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::output;

const STOP_WAIT: Duration = Duration::from_secs(10);

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => Config::load_from_path(p),
        None => Ok(Config::load()),
    }
}

/// Write the default config, refusing to clobber an existing one
pub fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::save_default(path)?;
    output::ok(&format!("Wrote default config to {}", path.display()));
    Ok(())
}

fn open_tasks(config: &Config) -> Result<TaskStore> {
    TaskStore::open(&config.store)
        .with_context(|| format!("Failed to open {}", config.store.path.display()))
}

fn open_learning(config: &Config) -> Result<LearningStore> {
    LearningStore::open(&config.store)
        .with_context(|| format!("Failed to open {}", config.store.path.display()))
}

fn live_pid(pid_file: &Path) -> Option<i32> {
    read_pid(pid_file).filter(|pid| kill(Pid::from_raw(*pid), None).is_ok())
}

pub fn start(bin: &Path, config: Option<&Path>, dry_run: bool) -> Result<()> {
    let mut cmd = Command::new(bin);
    if let Some(path) = config {
        cmd.arg("--config").arg(path);
    }
    if dry_run {
        cmd.arg("--dry-run");
    }
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start {}", bin.display()))?;
    output::ok(&format!("medicd started (pid {})", child.id()));
    Ok(())
}

pub fn stop(pid_file: &Path) -> Result<()> {
    let Some(pid) = live_pid(pid_file) else {
        bail!("medicd is not running (no live pid in {})", pid_file.display());
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("Failed to signal pid {}", pid))?;

    // medicd finishes its current cycle before exiting
    let started = Instant::now();
    while kill(Pid::from_raw(pid), None).is_ok() {
        if started.elapsed() > STOP_WAIT {
            output::warn(&format!("medicd (pid {}) still finishing its cycle", pid));
            return Ok(());
        }
        thread::sleep(Duration::from_millis(200));
    }
    output::ok(&format!("medicd (pid {}) stopped", pid));
    Ok(())
}

pub fn status(config: &Config, pid_file: &Path, json: bool) -> Result<()> {
    let pid = live_pid(pid_file);
    let counts = open_tasks(config)?.counts_by_status()?;

    if json {
        let counts: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, n)| (status.to_string(), (*n).into()))
            .collect();
        let value = serde_json::json!({ "running": pid.is_some(), "pid": pid, "tasks": counts });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    output::header("medic status");
    match pid {
        Some(pid) => output::ok(&format!("medicd running (pid {})", pid)),
        None => output::warn("medicd not running"),
    }
    println!();
    output::status_counts(&counts);
    Ok(())
}

pub fn tasks(config: &Config, status: Option<TaskStatus>, subject: Option<&str>, json: bool) -> Result<()> {
    let tasks = open_tasks(config)?.list(status, subject)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        output::task_table(&tasks);
    }
    Ok(())
}

pub fn show(config: &Config, id: i64, json: bool) -> Result<()> {
    let store = open_tasks(config)?;
    let task = store.get(id)?;
    let attempts = store.attempts_for_task(id)?;
    if json {
        let value = serde_json::json!({ "task": task, "attempts": attempts });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        output::task_detail(&task, &attempts);
    }
    Ok(())
}

pub fn stuck(config: &Config, subject: &str, json: bool) -> Result<()> {
    let attempts = open_tasks(config)?.recent_attempts_for_subject(subject, config.metacognition.window)?;
    let state = assess(subject, &attempts, &config.metacognition);
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        output::stuck_state(&state);
    }
    Ok(())
}

pub fn patterns(config: &Config, signature: Option<&str>, json: bool) -> Result<()> {
    let patterns = open_learning(config)?.list(signature)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&patterns)?);
    } else {
        output::pattern_table(&patterns);
    }
    Ok(())
}

pub fn close(config: &Config, id: i64, note: &str) -> Result<()> {
    let tasks = open_tasks(config)?;
    let learning = open_learning(config)?;
    record_manual_resolution(&tasks, &learning, id, note, config.pipeline.pattern_window)?;
    output::ok(&format!("Task {} closed", id));
    Ok(())
}

/// Hand a task to a human: notify first, then record the reference
pub async fn escalate(config: &Config, id: i64, note: &str) -> Result<()> {
    let tasks = open_tasks(config)?;
    let task = tasks.get(id)?;
    if !task.status.can_force_to(TaskStatus::Escalated) {
        bail!("Task {} is {} and cannot be escalated", id, task.status);
    }

    let gateway = NotificationGateway::from_config(&config.notify)?;
    let notification = Notification::new(
        format!("medic escalation: {}", task.subject),
        task.subject.as_str(),
        format!("Escalated by operator: {}", note),
    )
    .with_evidence(vec![
        format!("task {}: {}", task.id, task.message),
        format!("{} fix attempt(s) so far", task.fix_attempt_count),
    ]);
    let delivery = gateway.notify(Tier::Immediate, notification).await?;

    let task = tasks.force_escalate(id, &delivery.reference)?;
    output::ok(&format!(
        "Task {} ({}) escalated via {} ({})",
        task.id, task.subject, delivery.channel, delivery.reference
    ));
    Ok(())
}
