//! medicctl - operator CLI for the medic healing daemon
//!
//! Reads the same SQLite store as `medicd`. Only `close` and `escalate`
//! write to it; `init` writes the config file.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use medic_common::paths::{CONFIG_PATH, PID_PATH};
use medic_common::TaskStatus;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "medicctl")]
#[command(about = "Inspect and steer the medic healing daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: /etc/medic/config.toml, then /var/lib/medic/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file (to --config, or /etc/medic/config.toml)
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Start medicd in the background
    Start {
        /// Path to the medicd binary
        #[arg(long, default_value = "medicd")]
        bin: PathBuf,

        /// Start in dry-run mode
        #[arg(long)]
        dry_run: bool,
    },

    /// Stop a running medicd
    Stop {
        #[arg(long, default_value = PID_PATH)]
        pid_file: PathBuf,
    },

    /// Daemon liveness and task counts
    Status {
        #[arg(long, default_value = PID_PATH)]
        pid_file: PathBuf,
    },

    /// List tasks
    Tasks {
        /// detected, attempted, escalated or closed
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,

        #[arg(long)]
        subject: Option<String>,
    },

    /// Show one task with its fix attempts
    Show { id: i64 },

    /// Stuck verdict for a subject
    Stuck { subject: String },

    /// Learned patterns
    Patterns {
        #[arg(long)]
        signature: Option<String>,
    },

    /// Close a task by hand and record the fix
    Close {
        id: i64,

        /// What was done
        #[arg(long, default_value = "resolved by operator")]
        note: String,
    },

    /// Hand a task to a human, notifying through the configured channels
    Escalate {
        id: i64,

        #[arg(long, default_value = "escalated by operator")]
        note: String,
    },
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Init { force } = cli.command {
        let path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
        return commands::init(&path, force);
    }
    let config = commands::load_config(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Start { bin, dry_run } => commands::start(&bin, cli.config.as_deref(), dry_run),
        Commands::Stop { pid_file } => commands::stop(&pid_file),
        Commands::Status { pid_file } => commands::status(&config, &pid_file, json),
        Commands::Tasks { status, subject } => {
            commands::tasks(&config, status, subject.as_deref(), json)
        }
        Commands::Show { id } => commands::show(&config, id, json),
        Commands::Stuck { subject } => commands::stuck(&config, &subject, json),
        Commands::Patterns { signature } => commands::patterns(&config, signature.as_deref(), json),
        Commands::Close { id, note } => commands::close(&config, id, &note),
        Commands::Escalate { id, note } => commands::escalate(&config, id, &note).await,
        Commands::Init { .. } => Ok(()),
    }
}
