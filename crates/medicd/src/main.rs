//! medicd - autonomous healing daemon

use anyhow::{Context, Result};
use clap::Parser;
use medic_common::paths::PID_PATH;
use medicd::config::Config;
use medicd::daemon::{self, PidFile};
use std::env;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "medicd", version, about = "Autonomous healing daemon")]
struct Args {
    /// Config file (default: /etc/medic/config.toml, then /var/lib/medic/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pidfile location
    #[arg(long, default_value = PID_PATH)]
    pid_file: PathBuf,

    /// Log actions instead of executing them
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_level(true)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    if args.dry_run {
        config.actions.dry_run = true;
    }

    info!(target: "medicd", "medicd v{} starting", env!("CARGO_PKG_VERSION"));

    let coordinator = daemon::build(&config)?;

    if args.once {
        let report = coordinator.run_cycle().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let _pid = PidFile::acquire(&args.pid_file)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!(target: "medicd", "SIGTERM received"),
            _ = sigint.recv() => info!(target: "medicd", "SIGINT received"),
        }
        if shutdown_tx.send(true).is_err() {
            error!(target: "medicd", "Coordinator already gone");
        }
    });

    coordinator.run(shutdown_rx).await;
    info!(target: "medicd", "medicd stopped");
    Ok(())
}
