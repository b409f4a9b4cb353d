//! keeld: the Keel daemon.
//!
//! Opens the state store and drives pending deploys to completion with the
//! deploy checker until interrupted.
//!
//! # Usage
//!
//! ```text
//! keeld run --config /etc/keel/keel.toml --data-dir /var/lib/keel
//! keeld config > keel.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use keel_core::{KeelConfig, LocalRequestLock};
use keel_rollout::{DeployChecker, DisabledLoadBalancer, TaskHealthChecker};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "keeld", about = "Keel scheduling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the deploy checker.
    Run {
        /// Path to keel.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/keel")]
        data_dir: PathBuf,

        /// Deploy check interval in seconds.
        #[arg(long, default_value = "5")]
        check_interval_secs: u64,
    },

    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<KeelConfig> {
    match path {
        Some(path) => KeelConfig::from_file(path),
        None => Ok(KeelConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keel=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            check_interval_secs,
        } => run(load_config(config.as_ref())?, data_dir, check_interval_secs).await,
        Command::Config { config } => {
            print!("{}", load_config(config.as_ref())?.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: KeelConfig, data_dir: PathBuf, check_interval_secs: u64) -> anyhow::Result<()> {
    info!("Keel daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("keel.redb");
    let store = keel_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    if let Some(uri) = &config.load_balancer.uri {
        warn!(%uri, "no load balancer client is built into keeld, load-balanced deploys will fail");
    }

    let checker = DeployChecker::new(
        config,
        store.clone(),
        Arc::new(LocalRequestLock::new()),
        Arc::new(DisabledLoadBalancer),
        Arc::new(TaskHealthChecker::new(store)),
    );
    info!(interval = check_interval_secs, "deploy checker initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let checker_handle = tokio::spawn(async move {
        checker
            .run(Duration::from_secs(check_interval_secs), shutdown_rx)
            .await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = checker_handle.await;

    info!("Keel daemon stopped");
    Ok(())
}
