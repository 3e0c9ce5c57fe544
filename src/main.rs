//! FX Executor - headless trading agent
//!
//! Connects a local broker terminal to the remote control plane: receives
//! strategy commands, evaluates markets, gates every order through the risk
//! chain, and reports heartbeats and results back.
//!
//! # Usage
//! ```sh
//! EXECUTOR_ID=exec-1 EXECUTOR_API_KEY=... cargo run --bin executor
//! ```
//!
//! # Environment Variables
//! - `EXECUTOR_ID`, `EXECUTOR_API_KEY`, `EXECUTOR_API_SECRET`, `PLATFORM_URL` (required)
//! - `BROKER_HOST` / `BROKER_PORT` - broker terminal socket (default 127.0.0.1:9090)
//! - `PUSH_KEY` / `PUSH_CLUSTER` - control-plane push channel
//! - `ACCOUNT_KIND` - demo | live (default demo)
//! - `HEARTBEAT_INTERVAL` - seconds between heartbeats (default 60)

use anyhow::Result;
use clap::Parser;
use fx_executor::application::executor::Executor;
use fx_executor::config::ExecutorConfig;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "executor", about = "FX trading executor agent", version)]
struct Cli {
    /// Path to an env file loaded before configuration.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Validate configuration and exit without connecting.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::from_filename(&cli.env_file).ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("FX Executor {} starting...", env!("CARGO_PKG_VERSION"));

    let config = ExecutorConfig::from_env()?;
    info!(
        "Configuration loaded: executor={}, broker={}:{}, account={:?}",
        config.executor_id, config.broker_host, config.broker_port, config.account_kind
    );
    if cli.check_config {
        info!("Configuration OK");
        return Ok(());
    }

    let executor = Executor::build(config)?;
    executor.clone().start().await?;
    info!("Executor running. Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    executor.shutdown().await;
    info!("Goodbye.");
    Ok(())
}
