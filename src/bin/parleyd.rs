//! Parley Daemon - Room registry and message fan-out server
//!
//! Accepts chat clients over TCP, keeps per-room history in memory and
//! broadcasts each message to everyone in the sender's room.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, or ~/.config/parley/parleyd.toml if present
//! parleyd
//!
//! # Explicit config file, overriding the port
//! parleyd --config ./parleyd.toml --port 9000
//!
//! # Verbose logging
//! RUST_LOG=parleyd=debug parleyd
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use parleyd::{RelayServer, ServerConfig};

/// Parley daemon - real-time chat relay
#[derive(Parser, Debug)]
#[command(name = "parleyd", version, about)]
struct Args {
    /// Config file (default: $PARLEY_CONFIG, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter used when RUST_LOG is unset (e.g. "debug")
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: Args) -> Result<ServerConfig> {
    let mut config =
        ServerConfig::discover(args.config.as_deref()).context("Failed to load configuration")?;
    config
        .apply_env()
        .context("Invalid environment override")?;

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("parleyd={level}").parse()?)
            .add_directive(format!("parley_core={level}").parse()?)
            .add_directive(format!("parley_protocol={level}").parse()?),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn main() -> Result<()> {
    let config = load_config(Args::parse())?;
    init_logging(&config.log_level).context("Invalid log level")?;
    run_daemon(config)
}

#[tokio::main]
async fn run_daemon(config: ServerConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Parley daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let server = RelayServer::new(config, cancel_token);

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Parley daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
