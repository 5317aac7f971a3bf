//! FleetHub agent daemon
//!
//! Runs on each monitored host, holds one connection to the hub, and
//! serves inventory and terminal requests until told to stop.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fh_agent::AgentRuntime;
use fh_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "fh-agent")]
#[command(about = "FleetHub probe agent")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hub WebSocket URL (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Agent identifier (overrides config)
    #[arg(long)]
    agent_id: Option<String>,

    /// Shared secret (overrides config)
    #[arg(long)]
    secret: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("FleetHub agent starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_agent_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                AgentConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            AgentConfig::default()
        }
    };

    // Apply command-line overrides
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(agent_id) = args.agent_id {
        config.agent_id = Some(agent_id);
    }
    if let Some(secret) = args.secret {
        config.secret = secret;
    }

    if config.secret.is_empty() {
        tracing::warn!("No secret configured - the hub will reject this agent");
    }

    tracing::info!("Agent id: {}", config.agent_id());
    tracing::info!("Hub: {}", config.server_url);

    // Shutdown on Ctrl+C or SIGTERM
    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested");
        signal_shutdown.cancel();
    });

    let mut runtime = AgentRuntime::new(config);
    runtime.run(shutdown).await;

    tracing::info!("Agent shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
