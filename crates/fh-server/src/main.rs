//! FleetHub server daemon
//!
//! One process is one replica. Replicas share a presence directory; this
//! binary wires the in-process backend, which serves single-host
//! deployments.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fh_core::config::{self, ServerConfig};
use fh_server::auth::StaticAuthority;
use fh_server::directory::MemoryDirectory;
use fh_server::snapshot::MemorySnapshotStore;
use fh_server::{ws, ServerState};

#[derive(Parser)]
#[command(name = "fh-server")]
#[command(about = "FleetHub server daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Replica identifier (overrides config)
    #[arg(long)]
    replica_id: Option<String>,

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

    tracing::info!("FleetHub server starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_server_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.listen_addr = bind;
    }
    if let Some(replica_id) = args.replica_id {
        config.replica_id = Some(replica_id);
    }
    config.validate().context("Invalid configuration")?;

    // Credential table
    let auth = match &config.agent_records_path {
        Some(path) => StaticAuthority::load(path)
            .with_context(|| format!("Failed to load agent records from {:?}", path))?,
        None => {
            tracing::warn!("No agent records configured - all agent connections will be rejected");
            StaticAuthority::new()
        }
    };
    if !auth.is_empty() {
        tracing::info!("Loaded {} agent records", auth.len());
    }

    // In-process collaborators; clustered deployments substitute networked
    // implementations of the same traits
    let directory = MemoryDirectory::new(config.timeouts.presence_ttl);
    let snapshots = Arc::new(MemorySnapshotStore::new(config.snapshot_history));

    let state = ServerState::new(
        config.clone(),
        Arc::new(directory.clone()),
        snapshots,
        Arc::new(auth),
    );
    directory.spawn_sweeper(state.cancel.clone());
    state
        .spawn_background()
        .await
        .context("Failed to subscribe replica inbox")?;

    tracing::info!(
        "Replica {} listening on {}",
        state.replica_id,
        config.listen_addr
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, ws::router(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            shutdown_state.shutdown().await;
        })
        .await
        .context("Server error")?;

    tracing::info!("Server shutdown complete");
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
