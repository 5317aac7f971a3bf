//! Agent runtime
//!
//! The reconnect loop wraps one connected-state event loop: independent
//! heartbeat and inventory timers, terminal command dispatch, and PTY
//! exit reaping. Timers follow the cadences the welcome frame dictated.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use fh_core::config::AgentConfig;

use crate::collector::InventoryCollector;
use crate::connection::{AgentEvent, ConnectError, ServerConnection};
use crate::reconnect::ExponentialBackoff;
use crate::terminal::PtyExecutor;

/// Why the connected loop ended
#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    /// Transport died; reconnect
    Disconnected,
    /// Shutdown was requested; stop for good
    Shutdown,
}

/// Long-running agent process state
pub struct AgentRuntime {
    config: AgentConfig,
    collector: InventoryCollector,
    started: Instant,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            collector: InventoryCollector::new(),
            started: Instant::now(),
        }
    }

    /// Run until `shutdown` fires: connect, serve, back off, repeat.
    ///
    /// Backoff resets on every successful welcome; auth rejections retry
    /// on the same schedule as transport failures.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match ServerConnection::connect(&self.config).await {
                Ok(connection) => {
                    backoff.reset();
                    if self.run_connected(connection, &shutdown).await == LoopExit::Shutdown {
                        break;
                    }
                    tracing::info!("Disconnected from hub, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    match &e {
                        ConnectError::AuthRejected(_) => {
                            tracing::error!("{}. Retrying in {:?}", e, delay);
                        }
                        _ => {
                            tracing::warn!("{}. Retrying in {:?}", e, delay);
                        }
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!("Agent runtime stopped");
    }

    /// Serve one connection until it drops or shutdown is requested
    async fn run_connected(
        &mut self,
        mut connection: ServerConnection,
        shutdown: &CancellationToken,
    ) -> LoopExit {
        let sender = connection.sender();
        let (mut executor, mut exited_rx) =
            PtyExecutor::new(sender.clone(), self.config.shell.clone());

        let min_interval = std::time::Duration::from_secs(1);
        let mut heartbeat =
            tokio::time::interval(connection.welcome.heartbeat_interval.max(min_interval));
        // First tick fires immediately, giving the immediate first
        // inventory the contract asks for
        let mut inventory =
            tokio::time::interval(connection.welcome.inventory_interval.max(min_interval));

        let exit = loop {
            tokio::select! {
                event = connection.recv_event() => {
                    match event {
                        Some(AgentEvent::Terminal { session_id, action }) => {
                            executor.handle(session_id, action);
                        }
                        Some(AgentEvent::Command { message_id, name, .. }) => {
                            tracing::warn!("Unsupported command from hub: {}", name);
                            sender.send_command_response(
                                message_id,
                                false,
                                serde_json::json!({ "error": "unsupported command" }),
                            );
                        }
                        Some(AgentEvent::HeartbeatAck { .. }) => {
                            tracing::trace!("Heartbeat acknowledged");
                        }
                        Some(AgentEvent::InventoryAck { changed }) => {
                            tracing::debug!("Inventory acknowledged (changed={})", changed);
                        }
                        Some(AgentEvent::ErrorFrame { code, message }) => {
                            tracing::warn!("Hub error: {:?} {}", code, message);
                        }
                        Some(AgentEvent::Disconnected) | None => break LoopExit::Disconnected,
                    }
                }

                _ = heartbeat.tick() => {
                    sender.send_heartbeat(
                        self.started.elapsed().as_secs(),
                        env!("CARGO_PKG_VERSION"),
                    );
                }

                _ = inventory.tick() => {
                    let snapshot = self.collector.collect();
                    tracing::debug!(
                        "Submitting inventory ({} cpus, {} bytes ram)",
                        snapshot.cpu_count,
                        snapshot.memory_total
                    );
                    sender.send_inventory(snapshot);
                }

                exited = exited_rx.recv() => {
                    if let Some(session_id) = exited {
                        executor.finish(&session_id);
                    }
                }

                _ = shutdown.cancelled() => break LoopExit::Shutdown,
            }
        };

        // Either path: no transport means no sessions
        executor.close_all();
        connection.close();
        exit
    }
}
