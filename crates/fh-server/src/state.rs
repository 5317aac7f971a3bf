//! Global server state
//!
//! Everything a replica's tasks need — the hub, the broker, the directory
//! and store clients — is constructed once at startup and carried in one
//! `Arc<ServerState>`; there are no process-wide singletons.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fh_core::config::ServerConfig;
use fh_core::time::current_time_secs;
use fh_core::{DirectoryError, ReplicaId};
use fh_protocol::{ErrorCode, Frame, Message, PROTOCOL_VERSION};

use crate::auth::AuthAuthority;
use crate::broker::SessionBroker;
use crate::directory::{Envelope, PresenceDirectory, TouchResult};
use crate::hub::{AgentHandle, ConnectionHub, HealthMonitor};
use crate::snapshot::SnapshotStore;

/// Shared state for one server replica
pub struct ServerState {
    pub config: ServerConfig,
    pub replica_id: ReplicaId,
    pub hub: Arc<ConnectionHub>,
    pub broker: Arc<SessionBroker>,
    pub directory: Arc<dyn PresenceDirectory>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub auth: Arc<dyn AuthAuthority>,
    /// Root token; cancelling it stops every background task
    pub cancel: CancellationToken,
}

impl ServerState {
    /// Wire up the hub and broker around the provided collaborators
    pub fn new(
        config: ServerConfig,
        directory: Arc<dyn PresenceDirectory>,
        snapshots: Arc<dyn SnapshotStore>,
        auth: Arc<dyn AuthAuthority>,
    ) -> Arc<Self> {
        let replica_id = ReplicaId::new(config.replica_id());

        let hub = Arc::new(ConnectionHub::new(
            replica_id.clone(),
            Arc::clone(&directory),
            config.write_queue_frames,
        ));
        let broker = Arc::new(SessionBroker::new(
            replica_id.clone(),
            Arc::clone(&hub),
            Arc::clone(&directory),
            Arc::clone(&auth),
            config.timeouts.session_idle,
        ));

        Arc::new(Self {
            config,
            replica_id,
            hub,
            broker,
            directory,
            snapshots,
            auth,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe this replica's envelope inbox and start the background
    /// tasks: envelope dispatch, heartbeat supervision, idle sweeping, and
    /// the status listener.
    pub async fn spawn_background(self: &Arc<Self>) -> Result<(), DirectoryError> {
        let inbox = self.directory.subscribe(&self.replica_id).await?;

        let state = Arc::clone(self);
        tokio::spawn(async move {
            state.run_envelope_loop(inbox).await;
        });

        let monitor = HealthMonitor::new(
            self.config.timeouts.heartbeat_check,
            self.config.timeouts.heartbeat_miss,
        );
        monitor.spawn(Arc::clone(&self.hub), self.cancel.clone());

        self.broker.spawn_idle_sweeper(self.cancel.clone());
        self.hub.spawn_status_listener(self.cancel.clone());

        Ok(())
    }

    /// Dispatch envelopes addressed to this replica
    async fn run_envelope_loop(self: Arc<Self>, mut inbox: mpsc::Receiver<Envelope>) {
        loop {
            tokio::select! {
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    match envelope {
                        Envelope::Evict { agent_id, reply_to } => {
                            self.broker.agent_gone(&agent_id).await;
                            self.hub.evict_local(&agent_id, &reply_to).await;
                        }
                        Envelope::EvictAck { agent_id } => {
                            self.hub.notify_evict_ack(&agent_id);
                        }
                        terminal => self.broker.on_envelope(terminal).await,
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        tracing::debug!("Envelope loop for {} ended", self.replica_id);
    }

    /// Dispatch one decoded frame from an agent transport
    pub async fn handle_agent_frame(&self, handle: &Arc<AgentHandle>, frame: Frame) {
        match frame.message {
            Message::Heartbeat { uptime_s, .. } => {
                handle.record_heartbeat();
                tracing::trace!("Heartbeat from {} (uptime {}s)", handle.agent_id, uptime_s);

                match self
                    .directory
                    .touch(&handle.agent_id, current_time_secs())
                    .await
                {
                    Ok(TouchResult::Ok) => {}
                    Ok(TouchResult::Evicted) => {
                        // Entry expired under us; re-assert ownership
                        if let Err(e) = self
                            .directory
                            .register(&handle.agent_id, &self.replica_id, current_time_secs())
                            .await
                        {
                            tracing::warn!("Re-register of {} failed: {}", handle.agent_id, e);
                        }
                    }
                    Err(e) => {
                        // Degraded: keep serving as long as heartbeats flow
                        tracing::warn!("Directory touch for {} failed: {}", handle.agent_id, e);
                    }
                }

                let _ = handle.enqueue(Frame::new(Message::HeartbeatAck {
                    server_time_s: current_time_secs() as u64,
                }));
            }

            Message::Inventory(snapshot) => {
                match self.snapshots.put_inventory(&handle.agent_id, snapshot).await {
                    Ok(changed) => {
                        tracing::info!(
                            "Inventory accepted for {} (changed={})",
                            handle.agent_id,
                            changed
                        );
                        let _ = handle.enqueue(Frame::new(Message::InventoryAck {
                            received: true,
                            changed,
                        }));
                    }
                    Err(e) => {
                        tracing::error!("Inventory for {} rejected: {}", handle.agent_id, e);
                        let _ = handle.enqueue(Frame::new(Message::Error {
                            code: ErrorCode::Unavailable,
                            message: "snapshot store unavailable".to_string(),
                        }));
                    }
                }
            }

            message @ (Message::TerminalOutput { .. }
            | Message::TerminalReady { .. }
            | Message::TerminalError { .. }
            | Message::TerminalClosed { .. }) => {
                self.broker.on_agent_frame(&handle.agent_id, message).await;
            }

            response @ Message::CommandResponse { .. } => match frame.message_id {
                Some(message_id) => self.hub.resolve_command(&message_id, response),
                None => {
                    tracing::warn!("Uncorrelated command response from {}", handle.agent_id);
                }
            },

            Message::Error { code, message } => {
                tracing::warn!(
                    "Error frame from {}: {:?} {}",
                    handle.agent_id,
                    code,
                    message
                );
            }

            other => {
                tracing::warn!(
                    "Unexpected {} frame from {}",
                    other.kind(),
                    handle.agent_id
                );
                let _ = handle.enqueue(Frame::new(Message::Error {
                    code: ErrorCode::InvalidMessage,
                    message: format!("unexpected frame type {}", other.kind()),
                }));
            }
        }
    }

    /// Build the welcome frame for a freshly admitted agent
    pub fn welcome_frame(&self, agent_id: &fh_core::AgentId) -> Frame {
        Frame::new(Message::Welcome {
            agent_id: agent_id.to_string(),
            server_version: PROTOCOL_VERSION.to_string(),
            heartbeat_interval_s: self.config.timeouts.heartbeat_interval.as_secs(),
            inventory_interval_s: self.config.timeouts.inventory_interval.as_secs(),
        })
    }

    /// Graceful shutdown: stop admissions, close every transport, wait up
    /// to the drain window, then cancel everything still running.
    pub async fn shutdown(&self) {
        tracing::info!("Replica {} draining", self.replica_id);
        self.hub.begin_drain();

        let deadline = tokio::time::Instant::now() + self.config.timeouts.drain_timeout;
        while !self.hub.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        self.cancel.cancel();
        tracing::info!("Replica {} shutdown complete", self.replica_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthority;
    use crate::directory::MemoryDirectory;
    use crate::snapshot::MemorySnapshotStore;
    use fh_core::{AgentId, AgentRecord, OperatorId};
    use fh_protocol::InventorySnapshot;
    use std::time::Duration;

    fn test_state() -> Arc<ServerState> {
        let config = ServerConfig {
            replica_id: Some("r1".to_string()),
            ..Default::default()
        };
        let directory = Arc::new(MemoryDirectory::new(Duration::from_secs(45)));
        let snapshots = Arc::new(MemorySnapshotStore::new(8));
        let auth = Arc::new(StaticAuthority::with_records(
            vec![AgentRecord {
                agent_id: AgentId::new("probe-1"),
                owner_id: OperatorId::new("op-1"),
                secret: "s3cret".to_string(),
                hostname: "probe-1.local".to_string(),
                platform: "linux".to_string(),
                architecture: "x86_64".to_string(),
                agent_version: "1.0.0".to_string(),
                registered_at: 0,
                last_connected_at: 0,
            }],
            vec![],
        ));
        ServerState::new(config, directory, snapshots, auth)
    }

    #[tokio::test]
    async fn test_heartbeat_acked_and_touches_directory() {
        let state = test_state();
        let agent = AgentId::new("probe-1");
        let (handle, mut rx) = state.hub.admit(agent.clone(), "1.0.0".into()).await.unwrap();

        state
            .handle_agent_frame(
                &handle,
                Frame::new(Message::Heartbeat {
                    status: "alive".to_string(),
                    uptime_s: 10,
                    agent_version: "1.0.0".to_string(),
                }),
            )
            .await;

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame.message, Message::HeartbeatAck { .. }));

        let entry = state.directory.lookup(&agent).await.unwrap().unwrap();
        assert!(entry.last_heartbeat > 0);
    }

    #[tokio::test]
    async fn test_inventory_acked_and_stored() {
        let state = test_state();
        let agent = AgentId::new("probe-1");
        let (handle, mut rx) = state.hub.admit(agent.clone(), "1.0.0".into()).await.unwrap();

        let snapshot = InventorySnapshot {
            hostname: "probe-1.local".to_string(),
            collected_at: current_time_secs(),
            ..Default::default()
        };
        state
            .handle_agent_frame(&handle, Frame::new(Message::Inventory(snapshot)))
            .await;

        let frame = rx.recv().await.unwrap();
        match frame.message {
            Message::InventoryAck { received, changed } => {
                assert!(received);
                assert!(changed);
            }
            other => panic!("expected inventory_ack, got {:?}", other),
        }

        // Write-through: the store has the snapshot the ack promised
        assert!(state.snapshots.latest(&agent).await.is_some());
    }

    #[tokio::test]
    async fn test_unexpected_frame_answered_with_error() {
        let state = test_state();
        let (handle, mut rx) = state
            .hub
            .admit(AgentId::new("probe-1"), "1.0.0".into())
            .await
            .unwrap();

        state
            .handle_agent_frame(
                &handle,
                Frame::new(Message::Hello {
                    agent_id: "probe-1".to_string(),
                    secret: "again?".to_string(),
                    agent_version: "1.0.0".to_string(),
                }),
            )
            .await;

        let frame = rx.recv().await.unwrap();
        match frame.message {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("expected error, got {:?}", other),
        }
        // Logic errors do not close the transport
        assert!(!handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_cancels() {
        let state = test_state();
        let (handle, _rx) = state
            .hub
            .admit(AgentId::new("probe-1"), "1.0.0".into())
            .await
            .unwrap();

        // Simulate the transport task exiting once closed
        let hub = Arc::clone(&state.hub);
        let handle_clone = Arc::clone(&handle);
        tokio::spawn(async move {
            handle_clone.cancel.cancelled().await;
            hub.finish(&handle_clone).await;
        });

        state.shutdown().await;

        assert!(state.hub.is_empty());
        assert!(state.cancel.is_cancelled());
    }
}
