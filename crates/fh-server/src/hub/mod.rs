//! Connection hub
//!
//! Per-replica registry of locally-homed agent transports. The hub drives
//! the admission pipeline (hello → auth happens in the WebSocket layer;
//! ownership handover and directory registration happen here), exposes the
//! send interface the session broker borrows, and supervises liveness.

mod health;
mod transport;

pub use health::HealthMonitor;
pub use transport::AgentHandle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use fh_core::time::current_time_secs;
use fh_core::{AgentId, DirectoryError, PresenceStatus, ReplicaId};
use fh_protocol::{CloseReason, Frame, Message};

use crate::directory::{Envelope, PresenceDirectory};

/// How long an admission waits for the previous owner to acknowledge an
/// eviction before relying on TTL expiry and proceeding anyway.
const HANDOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a command response from an agent
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Why an admission was refused
#[derive(Debug, Error)]
pub enum AdmitError {
    /// Replica is shutting down and no longer accepts transports
    #[error("replica is draining")]
    Draining,

    /// Presence directory is down; the hub serves existing transports but
    /// admits no new ones
    #[error("degraded: {0}")]
    Degraded(#[from] DirectoryError),
}

/// Outcome of a local send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame enqueued on the local transport
    Ok,
    /// Agent is not homed on this replica; the caller falls back to
    /// cross-replica delivery
    NotHere,
    /// Local transport exists but is closed or overflowing
    Closed,
}

/// Registry of agent transports homed on this replica
pub struct ConnectionHub {
    replica_id: ReplicaId,
    directory: Arc<dyn PresenceDirectory>,
    /// Local transports; membership changes only on admit/finish
    agents: DashMap<AgentId, Arc<AgentHandle>>,
    /// Serialises concurrent connects for the same agent id so the latest
    /// wins cleanly
    connect_locks: DashMap<AgentId, Arc<tokio::sync::Mutex<()>>>,
    /// Admissions waiting on an eviction ack from the previous owner
    pending_evictions: DashMap<AgentId, oneshot::Sender<()>>,
    /// Commands awaiting their response, keyed by message id
    pending_commands: DashMap<String, oneshot::Sender<Message>>,
    queue_frames: usize,
    draining: AtomicBool,
}

impl ConnectionHub {
    /// Create a hub for this replica
    pub fn new(
        replica_id: ReplicaId,
        directory: Arc<dyn PresenceDirectory>,
        queue_frames: usize,
    ) -> Self {
        Self {
            replica_id,
            directory,
            agents: DashMap::new(),
            connect_locks: DashMap::new(),
            pending_evictions: DashMap::new(),
            pending_commands: DashMap::new(),
            queue_frames,
            draining: AtomicBool::new(false),
        }
    }

    /// This replica's id
    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    /// Admit an authenticated agent.
    ///
    /// If another replica currently owns the agent, its eviction is
    /// requested first and the admission waits for the ack (or the
    /// handover timeout, with TTL expiry as the backstop). A concurrent
    /// local transport for the same id is closed as `duplicate_agent`.
    /// Registers presence and returns the handle plus the receiver the
    /// writer task drains.
    pub async fn admit(
        &self,
        agent_id: AgentId,
        agent_version: String,
    ) -> Result<(Arc<AgentHandle>, mpsc::Receiver<Frame>), AdmitError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(AdmitError::Draining);
        }

        // One connect at a time per agent id; the latest wins
        let lock = self
            .connect_locks
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Evict a previous owner on another replica before taking over
        if let Some(entry) = self.directory.lookup(&agent_id).await? {
            if entry.replica_id != self.replica_id {
                self.request_eviction(&agent_id, &entry.replica_id).await;
            }
        }

        // A previous local transport for the same id loses to this one
        if let Some((_, old)) = self.agents.remove(&agent_id) {
            tracing::info!("Replacing local transport for {}", agent_id);
            old.close(CloseReason::DuplicateAgent);
        }

        self.directory
            .register(&agent_id, &self.replica_id, current_time_secs())
            .await?;

        let (handle, outbound_rx) =
            AgentHandle::new(agent_id.clone(), agent_version, self.queue_frames);
        let handle = Arc::new(handle);
        self.agents.insert(agent_id, Arc::clone(&handle));

        Ok((handle, outbound_rx))
    }

    /// Ask the named replica to drop its transport and wait for the ack
    async fn request_eviction(&self, agent_id: &AgentId, owner: &ReplicaId) {
        tracing::info!(
            "Agent {} currently owned by {}, requesting eviction",
            agent_id,
            owner
        );

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_evictions.insert(agent_id.clone(), ack_tx);

        let delivered = self
            .directory
            .deliver(
                owner,
                Envelope::Evict {
                    agent_id: agent_id.clone(),
                    reply_to: self.replica_id.clone(),
                },
            )
            .await;

        match delivered {
            Ok(()) => {
                if tokio::time::timeout(HANDOVER_TIMEOUT, ack_rx).await.is_err() {
                    tracing::warn!(
                        "Eviction of {} from {} not acknowledged, proceeding on TTL",
                        agent_id,
                        owner
                    );
                }
            }
            Err(e) => {
                tracing::warn!("Could not request eviction of {}: {}", agent_id, e);
            }
        }

        self.pending_evictions.remove(agent_id);
    }

    /// Enqueue a message for a locally-homed agent
    pub fn send(&self, agent_id: &AgentId, message: Message) -> SendOutcome {
        match self.agents.get(agent_id) {
            Some(handle) => match handle.enqueue(Frame::new(message)) {
                Ok(()) => SendOutcome::Ok,
                Err(_) => SendOutcome::Closed,
            },
            None => SendOutcome::NotHere,
        }
    }

    /// Send a correlated command and wait for the matching response
    pub async fn send_command(
        &self,
        agent_id: &AgentId,
        name: String,
        args: serde_json::Value,
    ) -> Result<Message, fh_core::ConnectionError> {
        let handle = self
            .agents
            .get(agent_id)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| fh_core::ConnectionError::NotHere(agent_id.to_string()))?;

        let frame = Frame::with_message_id(Message::Command { name, args });
        let message_id = frame
            .message_id
            .clone()
            .expect("with_message_id always sets an id");

        let (tx, rx) = oneshot::channel();
        self.pending_commands.insert(message_id.clone(), tx);

        if let Err(e) = handle.enqueue(frame) {
            self.pending_commands.remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending_commands.remove(&message_id);
                Err(fh_core::ConnectionError::ConnectionLost(
                    "command response timed out".to_string(),
                ))
            }
        }
    }

    /// Correlate a `command_response` frame with its pending command
    pub fn resolve_command(&self, message_id: &str, response: Message) {
        if let Some((_, tx)) = self.pending_commands.remove(message_id) {
            let _ = tx.send(response);
        } else {
            tracing::debug!("Response for unknown command {}", message_id);
        }
    }

    /// Handle an eviction request from a replica taking over one of our
    /// agents. The transport is closed without deregistering (the new
    /// owner has already re-registered, and our conditional deregister
    /// would be a no-op anyway).
    pub async fn evict_local(&self, agent_id: &AgentId, reply_to: &ReplicaId) {
        if let Some((_, handle)) = self.agents.remove(agent_id) {
            tracing::info!("Evicting {} in favour of {}", agent_id, reply_to);
            handle.close(CloseReason::DuplicateAgent);
        }

        if let Err(e) = self
            .directory
            .deliver(
                reply_to,
                Envelope::EvictAck {
                    agent_id: agent_id.clone(),
                },
            )
            .await
        {
            tracing::debug!("Could not ack eviction of {}: {}", agent_id, e);
        }
    }

    /// Complete a pending eviction we requested
    pub fn notify_evict_ack(&self, agent_id: &AgentId) {
        if let Some((_, tx)) = self.pending_evictions.remove(agent_id) {
            let _ = tx.send(());
        }
    }

    /// Final cleanup when a transport's task group ends.
    ///
    /// Removes the map entry only if it still points at this handle (a
    /// replacement admitted in the meantime stays) and attempts the
    /// conditional deregister.
    pub async fn finish(&self, handle: &Arc<AgentHandle>) {
        let removed = self
            .agents
            .remove_if(&handle.agent_id, |_, current| Arc::ptr_eq(current, handle))
            .is_some();

        if removed {
            if let Err(e) = self
                .directory
                .deregister(&handle.agent_id, &self.replica_id)
                .await
            {
                tracing::warn!("Deregister of {} failed: {}", handle.agent_id, e);
            }
        }
    }

    /// Stop admitting transports and close every existing one
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        for entry in self.agents.iter() {
            entry.value().close(CloseReason::Shutdown);
        }
    }

    /// Spawn the listener that drops local transports when the directory
    /// reports their agent online on another replica (covers handovers
    /// whose evict envelope was lost).
    pub fn spawn_status_listener(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut status_rx = hub.directory.subscribe_status();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = status_rx.recv() => {
                        match event {
                            Ok(event) => {
                                if event.status == PresenceStatus::Online
                                    && event.replica_id != hub.replica_id
                                {
                                    if let Some((_, handle)) = hub.agents.remove(&event.agent_id) {
                                        tracing::info!(
                                            "Agent {} re-homed on {}, dropping local transport",
                                            event.agent_id,
                                            event.replica_id
                                        );
                                        handle.close(CloseReason::DuplicateAgent);
                                    }
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!("Status stream lagged by {} events", n);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Get a local transport handle
    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<AgentHandle>> {
        self.agents.get(agent_id).map(|h| Arc::clone(&h))
    }

    /// List all local transports
    pub fn list(&self) -> Vec<Arc<AgentHandle>> {
        self.agents.iter().map(|h| Arc::clone(&h)).collect()
    }

    /// Number of locally-homed agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agents are homed here
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn hub_on(directory: &MemoryDirectory, replica: &str) -> Arc<ConnectionHub> {
        Arc::new(ConnectionHub::new(
            ReplicaId::new(replica),
            Arc::new(directory.clone()),
            64,
        ))
    }

    #[tokio::test]
    async fn test_admit_registers_presence() {
        let directory = MemoryDirectory::new(Duration::from_secs(45));
        let hub = hub_on(&directory, "r1");
        let agent = AgentId::new("probe-1");

        let (handle, _rx) = hub.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();
        assert_eq!(handle.agent_id, agent);
        assert_eq!(hub.len(), 1);

        let entry = directory.lookup(&agent).await.unwrap().unwrap();
        assert_eq!(entry.replica_id, ReplicaId::new("r1"));
    }

    #[tokio::test]
    async fn test_send_not_here_for_unknown_agent() {
        let directory = MemoryDirectory::new(Duration::from_secs(45));
        let hub = hub_on(&directory, "r1");

        let outcome = hub.send(
            &AgentId::new("ghost"),
            Message::HeartbeatAck { server_time_s: 0 },
        );
        assert_eq!(outcome, SendOutcome::NotHere);
    }

    #[tokio::test]
    async fn test_duplicate_admit_replaces_transport() {
        let directory = MemoryDirectory::new(Duration::from_secs(45));
        let hub = hub_on(&directory, "r1");
        let agent = AgentId::new("probe-1");

        let (first, _rx1) = hub.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();
        let (second, _rx2) = hub.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();

        assert!(first.cancel.is_cancelled());
        assert_eq!(first.close_reason(), Some(CloseReason::DuplicateAgent));
        assert!(!second.cancel.is_cancelled());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_finish_deregisters_and_removes() {
        let directory = MemoryDirectory::new(Duration::from_secs(45));
        let hub = hub_on(&directory, "r1");
        let agent = AgentId::new("probe-1");

        let (handle, _rx) = hub.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();
        hub.finish(&handle).await;

        assert!(hub.is_empty());
        assert!(directory.lookup(&agent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_leaves_replacement_intact() {
        let directory = MemoryDirectory::new(Duration::from_secs(45));
        let hub = hub_on(&directory, "r1");
        let agent = AgentId::new("probe-1");

        let (first, _rx1) = hub.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();
        let (_second, _rx2) = hub.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();

        // Late cleanup of the replaced transport must not evict the new one
        hub.finish(&first).await;
        assert_eq!(hub.len(), 1);
        assert!(directory.lookup(&agent).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cross_replica_handover_evicts_old_owner() {
        let directory = MemoryDirectory::new(Duration::from_secs(45));
        let hub1 = hub_on(&directory, "r1");
        let hub2 = hub_on(&directory, "r2");
        let agent = AgentId::new("probe-1");

        // r1's envelope loop, reduced to the eviction path
        let mut rx1 = directory.subscribe(&ReplicaId::new("r1")).await.unwrap();
        let hub1_clone = Arc::clone(&hub1);
        tokio::spawn(async move {
            while let Some(envelope) = rx1.recv().await {
                if let Envelope::Evict { agent_id, reply_to } = envelope {
                    hub1_clone.evict_local(&agent_id, &reply_to).await;
                }
            }
        });
        let mut rx2 = directory.subscribe(&ReplicaId::new("r2")).await.unwrap();
        let hub2_clone = Arc::clone(&hub2);
        tokio::spawn(async move {
            while let Some(envelope) = rx2.recv().await {
                if let Envelope::EvictAck { agent_id } = envelope {
                    hub2_clone.notify_evict_ack(&agent_id);
                }
            }
        });

        let (old, _rx_old) = hub1.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();
        let (_new, _rx_new) = hub2.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();

        // Single owner: r1 dropped its transport, directory points at r2
        assert!(old.cancel.is_cancelled());
        assert!(hub1.is_empty());
        assert_eq!(hub2.len(), 1);
        let entry = directory.lookup(&agent).await.unwrap().unwrap();
        assert_eq!(entry.replica_id, ReplicaId::new("r2"));
    }

    #[tokio::test]
    async fn test_send_command_correlates_response() {
        let directory = MemoryDirectory::new(Duration::from_secs(45));
        let hub = hub_on(&directory, "r1");
        let agent = AgentId::new("probe-1");

        let (_handle, mut rx) = hub.admit(agent.clone(), "1.0.0".to_string()).await.unwrap();

        // Stand in for the agent: answer the command by its correlation id
        let hub_clone = Arc::clone(&hub);
        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            assert!(matches!(frame.message, Message::Command { .. }));
            let message_id = frame.message_id.expect("command must carry a message id");
            hub_clone.resolve_command(
                &message_id,
                Message::CommandResponse {
                    success: true,
                    output: serde_json::json!({"applied": true}),
                },
            );
        });

        let response = hub
            .send_command(&agent, "refresh_inventory".to_string(), serde_json::Value::Null)
            .await
            .unwrap();
        match response {
            Message::CommandResponse { success, .. } => assert!(success),
            other => panic!("expected command_response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drain_rejects_new_admissions() {
        let directory = MemoryDirectory::new(Duration::from_secs(45));
        let hub = hub_on(&directory, "r1");

        let (handle, _rx) = hub
            .admit(AgentId::new("probe-1"), "1.0.0".to_string())
            .await
            .unwrap();

        hub.begin_drain();
        assert!(handle.cancel.is_cancelled());
        assert_eq!(handle.close_reason(), Some(CloseReason::Shutdown));

        let result = hub.admit(AgentId::new("probe-2"), "1.0.0".to_string()).await;
        assert!(matches!(result, Err(AdmitError::Draining)));
    }
}
