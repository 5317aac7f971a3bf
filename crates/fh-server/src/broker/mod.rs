//! Session broker
//!
//! Owns the lifecycle of interactive terminal sessions: authorises the
//! operator, locates the agent through the presence directory, splices the
//! two byte streams together, and guarantees teardown when either side
//! goes away. Sessions whose agent is homed on a peer replica are routed
//! through directory envelopes with per-direction sequence numbers.

mod session;

pub use session::{BoundInput, NotifyOutcome, RemoteBinding, ReorderBuffer, TerminalSession};

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fh_core::time::current_time_secs;
use fh_core::{AgentId, OperatorId, ReplicaId, SessionError};
use fh_protocol::operator::{OperatorEvent, OperatorInit};
use fh_protocol::{Message, TerminalAction};

use crate::auth::AuthAuthority;
use crate::directory::{Envelope, PresenceDirectory};
use crate::hub::{ConnectionHub, SendOutcome};

/// Capacity of each operator's outbound event queue
const OPERATOR_QUEUE: usize = 256;

/// Creates, routes, and tears down terminal sessions
pub struct SessionBroker {
    replica_id: ReplicaId,
    hub: Arc<ConnectionHub>,
    directory: Arc<dyn PresenceDirectory>,
    auth: Arc<dyn AuthAuthority>,
    /// Sessions whose operator transport is on this replica
    sessions: DashMap<String, Arc<TerminalSession>>,
    /// Sessions whose agent is local but operator is elsewhere
    remote: DashMap<String, Arc<RemoteBinding>>,
    session_idle: Duration,
}

impl SessionBroker {
    pub fn new(
        replica_id: ReplicaId,
        hub: Arc<ConnectionHub>,
        directory: Arc<dyn PresenceDirectory>,
        auth: Arc<dyn AuthAuthority>,
        session_idle: Duration,
    ) -> Self {
        Self {
            replica_id,
            hub,
            directory,
            auth,
            sessions: DashMap::new(),
            remote: DashMap::new(),
            session_idle,
        }
    }

    /// Open a session for an authenticated operator.
    ///
    /// Returns the session plus the receiver the operator's WebSocket
    /// writer drains. The `terminal_ready` event arrives on that receiver
    /// once the agent's PTY is up.
    pub async fn open(
        &self,
        operator_id: OperatorId,
        agent_id: AgentId,
        init: OperatorInit,
    ) -> Result<(Arc<TerminalSession>, mpsc::Receiver<OperatorEvent>), SessionError> {
        if !self.auth.operator_owns(&operator_id, &agent_id).await {
            return Err(SessionError::Unauthorised(agent_id.to_string()));
        }

        let entry = self
            .directory
            .lookup(&agent_id)
            .await
            .map_err(|e| SessionError::Unavailable(e.to_string()))?
            .ok_or_else(|| SessionError::AgentOffline(agent_id.to_string()))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let (operator_tx, operator_rx) = mpsc::channel(OPERATOR_QUEUE);
        let session = Arc::new(TerminalSession::new(
            session_id.clone(),
            agent_id.clone(),
            operator_id,
            entry.replica_id.clone(),
            current_time_secs(),
            operator_tx,
        ));
        self.sessions.insert(session_id.clone(), Arc::clone(&session));

        tracing::info!(
            "Terminal session {} opened: {} -> {} (owner {})",
            session_id,
            session.operator_id,
            agent_id,
            entry.replica_id
        );

        let routed = if session.is_local_to(&self.replica_id) {
            match self.hub.send(
                &agent_id,
                Message::TerminalCommand {
                    session_id: session_id.clone(),
                    action: TerminalAction::Init {
                        rows: init.rows,
                        cols: init.cols,
                        shell: init.shell.clone(),
                    },
                },
            ) {
                SendOutcome::Ok => Ok(()),
                _ => Err(SessionError::AgentOffline(agent_id.to_string())),
            }
        } else {
            self.directory
                .deliver(
                    &entry.replica_id,
                    Envelope::TerminalOpen {
                        session_id: session_id.clone(),
                        agent_id: agent_id.clone(),
                        rows: init.rows,
                        cols: init.cols,
                        shell: init.shell,
                        return_to: self.replica_id.clone(),
                    },
                )
                .await
                .map_err(|e| SessionError::Unavailable(e.to_string()))
        };

        if let Err(e) = routed {
            self.sessions.remove(&session_id);
            return Err(e);
        }

        Ok((session, operator_rx))
    }

    /// Forward operator keystrokes toward the agent
    pub async fn operator_input(&self, session_id: &str, data: String) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        session.touch_activity();
        let seq = session.next_input_seq();

        if session.is_local_to(&self.replica_id) {
            let outcome = self.hub.send(
                &session.agent_id,
                Message::TerminalCommand {
                    session_id: session_id.to_string(),
                    action: TerminalAction::Input { data },
                },
            );
            if outcome != SendOutcome::Ok {
                self.teardown(&session, "agent disconnected", false).await;
            }
        } else {
            let delivered = self
                .directory
                .deliver(
                    &session.owner_replica,
                    Envelope::TerminalInput {
                        session_id: session_id.to_string(),
                        data,
                        seq,
                    },
                )
                .await;
            if delivered.is_err() {
                self.teardown(&session, "agent replica unreachable", false).await;
            }
        }
    }

    /// Forward an operator resize toward the agent, ordered with input
    pub async fn operator_resize(&self, session_id: &str, rows: u16, cols: u16) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        session.touch_activity();
        let seq = session.next_input_seq();

        if session.is_local_to(&self.replica_id) {
            let outcome = self.hub.send(
                &session.agent_id,
                Message::TerminalCommand {
                    session_id: session_id.to_string(),
                    action: TerminalAction::Resize { rows, cols },
                },
            );
            if outcome != SendOutcome::Ok {
                self.teardown(&session, "agent disconnected", false).await;
            }
        } else {
            let delivered = self
                .directory
                .deliver(
                    &session.owner_replica,
                    Envelope::TerminalResize {
                        session_id: session_id.to_string(),
                        rows,
                        cols,
                        seq,
                    },
                )
                .await;
            if delivered.is_err() {
                self.teardown(&session, "agent replica unreachable", false).await;
            }
        }
    }

    /// Operator transport went away
    pub async fn operator_gone(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            self.teardown(&session, "operator disconnected", true).await;
        }
    }

    /// Handle a terminal frame received from a locally-homed agent.
    ///
    /// Frames only act on sessions bound to the sending agent; a session
    /// id belonging to another agent is treated as unknown.
    pub async fn on_agent_frame(&self, agent_id: &AgentId, message: Message) {
        match message {
            Message::TerminalOutput { session_id, data, seq } => {
                if let Some(session) = self.session_for(&session_id, agent_id) {
                    self.deliver_output(&session, seq, data).await;
                } else if let Some(binding) = self.remote_for(&session_id, agent_id) {
                    binding.touch_activity();
                    let result = self
                        .directory
                        .deliver(
                            &binding.return_to,
                            Envelope::TerminalOutput { session_id, data, seq },
                        )
                        .await;
                    if result.is_err() {
                        self.drop_binding(&binding, true).await;
                    }
                } else {
                    // Output for a session nobody tracks: stop the stream
                    self.hub.send(
                        agent_id,
                        Message::TerminalCommand {
                            session_id,
                            action: TerminalAction::Close,
                        },
                    );
                }
            }

            Message::TerminalReady { session_id } => {
                if let Some(session) = self.session_for(&session_id, agent_id) {
                    session.touch_activity();
                    let _ = session.notify(OperatorEvent::TerminalReady { session_id });
                } else if let Some(binding) = self.remote_for(&session_id, agent_id) {
                    let _ = self
                        .directory
                        .deliver(&binding.return_to, Envelope::TerminalReady { session_id })
                        .await;
                }
            }

            Message::TerminalError { session_id, reason } => {
                if let Some(session) = self.session_for(&session_id, agent_id) {
                    let _ = session.notify(OperatorEvent::TerminalError {
                        session_id,
                        error: reason,
                    });
                    self.teardown(&session, "terminal error", false).await;
                } else if let Some(binding) = self.remote_for(&session_id, agent_id) {
                    self.remote.remove(&binding.session_id);
                    let _ = self
                        .directory
                        .deliver(
                            &binding.return_to,
                            Envelope::TerminalError { session_id, reason },
                        )
                        .await;
                }
            }

            Message::TerminalClosed { session_id } => {
                if let Some(session) = self.session_for(&session_id, agent_id) {
                    self.teardown(&session, "closed by agent", false).await;
                } else if let Some(binding) = self.remote_for(&session_id, agent_id) {
                    self.remote.remove(&binding.session_id);
                    let _ = self
                        .directory
                        .deliver(&binding.return_to, Envelope::TerminalClosed { session_id })
                        .await;
                }
            }

            other => {
                tracing::warn!("Broker got non-terminal frame from {}: {:?}", agent_id, other);
            }
        }
    }

    /// Handle a terminal envelope delivered by a peer replica
    pub async fn on_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::TerminalOpen {
                session_id,
                agent_id,
                rows,
                cols,
                shell,
                return_to,
            } => {
                let binding = Arc::new(RemoteBinding::new(
                    session_id.clone(),
                    agent_id.clone(),
                    return_to.clone(),
                ));
                self.remote.insert(session_id.clone(), Arc::clone(&binding));

                let outcome = self.hub.send(
                    &agent_id,
                    Message::TerminalCommand {
                        session_id: session_id.clone(),
                        action: TerminalAction::Init { rows, cols, shell },
                    },
                );
                if outcome != SendOutcome::Ok {
                    self.remote.remove(&session_id);
                    let _ = self
                        .directory
                        .deliver(
                            &return_to,
                            Envelope::TerminalError {
                                session_id,
                                reason: "agent_offline".to_string(),
                            },
                        )
                        .await;
                }
            }

            Envelope::TerminalInput { session_id, data, seq } => {
                if let Some(binding) = self.get_remote(&session_id) {
                    binding.touch_activity();
                    let ready = binding.push_input(seq, BoundInput::Input(data));
                    self.flush_bound_input(&binding, ready).await;
                }
            }

            Envelope::TerminalResize {
                session_id,
                rows,
                cols,
                seq,
            } => {
                if let Some(binding) = self.get_remote(&session_id) {
                    binding.touch_activity();
                    let ready = binding.push_input(seq, BoundInput::Resize { rows, cols });
                    self.flush_bound_input(&binding, ready).await;
                }
            }

            Envelope::TerminalClose { session_id } => {
                if let Some(binding) = self.get_remote(&session_id) {
                    self.remote.remove(&binding.session_id);
                    self.hub.send(
                        &binding.agent_id,
                        Message::TerminalCommand {
                            session_id,
                            action: TerminalAction::Close,
                        },
                    );
                }
            }

            Envelope::TerminalOutput { session_id, data, seq } => {
                if let Some(session) = self.get(&session_id) {
                    self.deliver_output(&session, seq, data).await;
                }
            }

            Envelope::TerminalReady { session_id } => {
                if let Some(session) = self.get(&session_id) {
                    session.touch_activity();
                    let _ = session.notify(OperatorEvent::TerminalReady { session_id });
                }
            }

            Envelope::TerminalError { session_id, reason } => {
                if let Some(session) = self.get(&session_id) {
                    let _ = session.notify(OperatorEvent::TerminalError {
                        session_id,
                        error: reason,
                    });
                    self.teardown(&session, "terminal error", false).await;
                }
            }

            Envelope::TerminalClosed { session_id } => {
                if let Some(session) = self.get(&session_id) {
                    self.teardown(&session, "closed by agent", false).await;
                }
            }

            Envelope::Evict { .. } | Envelope::EvictAck { .. } => {
                // Hub traffic, routed before the broker sees it
            }
        }
    }

    /// An agent transport on this replica ended; fold up everything bound
    /// to it on both the operator and agent sides.
    pub async fn agent_gone(&self, agent_id: &AgentId) {
        let local: Vec<Arc<TerminalSession>> = self
            .sessions
            .iter()
            .filter(|s| s.agent_id == *agent_id)
            .map(|s| Arc::clone(&s))
            .collect();
        for session in local {
            self.teardown(&session, "agent disconnected", false).await;
        }

        let bindings: Vec<Arc<RemoteBinding>> = self
            .remote
            .iter()
            .filter(|b| b.agent_id == *agent_id)
            .map(|b| Arc::clone(&b))
            .collect();
        for binding in bindings {
            self.drop_binding(&binding, true).await;
        }
    }

    /// Tear down a local session. Exactly one caller wins; the rest no-op.
    pub async fn teardown(
        &self,
        session: &Arc<TerminalSession>,
        reason: &str,
        close_agent_side: bool,
    ) {
        if !session.try_close() {
            return;
        }

        tracing::info!("Terminal session {} closed: {}", session.id, reason);

        if close_agent_side {
            if session.is_local_to(&self.replica_id) {
                self.hub.send(
                    &session.agent_id,
                    Message::TerminalCommand {
                        session_id: session.id.clone(),
                        action: TerminalAction::Close,
                    },
                );
            } else {
                let _ = self
                    .directory
                    .deliver(
                        &session.owner_replica,
                        Envelope::TerminalClose {
                            session_id: session.id.clone(),
                        },
                    )
                    .await;
            }
        }

        let _ = session.notify(OperatorEvent::TerminalClosed {
            session_id: session.id.clone(),
            reason: Some(reason.to_string()),
        });

        session.cancel.cancel();
        self.sessions.remove(&session.id);
    }

    /// Sweep sessions and bindings idle past the configured window
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        let period = (broker.session_idle / 4).max(Duration::from_secs(5));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let idle: Vec<Arc<TerminalSession>> = broker
                            .sessions
                            .iter()
                            .filter(|s| s.idle_for() > broker.session_idle)
                            .map(|s| Arc::clone(&s))
                            .collect();
                        for session in idle {
                            broker.teardown(&session, "idle timeout", true).await;
                        }

                        let stale: Vec<Arc<RemoteBinding>> = broker
                            .remote
                            .iter()
                            .filter(|b| b.idle_for() > broker.session_idle)
                            .map(|b| Arc::clone(&b))
                            .collect();
                        for binding in stale {
                            broker.drop_binding(&binding, false).await;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Sessions currently tracked on this replica
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Get a local session
    pub fn get(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    fn get_remote(&self, session_id: &str) -> Option<Arc<RemoteBinding>> {
        self.remote.get(session_id).map(|b| Arc::clone(&b))
    }

    fn session_for(&self, session_id: &str, agent_id: &AgentId) -> Option<Arc<TerminalSession>> {
        self.get(session_id).filter(|s| s.agent_id == *agent_id)
    }

    fn remote_for(&self, session_id: &str, agent_id: &AgentId) -> Option<Arc<RemoteBinding>> {
        self.get_remote(session_id).filter(|b| b.agent_id == *agent_id)
    }

    /// Push one output chunk through the session's reorder buffer and on
    /// to the operator, decoding base64 to the text the web terminal
    /// renders.
    async fn deliver_output(&self, session: &Arc<TerminalSession>, seq: u64, data: String) {
        session.touch_activity();

        for chunk in session.push_output(seq, data) {
            let output = match BASE64.decode(chunk.as_bytes()) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::warn!("Undecodable output on session {}: {}", session.id, e);
                    continue;
                }
            };

            match session.notify(OperatorEvent::TerminalOutput {
                session_id: session.id.clone(),
                output,
            }) {
                NotifyOutcome::Ok => {}
                NotifyOutcome::Full => {
                    self.teardown(session, "operator too slow", true).await;
                    return;
                }
                NotifyOutcome::Closed => {
                    self.teardown(session, "operator disconnected", true).await;
                    return;
                }
            }
        }
    }

    /// Forward reordered operator→agent items to the local agent transport
    async fn flush_bound_input(&self, binding: &Arc<RemoteBinding>, items: Vec<BoundInput>) {
        for item in items {
            let action = match item {
                BoundInput::Input(data) => TerminalAction::Input { data },
                BoundInput::Resize { rows, cols } => TerminalAction::Resize { rows, cols },
            };
            let outcome = self.hub.send(
                &binding.agent_id,
                Message::TerminalCommand {
                    session_id: binding.session_id.clone(),
                    action,
                },
            );
            if outcome != SendOutcome::Ok {
                self.drop_binding(binding, true).await;
                return;
            }
        }
    }

    /// Remove a remote binding, optionally telling the operator replica
    async fn drop_binding(&self, binding: &Arc<RemoteBinding>, notify_operator: bool) {
        if self.remote.remove(&binding.session_id).is_none() {
            return;
        }
        if notify_operator {
            let _ = self
                .directory
                .deliver(
                    &binding.return_to,
                    Envelope::TerminalClosed {
                        session_id: binding.session_id.clone(),
                    },
                )
                .await;
        }
    }
}
