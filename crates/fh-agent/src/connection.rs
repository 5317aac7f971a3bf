//! Hub connection
//!
//! Establishes the WebSocket transport, drives the hello/welcome
//! handshake, and splits the connection into a reader task (frames in,
//! events out) and a writer task (the only socket producer, fed by a
//! bounded queue shared with the PTY readers).

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use fh_core::config::AgentConfig;
use fh_protocol::{
    chunk_terminal_output, ErrorCode, Frame, InventorySnapshot, Message, TerminalAction,
};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Capacity of the outbound frame queue.
///
/// Shared by the heartbeat timer, the inventory timer, and every PTY
/// reader; sized for a burst of terminal output without letting a dead
/// socket absorb unbounded memory.
const OUTBOUND_QUEUE: usize = 256;

/// Capacity of the inbound event queue
const EVENT_QUEUE: usize = 256;

/// Connection errors that decide the retry policy
#[derive(Debug, Error)]
pub enum ConnectError {
    /// TCP/WebSocket establishment failed
    #[error("connect failed: {0}")]
    Transport(String),

    /// The hub rejected our credentials
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Connected but the welcome never arrived or was malformed
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Cadences and identity delivered by the welcome frame
#[derive(Debug, Clone)]
pub struct WelcomeInfo {
    pub server_version: String,
    pub heartbeat_interval: Duration,
    pub inventory_interval: Duration,
}

/// Events surfaced to the runtime loop
#[derive(Debug)]
pub enum AgentEvent {
    /// A terminal control frame
    Terminal {
        session_id: String,
        action: TerminalAction,
    },
    /// Heartbeat acknowledged
    HeartbeatAck { server_time_s: u64 },
    /// Inventory acknowledged
    InventoryAck { changed: bool },
    /// Server-initiated command
    Command {
        message_id: Option<String>,
        name: String,
        args: serde_json::Value,
    },
    /// Typed error frame from the hub
    ErrorFrame { code: ErrorCode, message: String },
    /// Transport ended
    Disconnected,
}

/// Clonable handle for enqueueing frames; held by timers and PTY readers
#[derive(Clone)]
pub struct ConnectionSender {
    outbound_tx: mpsc::Sender<Frame>,
}

impl ConnectionSender {
    /// Enqueue a frame; fails when the transport is gone or saturated
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound_tx.try_send(frame).is_ok()
    }

    /// Enqueue from a blocking thread (PTY readers), waiting for queue
    /// space rather than dropping output
    pub fn send_blocking(&self, frame: Frame) -> bool {
        self.outbound_tx.blocking_send(frame).is_ok()
    }

    /// Split, encode, and enqueue raw PTY output, assigning sequence
    /// numbers from `next_seq`. Returns the sequence after the last chunk.
    pub fn send_terminal_output(&self, session_id: &str, data: &[u8], mut next_seq: u64) -> u64 {
        for chunk in chunk_terminal_output(data) {
            let frame = Frame::new(Message::TerminalOutput {
                session_id: session_id.to_string(),
                data: BASE64.encode(chunk),
                seq: next_seq,
            });
            if !self.send_blocking(frame) {
                break;
            }
            next_seq += 1;
        }
        next_seq
    }

    pub fn send_terminal_ready(&self, session_id: &str) -> bool {
        self.send(Frame::new(Message::TerminalReady {
            session_id: session_id.to_string(),
        }))
    }

    pub fn send_terminal_error(&self, session_id: &str, reason: &str) -> bool {
        self.send(Frame::new(Message::TerminalError {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        }))
    }

    pub fn send_terminal_closed(&self, session_id: &str) -> bool {
        self.send(Frame::new(Message::TerminalClosed {
            session_id: session_id.to_string(),
        }))
    }

    /// Terminal-closed from a PTY reader thread
    pub fn send_terminal_closed_blocking(&self, session_id: &str) -> bool {
        self.send_blocking(Frame::new(Message::TerminalClosed {
            session_id: session_id.to_string(),
        }))
    }

    pub fn send_heartbeat(&self, uptime_s: u64, agent_version: &str) -> bool {
        self.send(Frame::new(Message::Heartbeat {
            status: "alive".to_string(),
            uptime_s,
            agent_version: agent_version.to_string(),
        }))
    }

    pub fn send_inventory(&self, snapshot: InventorySnapshot) -> bool {
        self.send(Frame::new(Message::Inventory(snapshot)))
    }

    /// Echo a command's correlation id back with the response
    pub fn send_command_response(
        &self,
        message_id: Option<String>,
        success: bool,
        output: serde_json::Value,
    ) -> bool {
        let mut frame = Frame::new(Message::CommandResponse { success, output });
        frame.message_id = message_id;
        self.send(frame)
    }
}

/// An established, authenticated connection to the hub
pub struct ServerConnection {
    sender: ConnectionSender,
    event_rx: mpsc::Receiver<AgentEvent>,
    /// Cadences the hub told us to use
    pub welcome: WelcomeInfo,
    cancel: CancellationToken,
}

impl ServerConnection {
    /// Connect, authenticate, and spawn the transport tasks
    pub async fn connect(config: &AgentConfig) -> Result<Self, ConnectError> {
        let agent_id = config.agent_id();

        tracing::debug!("Connecting to {}", config.server_url);
        let (stream, _) = tokio::time::timeout(
            config.connect_timeout,
            connect_async(config.server_url.as_str()),
        )
        .await
        .map_err(|_| ConnectError::Transport("connection timed out".to_string()))?
        .map_err(|e| ConnectError::Transport(e.to_string()))?;

        let (mut sink, mut stream) = stream.split();

        // Hello goes out before any task exists
        let hello = Frame::new(Message::Hello {
            agent_id: agent_id.clone(),
            secret: config.secret.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        });
        sink.send(WsMessage::Text(
            hello
                .encode()
                .map_err(|e| ConnectError::Handshake(e.to_string()))?,
        ))
        .await
        .map_err(|e| ConnectError::Transport(e.to_string()))?;

        // The reply decides whether we are in; configured cadences stand
        // in where the welcome leaves one unset
        let mut welcome = Self::await_welcome(&mut stream, config.handshake_timeout).await?;
        if welcome.heartbeat_interval.is_zero() {
            welcome.heartbeat_interval = config.heartbeat_interval;
        }
        if welcome.inventory_interval.is_zero() {
            welcome.inventory_interval = config.inventory_interval;
        }
        tracing::info!(
            "Connected to hub (server {}, heartbeat {}s, inventory {}s)",
            welcome.server_version,
            welcome.heartbeat_interval.as_secs(),
            welcome.inventory_interval.as_secs()
        );

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(EVENT_QUEUE);
        let cancel = CancellationToken::new();

        // Writer: the only socket producer
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match frame.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!("Failed to encode frame: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            tracing::warn!("Write error: {}", e);
                            writer_cancel.cancel();
                            break;
                        }
                    }
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: frames in, events out
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                match Frame::decode(&text) {
                                    Ok(frame) => {
                                        if let Some(event) = frame_to_event(frame) {
                                            if event_tx.send(event).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Undecodable frame from hub: {}", e);
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                tracing::info!("Hub closed the connection: {:?}", frame);
                                break;
                            }
                            Some(Ok(_)) => {} // ping/pong/binary
                            Some(Err(e)) => {
                                tracing::warn!("Read error: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = reader_cancel.cancelled() => break,
                }
            }

            reader_cancel.cancel();
            let _ = event_tx.send(AgentEvent::Disconnected).await;
        });

        Ok(Self {
            sender: ConnectionSender { outbound_tx },
            event_rx,
            welcome,
            cancel,
        })
    }

    /// Wait for the welcome (or a typed rejection) after the hello
    async fn await_welcome(
        stream: &mut futures_util::stream::SplitStream<
            WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
        >,
        timeout: Duration,
    ) -> Result<WelcomeInfo, ConnectError> {
        loop {
            let reply = tokio::time::timeout(timeout, stream.next())
                .await
                .map_err(|_| ConnectError::Handshake("welcome timed out".to_string()))?;

            let text = match reply {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(ConnectError::Handshake(
                        "connection closed during handshake".to_string(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
            };

            let frame =
                Frame::decode(&text).map_err(|e| ConnectError::Handshake(e.to_string()))?;

            return match frame.message {
                Message::Welcome {
                    server_version,
                    heartbeat_interval_s,
                    inventory_interval_s,
                    ..
                } => Ok(WelcomeInfo {
                    server_version,
                    heartbeat_interval: Duration::from_secs(heartbeat_interval_s),
                    inventory_interval: Duration::from_secs(inventory_interval_s),
                }),
                Message::Error { code, message } if code == ErrorCode::Auth => {
                    Err(ConnectError::AuthRejected(message))
                }
                Message::Error { message, .. } => Err(ConnectError::Handshake(message)),
                other => Err(ConnectError::Handshake(format!(
                    "expected welcome, got {}",
                    other.kind()
                ))),
            };
        }
    }

    /// Handle for producers (timers, PTY readers)
    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    /// Receive the next event from the hub
    pub async fn recv_event(&mut self) -> Option<AgentEvent> {
        self.event_rx.recv().await
    }

    /// Close the transport
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Build a sender around a bare queue for exercising producers in tests
#[cfg(test)]
pub(crate) fn test_sender(outbound_tx: mpsc::Sender<Frame>) -> ConnectionSender {
    ConnectionSender { outbound_tx }
}

/// Map an inbound frame onto a runtime event
fn frame_to_event(frame: Frame) -> Option<AgentEvent> {
    match frame.message {
        Message::TerminalCommand { session_id, action } => {
            Some(AgentEvent::Terminal { session_id, action })
        }
        Message::HeartbeatAck { server_time_s } => {
            Some(AgentEvent::HeartbeatAck { server_time_s })
        }
        Message::InventoryAck { changed, .. } => Some(AgentEvent::InventoryAck { changed }),
        Message::Command { name, args } => Some(AgentEvent::Command {
            message_id: frame.message_id,
            name,
            args,
        }),
        Message::Error { code, message } => Some(AgentEvent::ErrorFrame { code, message }),
        other => {
            tracing::warn!("Unexpected frame from hub: {}", other.kind());
            None
        }
    }
}
