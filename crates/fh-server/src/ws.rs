//! WebSocket surface
//!
//! Two upgrade endpoints: `/agent/connect` for probe agents speaking the
//! frame envelope, and `/terminal/{agent_id}` for operator terminals
//! speaking the flat operator dialect. Each socket gets a single writer
//! task draining a bounded queue; readers dispatch into the hub and
//! broker and never write the socket themselves.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use fh_core::time::current_time_secs;
use fh_core::AgentId;
use fh_protocol::operator::{OperatorEvent, OperatorInit, OperatorRequest};
use fh_protocol::{CloseReason, ErrorCode, Frame, Message, MAX_INVENTORY_BYTES};

use crate::hub::{AdmitError, AgentHandle};
use crate::state::ServerState;

/// Deadline for the hello frame after an agent upgrade, and for the
/// initial sizing frame after an operator upgrade
const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Build the replica's router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/agent/connect", get(agent_ws_handler))
        .route("/terminal/:agent_id", get(operator_ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Liveness endpoint with replica identity and load
async fn healthz(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "replica_id": state.replica_id.to_string(),
        "agents": state.hub.len(),
        "sessions": state.broker.len(),
    }))
}

async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

/// Drive one agent transport from handshake to cleanup
async fn handle_agent_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();

    // Handshake: the first frame must be a hello
    let hello = match read_hello(&mut stream).await {
        Ok(hello) => hello,
        Err(reason) => {
            let _ = send_error_frame(&mut sink, ErrorCode::InvalidMessage, &reason).await;
            let _ = sink.close().await;
            return;
        }
    };

    let agent_id = AgentId::new(hello.agent_id.clone());
    if !state.auth.verify_agent(&agent_id, &hello.secret).await {
        tracing::warn!("Rejected hello from {}: bad credentials", agent_id);
        let _ = send_error_frame(&mut sink, ErrorCode::Auth, "authentication failed").await;
        let _ = sink.close().await;
        return;
    }

    let (handle, outbound_rx) = match state
        .hub
        .admit(agent_id.clone(), hello.agent_version)
        .await
    {
        Ok(pair) => pair,
        Err(AdmitError::Draining) => {
            let _ = send_error_frame(&mut sink, ErrorCode::Unavailable, "replica draining").await;
            let _ = sink.close().await;
            return;
        }
        Err(AdmitError::Degraded(e)) => {
            tracing::warn!("Admission of {} refused, directory down: {}", agent_id, e);
            let _ =
                send_error_frame(&mut sink, ErrorCode::Unavailable, "presence directory down")
                    .await;
            let _ = sink.close().await;
            return;
        }
    };

    state.auth.record_connected(&agent_id, current_time_secs()).await;

    // Welcome goes through the queue like every other frame so the writer
    // stays the only socket producer
    let _ = handle.enqueue(state.welcome_frame(&agent_id));

    let writer = tokio::spawn(run_agent_writer(
        sink,
        outbound_rx,
        Arc::clone(&handle),
        state.config.timeouts.write_timeout,
    ));

    tracing::info!("Agent {} connected to {}", agent_id, state.replica_id);

    // Reader runs as its own task so a panic in a handler still reaches
    // the cleanup path below; the replica keeps serving other transports
    let reader = tokio::spawn(run_agent_reader(
        stream,
        Arc::clone(&state),
        Arc::clone(&handle),
    ));
    if let Err(e) = reader.await {
        tracing::error!("Reader for {} failed: {}", agent_id, e);
        handle.close(CloseReason::Internal);
    }

    // Single cleanup path, whoever noticed the death first
    handle.close(CloseReason::Normal);
    state.broker.agent_gone(&agent_id).await;
    state.hub.finish(&handle).await;
    let _ = writer.await;

    tracing::info!(
        "Agent {} disconnected from {} ({})",
        agent_id,
        state.replica_id,
        handle
            .close_reason()
            .unwrap_or(CloseReason::Normal)
    );
}

/// Decode and dispatch inbound frames until the transport dies
async fn run_agent_reader(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    state: Arc<ServerState>,
    handle: Arc<AgentHandle>,
) {
    let agent_id = handle.agent_id.clone();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.len() > MAX_INVENTORY_BYTES {
                            tracing::warn!(
                                "Oversize frame ({} bytes) from {}",
                                text.len(),
                                agent_id
                            );
                            let _ = handle.enqueue(Frame::new(Message::Error {
                                code: ErrorCode::InvalidMessage,
                                message: "frame exceeds size cap".to_string(),
                            }));
                            continue;
                        }

                        match Frame::decode_validated(&text, current_time_secs()) {
                            Ok(frame) => state.handle_agent_frame(&handle, frame).await,
                            Err(e) => {
                                // Schema or timestamp violation: reply then close
                                tracing::warn!("Malformed frame from {}: {}", agent_id, e);
                                let _ = handle.enqueue(Frame::new(Message::Error {
                                    code: ErrorCode::InvalidMessage,
                                    message: e.to_string(),
                                }));
                                handle.close(CloseReason::Normal);
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary
                    Some(Err(e)) => {
                        tracing::warn!("Read error from {}: {}", agent_id, e);
                        break;
                    }
                }
            }
            _ = handle.cancel.cancelled() => break,
        }
    }
}

/// Read and validate the hello frame
async fn read_hello(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Result<HelloFields, String> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next())
        .await
        .map_err(|_| "handshake timed out".to_string())?;

    let text = match first {
        Some(Ok(WsMessage::Text(text))) => text,
        _ => return Err("expected a hello frame".to_string()),
    };

    let frame =
        Frame::decode_validated(&text, current_time_secs()).map_err(|e| e.to_string())?;

    match frame.message {
        Message::Hello {
            agent_id,
            secret,
            agent_version,
        } => Ok(HelloFields {
            agent_id,
            secret,
            agent_version,
        }),
        other => Err(format!("expected hello, got {}", other.kind())),
    }
}

struct HelloFields {
    agent_id: String,
    secret: String,
    agent_version: String,
}

/// The single producer for an agent socket: drains the queue, enforces
/// the write deadline, and emits the close frame when the transport dies.
async fn run_agent_writer(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    handle: Arc<AgentHandle>,
    write_timeout: std::time::Duration,
) {
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if !write_frame(&mut sink, &frame, write_timeout).await {
                    handle.close(CloseReason::Stalled);
                    break;
                }
            }
            _ = handle.cancel.cancelled() => {
                // Drain whatever the handlers already enqueued
                while let Ok(frame) = outbound_rx.try_recv() {
                    if !write_frame(&mut sink, &frame, write_timeout).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    let reason = handle.close_reason().unwrap_or(CloseReason::Normal);
    let _ = sink
        .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: reason.as_str().into(),
        })))
        .await;
}

/// Encode and send one frame within the deadline
async fn write_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: &Frame,
    write_timeout: std::time::Duration,
) -> bool {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode outbound frame: {}", e);
            return true;
        }
    };

    matches!(
        tokio::time::timeout(write_timeout, sink.send(WsMessage::Text(text))).await,
        Ok(Ok(()))
    )
}

/// Send a typed error frame directly (pre-admission, before a writer
/// task exists)
async fn send_error_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    code: ErrorCode,
    message: &str,
) -> Result<(), axum::Error> {
    let frame = Frame::new(Message::Error {
        code,
        message: message.to_string(),
    });
    match frame.encode() {
        Ok(text) => sink.send(WsMessage::Text(text)).await,
        Err(_) => Ok(()),
    }
}

async fn operator_ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_operator_socket(socket, state, agent_id, token))
}

/// Drive one operator terminal from auth to cleanup
async fn handle_operator_socket(
    socket: WebSocket,
    state: Arc<ServerState>,
    agent_id: String,
    token: String,
) {
    let (mut sink, mut stream) = socket.split();

    let Some(operator_id) = state.auth.verify_operator(&token).await else {
        tracing::warn!("Rejected terminal for {}: bad token", agent_id);
        let _ = send_operator_event(
            &mut sink,
            &OperatorEvent::TerminalError {
                session_id: String::new(),
                error: "unauthorised".to_string(),
            },
        )
        .await;
        let _ = sink.close().await;
        return;
    };

    // First frame sizes the terminal
    let init = match read_operator_init(&mut stream).await {
        Ok(init) => init,
        Err(reason) => {
            let _ = send_operator_event(
                &mut sink,
                &OperatorEvent::TerminalError {
                    session_id: String::new(),
                    error: reason,
                },
            )
            .await;
            let _ = sink.close().await;
            return;
        }
    };

    let agent = AgentId::new(agent_id);
    let (session, mut operator_rx) =
        match state.broker.open(operator_id, agent.clone(), init).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::info!("Terminal for {} refused: {}", agent, e);
                let _ = send_operator_event(
                    &mut sink,
                    &OperatorEvent::TerminalError {
                        session_id: String::new(),
                        error: session_error_code(&e),
                    },
                )
                .await;
                let _ = sink.close().await;
                return;
            }
        };

    // Writer: the session's event queue is the only path to this socket
    let session_writer = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = operator_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_operator_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                _ = session_writer.cancel.cancelled() => {
                    while let Ok(event) = operator_rx.try_recv() {
                        if send_operator_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    // Reader: forward keystrokes and resizes until either side ends
    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<OperatorRequest>(&text) {
                            Ok(OperatorRequest::Input { data }) => {
                                state.broker.operator_input(&session.id, data).await;
                            }
                            Ok(OperatorRequest::Resize { cols, rows }) => {
                                state.broker.operator_resize(&session.id, rows, cols).await;
                            }
                            Err(e) => {
                                tracing::debug!(
                                    "Ignoring malformed operator frame on {}: {}",
                                    session.id,
                                    e
                                );
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("Operator read error on {}: {}", session.id, e);
                        break;
                    }
                }
            }
            _ = session.cancel.cancelled() => break,
        }
    }

    state.broker.operator_gone(&session.id).await;
    let _ = writer.await;
}

/// Read the initial `{cols, rows, shell}` frame
async fn read_operator_init(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Result<OperatorInit, String> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next())
        .await
        .map_err(|_| "no sizing frame".to_string())?;

    match first {
        Some(Ok(WsMessage::Text(text))) => {
            serde_json::from_str(&text).map_err(|e| format!("bad sizing frame: {}", e))
        }
        _ => Err("expected a sizing frame".to_string()),
    }
}

async fn send_operator_event(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    event: &OperatorEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sink.send(WsMessage::Text(text)).await,
        Err(e) => {
            tracing::error!("Failed to encode operator event: {}", e);
            Ok(())
        }
    }
}

/// Map a session error onto the operator-visible error string
fn session_error_code(error: &fh_core::SessionError) -> String {
    match error {
        fh_core::SessionError::Unauthorised(_) => "unauthorised".to_string(),
        fh_core::SessionError::AgentOffline(_) => "agent_offline".to_string(),
        fh_core::SessionError::Unavailable(_) => "unavailable".to_string(),
        other => other.to_string(),
    }
}
