//! Shared fixtures for socket-level tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use fh_core::config::ServerConfig;
use fh_core::{AgentId, AgentRecord, OperatorId};
use fh_server::auth::StaticAuthority;
use fh_server::directory::MemoryDirectory;
use fh_server::snapshot::MemorySnapshotStore;
use fh_server::{ws, ServerState};
use fh_protocol::{Frame, Message};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const AGENT: &str = "probe-1";
pub const SECRET: &str = "s3cret";
pub const OPERATOR_TOKEN: &str = "tok-1";

pub fn test_record() -> AgentRecord {
    AgentRecord {
        agent_id: AgentId::new(AGENT),
        owner_id: OperatorId::new("op-1"),
        secret: SECRET.to_string(),
        hostname: "probe-1.local".to_string(),
        platform: "linux".to_string(),
        architecture: "x86_64".to_string(),
        agent_version: "1.0.0".to_string(),
        registered_at: 1_700_000_000,
        last_connected_at: 0,
    }
}

/// Start one replica on an ephemeral port, sharing `directory`
pub async fn start_replica(
    replica: &str,
    directory: &MemoryDirectory,
) -> (Arc<ServerState>, SocketAddr) {
    let config = ServerConfig {
        replica_id: Some(replica.to_string()),
        listen_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };

    let auth = StaticAuthority::with_records(
        vec![test_record()],
        vec![(OPERATOR_TOKEN.to_string(), OperatorId::new("op-1"))],
    );

    let state = ServerState::new(
        config,
        Arc::new(directory.clone()),
        Arc::new(MemorySnapshotStore::new(8)),
        Arc::new(auth),
    );
    state.spawn_background().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = ws::router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (state, addr)
}

/// Open an agent socket and complete the hello/welcome handshake
pub async fn connect_agent(addr: SocketAddr, agent_id: &str, secret: &str) -> WsClient {
    let (mut stream, _) = connect_async(format!("ws://{}/agent/connect", addr))
        .await
        .unwrap();

    send_frame(
        &mut stream,
        Message::Hello {
            agent_id: agent_id.to_string(),
            secret: secret.to_string(),
            agent_version: "1.0.0".to_string(),
        },
    )
    .await;

    stream
}

/// Open an operator terminal socket and send the sizing frame
pub async fn connect_operator(addr: SocketAddr, agent_id: &str, token: &str) -> WsClient {
    let (mut stream, _) = connect_async(format!("ws://{}/terminal/{}?token={}", addr, agent_id, token))
        .await
        .unwrap();

    stream
        .send(WsMessage::Text(r#"{"cols":80,"rows":24}"#.to_string()))
        .await
        .unwrap();

    stream
}

pub async fn send_frame(stream: &mut WsClient, message: Message) {
    let text = Frame::new(message).encode().unwrap();
    stream.send(WsMessage::Text(text)).await.unwrap();
}

/// Next protocol frame, skipping pings; panics after 5s of silence
pub async fn next_frame(stream: &mut WsClient) -> Frame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            WsMessage::Text(text) => return Frame::decode(&text).unwrap(),
            WsMessage::Close(_) => panic!("stream closed while waiting for frame"),
            _ => continue,
        }
    }
}

/// Next operator-dialect JSON object; panics after 5s of silence
pub async fn next_operator_json(stream: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for operator frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Close(_) => panic!("stream closed while waiting for operator frame"),
            _ => continue,
        }
    }
}

/// Wait for the socket to end (close frame or EOF)
pub async fn expect_closed(stream: &mut WsClient) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(WsMessage::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    }
}
