//! Multi-replica scenarios over one shared directory

mod common;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::*;
use fh_core::AgentId;
use fh_protocol::{Message, TerminalAction};
use fh_server::directory::{MemoryDirectory, PresenceDirectory};

#[tokio::test]
async fn terminal_routes_across_replicas() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (_state1, addr1) = start_replica("r1", &directory).await;
    let (_state2, addr2) = start_replica("r2", &directory).await;

    // Agent homes on r2
    let mut agent = connect_agent(addr2, AGENT, SECRET).await;
    let _welcome = next_frame(&mut agent).await;

    // Operator opens a terminal through r1
    let mut operator = connect_operator(addr1, AGENT, OPERATOR_TOKEN).await;

    // The init command crosses to r2 and reaches the agent
    let frame = next_frame(&mut agent).await;
    let session_id = match frame.message {
        Message::TerminalCommand {
            session_id,
            action: TerminalAction::Init { rows, cols, .. },
        } => {
            assert_eq!(rows, 24);
            assert_eq!(cols, 80);
            session_id
        }
        other => panic!("expected init, got {:?}", other),
    };

    // Agent reports the PTY up; ready crosses back to the operator
    send_frame(
        &mut agent,
        Message::TerminalReady {
            session_id: session_id.clone(),
        },
    )
    .await;
    let event = next_operator_json(&mut operator).await;
    assert_eq!(event["type"], "terminal_ready");
    assert_eq!(event["session_id"], session_id.as_str());

    // Keystrokes flow operator -> r1 -> r2 -> agent
    use futures_util::SinkExt;
    operator
        .send(tokio_tungstenite::tungstenite::Message::Text(
            r#"{"type":"input","data":"ls\n"}"#.to_string(),
        ))
        .await
        .unwrap();
    let frame = next_frame(&mut agent).await;
    match frame.message {
        Message::TerminalCommand {
            action: TerminalAction::Input { data },
            ..
        } => assert_eq!(data, "ls\n"),
        other => panic!("expected input, got {:?}", other),
    }

    // Output flows agent -> r2 -> r1 -> operator, in order
    for (seq, chunk) in ["file-a\r\n", "file-b\r\n"].iter().enumerate() {
        send_frame(
            &mut agent,
            Message::TerminalOutput {
                session_id: session_id.clone(),
                data: BASE64.encode(chunk.as_bytes()),
                seq: seq as u64,
            },
        )
        .await;
    }
    let event = next_operator_json(&mut operator).await;
    assert_eq!(event["type"], "terminal_output");
    assert_eq!(event["output"], "file-a\r\n");
    let event = next_operator_json(&mut operator).await;
    assert_eq!(event["output"], "file-b\r\n");

    // Agent closes the shell; the operator hears about it
    send_frame(&mut agent, Message::TerminalClosed { session_id }).await;
    let event = next_operator_json(&mut operator).await;
    assert_eq!(event["type"], "terminal_closed");
}

#[tokio::test]
async fn reconnect_to_other_replica_moves_ownership() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (_state1, addr1) = start_replica("r1", &directory).await;
    let (state2, addr2) = start_replica("r2", &directory).await;

    // First home: r2
    let mut agent = connect_agent(addr2, AGENT, SECRET).await;
    let _welcome = next_frame(&mut agent).await;
    let entry = directory
        .lookup(&AgentId::new(AGENT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.replica_id.as_str(), "r2");

    // Transport drops; r2 deregisters
    agent.close(None).await.unwrap();
    wait_until(|| {
        let directory = directory.clone();
        async move {
            directory
                .lookup(&AgentId::new(AGENT))
                .await
                .unwrap()
                .is_none()
        }
    })
    .await;

    // Reconnect to r1; the new presence entry points there
    let mut agent = connect_agent(addr1, AGENT, SECRET).await;
    let _welcome = next_frame(&mut agent).await;
    let entry = directory
        .lookup(&AgentId::new(AGENT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.replica_id.as_str(), "r1");
    assert!(state2.hub.is_empty());
}

#[tokio::test]
async fn duplicate_connect_evicts_old_owner() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (state1, addr1) = start_replica("r1", &directory).await;
    let (state2, addr2) = start_replica("r2", &directory).await;

    // Agent connects to r1, then (say, after a netsplit) again to r2
    // without the first transport ever dying
    let mut first = connect_agent(addr1, AGENT, SECRET).await;
    let _welcome = next_frame(&mut first).await;

    let mut second = connect_agent(addr2, AGENT, SECRET).await;
    let _welcome = next_frame(&mut second).await;

    // The old transport is closed and only r2 holds the agent
    expect_closed(&mut first).await;
    wait_until(|| {
        let state1 = std::sync::Arc::clone(&state1);
        async move { state1.hub.is_empty() }
    })
    .await;
    assert_eq!(state2.hub.len(), 1);

    let entry = directory
        .lookup(&AgentId::new(AGENT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.replica_id.as_str(), "r2");
}

#[tokio::test]
async fn operator_sees_agent_offline() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (_state, addr) = start_replica("r1", &directory).await;

    // No agent connected anywhere
    let mut operator = connect_operator(addr, AGENT, OPERATOR_TOKEN).await;
    let event = next_operator_json(&mut operator).await;
    assert_eq!(event["type"], "terminal_error");
    assert_eq!(event["error"], "agent_offline");
    expect_closed(&mut operator).await;
}

#[tokio::test]
async fn operator_with_bad_token_rejected() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (_state, addr) = start_replica("r1", &directory).await;

    let mut operator = connect_operator(addr, AGENT, "bogus").await;
    let event = next_operator_json(&mut operator).await;
    assert_eq!(event["type"], "terminal_error");
    assert_eq!(event["error"], "unauthorised");
    expect_closed(&mut operator).await;
}

/// Poll a condition for up to five seconds
async fn wait_until<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached within 5s");
}
