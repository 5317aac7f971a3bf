//! Socket-level tests of the agent connection flow

mod common;

use std::time::Duration;

use common::*;
use fh_core::time::current_time_secs;
use fh_core::AgentId;
use fh_protocol::{ErrorCode, InventorySnapshot, Message};
use fh_server::directory::MemoryDirectory;

fn inventory(collected_at: i64) -> InventorySnapshot {
    InventorySnapshot {
        hostname: "probe-1.local".to_string(),
        os: "linux".to_string(),
        platform: "ubuntu".to_string(),
        arch: "x86_64".to_string(),
        collected_at,
        cpu_count: 4,
        cpu_model: "test-cpu".to_string(),
        memory_total: 16 << 30,
        memory_used: 4 << 30,
        memory_free: 12 << 30,
        disk_total: 256 << 30,
        disk_used: 64 << 30,
        disk_free: 192 << 30,
        ip_addresses: vec!["10.0.0.5".to_string()],
        mac_addresses: vec!["aa:bb:cc:dd:ee:ff".to_string()],
        extensions: serde_json::Map::new(),
    }
}

#[tokio::test]
async fn happy_path_connect_and_first_inventory() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (state, addr) = start_replica("r1", &directory).await;

    let mut agent = connect_agent(addr, AGENT, SECRET).await;

    // Welcome advertises the cadences
    let frame = next_frame(&mut agent).await;
    match frame.message {
        Message::Welcome {
            agent_id,
            heartbeat_interval_s,
            inventory_interval_s,
            ..
        } => {
            assert_eq!(agent_id, AGENT);
            assert_eq!(heartbeat_interval_s, 15);
            assert_eq!(inventory_interval_s, 60);
        }
        other => panic!("expected welcome, got {:?}", other),
    }

    // First inventory straight after welcome
    let collected_at = current_time_secs();
    send_frame(&mut agent, Message::Inventory(inventory(collected_at))).await;

    let frame = next_frame(&mut agent).await;
    match frame.message {
        Message::InventoryAck { received, changed } => {
            assert!(received);
            assert!(changed);
        }
        other => panic!("expected inventory_ack, got {:?}", other),
    }

    // Write-through happened before the ack
    let stored = state.snapshots.latest(&AgentId::new(AGENT)).await.unwrap();
    assert_eq!(stored.collected_at, collected_at);

    // Presence points at this replica
    let entry = state
        .directory
        .lookup(&AgentId::new(AGENT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.replica_id.as_str(), "r1");
}

#[tokio::test]
async fn heartbeat_is_acked() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (_state, addr) = start_replica("r1", &directory).await;

    let mut agent = connect_agent(addr, AGENT, SECRET).await;
    let _welcome = next_frame(&mut agent).await;

    send_frame(
        &mut agent,
        Message::Heartbeat {
            status: "alive".to_string(),
            uptime_s: 42,
            agent_version: "1.0.0".to_string(),
        },
    )
    .await;

    let frame = next_frame(&mut agent).await;
    match frame.message {
        Message::HeartbeatAck { server_time_s } => assert!(server_time_s > 0),
        other => panic!("expected heartbeat_ack, got {:?}", other),
    }
}

#[tokio::test]
async fn bad_secret_gets_auth_error_and_close() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (state, addr) = start_replica("r1", &directory).await;

    let mut agent = connect_agent(addr, AGENT, "wrong").await;

    let frame = next_frame(&mut agent).await;
    match frame.message {
        Message::Error { code, .. } => assert_eq!(code, ErrorCode::Auth),
        other => panic!("expected auth error, got {:?}", other),
    }
    expect_closed(&mut agent).await;

    // No presence entry was created
    assert!(state
        .directory
        .lookup(&AgentId::new(AGENT))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unknown_agent_rejected() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (_state, addr) = start_replica("r1", &directory).await;

    let mut agent = connect_agent(addr, "ghost", SECRET).await;

    let frame = next_frame(&mut agent).await;
    assert!(matches!(
        frame.message,
        Message::Error {
            code: ErrorCode::Auth,
            ..
        }
    ));
    expect_closed(&mut agent).await;
}

#[tokio::test]
async fn oversize_inventory_rejected_without_close() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (_state, addr) = start_replica("r1", &directory).await;

    let mut agent = connect_agent(addr, AGENT, SECRET).await;
    let _welcome = next_frame(&mut agent).await;

    // 2 MiB of extension payload, comfortably past the cap
    let mut snapshot = inventory(current_time_secs());
    snapshot.extensions.insert(
        "padding".to_string(),
        serde_json::Value::String("x".repeat(2 * 1024 * 1024)),
    );
    send_frame(&mut agent, Message::Inventory(snapshot)).await;

    let frame = next_frame(&mut agent).await;
    assert!(matches!(
        frame.message,
        Message::Error {
            code: ErrorCode::InvalidMessage,
            ..
        }
    ));

    // Transport survives; heartbeats still flow
    send_frame(
        &mut agent,
        Message::Heartbeat {
            status: "alive".to_string(),
            uptime_s: 43,
            agent_version: "1.0.0".to_string(),
        },
    )
    .await;
    let frame = next_frame(&mut agent).await;
    assert!(matches!(frame.message, Message::HeartbeatAck { .. }));
}

#[tokio::test]
async fn stale_timestamp_rejected() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (_state, addr) = start_replica("r1", &directory).await;

    let mut agent = connect_agent(addr, AGENT, SECRET).await;
    let _welcome = next_frame(&mut agent).await;

    // Hand-build a heartbeat frame dated ten minutes ago
    let stale = serde_json::json!({
        "type": "heartbeat",
        "data": {"status": "alive", "uptime_s": 1, "agent_version": "1.0.0"},
        "timestamp": current_time_secs() - 600,
    });
    use futures_util::SinkExt;
    agent
        .send(tokio_tungstenite::tungstenite::Message::Text(
            stale.to_string(),
        ))
        .await
        .unwrap();

    let frame = next_frame(&mut agent).await;
    assert!(matches!(
        frame.message,
        Message::Error {
            code: ErrorCode::InvalidMessage,
            ..
        }
    ));
    expect_closed(&mut agent).await;
}

#[tokio::test]
async fn disconnect_deregisters_presence() {
    let directory = MemoryDirectory::new(Duration::from_secs(45));
    let (state, addr) = start_replica("r1", &directory).await;

    let mut agent = connect_agent(addr, AGENT, SECRET).await;
    let _welcome = next_frame(&mut agent).await;

    agent.close(None).await.unwrap();

    // Reconnect-idempotence: the entry is gone shortly after the close
    let agent_id = AgentId::new(AGENT);
    for _ in 0..50 {
        if state.directory.lookup(&agent_id).await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("presence entry not cleared after disconnect");
}
