//! Snapshot store seam
//!
//! Inventory acceptance is write-through: the ack goes back to the agent
//! only after the store has taken the snapshot. The shipped
//! [`MemorySnapshotStore`] keeps the latest snapshot per agent plus a
//! bounded history of superseded ones; durable deployments put a database
//! behind the same trait.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use fh_core::AgentId;
use fh_protocol::InventorySnapshot;

/// Snapshot store failures
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The backing store is unreachable; the inventory is rejected with
    /// `error{unavailable}` and NOT acked
    #[error("Snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Durable sink for accepted inventory snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot and report whether it differs from the stored
    /// latest. The latest-pointer only advances for snapshots with a
    /// `collected_at` at or past the current one.
    async fn put_inventory(
        &self,
        agent_id: &AgentId,
        snapshot: InventorySnapshot,
    ) -> Result<bool, SnapshotError>;

    /// Latest accepted snapshot for an agent
    async fn latest(&self, agent_id: &AgentId) -> Option<InventorySnapshot>;
}

#[derive(Default)]
struct AgentSnapshots {
    latest: Option<InventorySnapshot>,
    history: VecDeque<InventorySnapshot>,
}

/// In-memory [`SnapshotStore`] with a bounded per-agent history
pub struct MemorySnapshotStore {
    inner: Mutex<HashMap<AgentId, AgentSnapshots>>,
    history_cap: usize,
}

impl MemorySnapshotStore {
    /// Create a store retaining up to `history_cap` superseded snapshots
    /// per agent
    pub fn new(history_cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            history_cap,
        }
    }

    /// History entries currently held for an agent
    pub fn history_len(&self, agent_id: &AgentId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.get(agent_id).map(|s| s.history.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put_inventory(
        &self,
        agent_id: &AgentId,
        snapshot: InventorySnapshot,
    ) -> Result<bool, SnapshotError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.entry(agent_id.clone()).or_default();

        let changed = match &slot.latest {
            Some(latest) => {
                if snapshot.collected_at < latest.collected_at {
                    // Late-arriving snapshot: keep it in history, never
                    // regress the latest pointer
                    slot.history.push_back(snapshot);
                    if slot.history.len() > self.history_cap {
                        slot.history.pop_front();
                    }
                    return Ok(false);
                }

                let changed = snapshot.changed_from(latest);
                if changed {
                    slot.history.push_back(latest.clone());
                    if slot.history.len() > self.history_cap {
                        slot.history.pop_front();
                    }
                }
                changed
            }
            None => true,
        };

        slot.latest = Some(snapshot);
        Ok(changed)
    }

    async fn latest(&self, agent_id: &AgentId) -> Option<InventorySnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.get(agent_id).and_then(|s| s.latest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(hostname: &str, collected_at: i64) -> InventorySnapshot {
        InventorySnapshot {
            hostname: hostname.to_string(),
            os: "linux".to_string(),
            cpu_count: 4,
            memory_total: 16 << 30,
            disk_total: 256 << 30,
            collected_at,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_snapshot_is_a_change() {
        let store = MemorySnapshotStore::new(8);
        let agent = AgentId::new("probe-1");

        let changed = store
            .put_inventory(&agent, snapshot("node-1", 100))
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(store.latest(&agent).await.unwrap().hostname, "node-1");
    }

    #[tokio::test]
    async fn test_identical_snapshot_not_a_change() {
        let store = MemorySnapshotStore::new(8);
        let agent = AgentId::new("probe-1");

        store.put_inventory(&agent, snapshot("node-1", 100)).await.unwrap();
        let changed = store
            .put_inventory(&agent, snapshot("node-1", 200))
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(store.history_len(&agent), 0);
        // Latest pointer still advances
        assert_eq!(store.latest(&agent).await.unwrap().collected_at, 200);
    }

    #[tokio::test]
    async fn test_change_pushes_previous_into_history() {
        let store = MemorySnapshotStore::new(8);
        let agent = AgentId::new("probe-1");

        store.put_inventory(&agent, snapshot("node-1", 100)).await.unwrap();
        let changed = store
            .put_inventory(&agent, snapshot("node-1-renamed", 200))
            .await
            .unwrap();

        assert!(changed);
        assert_eq!(store.history_len(&agent), 1);
        assert_eq!(
            store.latest(&agent).await.unwrap().hostname,
            "node-1-renamed"
        );
    }

    #[tokio::test]
    async fn test_stale_snapshot_never_regresses_latest() {
        let store = MemorySnapshotStore::new(8);
        let agent = AgentId::new("probe-1");

        store.put_inventory(&agent, snapshot("node-1", 200)).await.unwrap();
        let changed = store
            .put_inventory(&agent, snapshot("node-0", 100))
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(store.latest(&agent).await.unwrap().collected_at, 200);
        assert_eq!(store.history_len(&agent), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = MemorySnapshotStore::new(2);
        let agent = AgentId::new("probe-1");

        for i in 0..5 {
            store
                .put_inventory(&agent, snapshot(&format!("node-{}", i), 100 + i))
                .await
                .unwrap();
        }

        assert_eq!(store.history_len(&agent), 2);
    }
}
