//! Presence directory
//!
//! The authoritative, cross-replica answer to "is agent A online, and which
//! replica holds its transport?". The directory also carries point-to-point
//! envelopes between replicas, which is how a terminal session reaches an
//! agent homed on a peer.
//!
//! The backing store is behind the [`PresenceDirectory`] trait; the shipped
//! [`MemoryDirectory`] backend is process-shared and serves single-host
//! deployments and tests. A clustered deployment substitutes a networked
//! implementation of the same trait.

mod memory;

pub use memory::MemoryDirectory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use fh_core::{AgentId, DirectoryError, PresenceStatus, ReplicaId};

/// One presence record as stored in the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub agent_id: AgentId,
    pub status: PresenceStatus,
    pub replica_id: ReplicaId,
    /// Unix seconds
    pub connected_at: i64,
    /// Unix seconds
    pub last_heartbeat: i64,
}

/// Outcome of a `touch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchResult {
    /// TTL extended
    Ok,
    /// No live entry existed; the caller must re-register
    Evicted,
}

/// A presence transition observed fleet-wide.
///
/// Replicas use these to drop local state when an agent they hold gets
/// re-homed elsewhere.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub agent_id: AgentId,
    pub status: PresenceStatus,
    pub replica_id: ReplicaId,
}

/// Point-to-point notification addressed to a named replica.
///
/// Envelopes are at-least-once: receivers dedupe and reorder terminal
/// traffic by `(session_id, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Open a terminal toward an agent homed on the receiving replica
    TerminalOpen {
        session_id: String,
        agent_id: AgentId,
        rows: u16,
        cols: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        /// Replica holding the operator transport; terminal traffic for
        /// this session flows back to it
        return_to: ReplicaId,
    },
    /// Operator keystrokes, ordered by `seq` within the session
    TerminalInput {
        session_id: String,
        data: String,
        seq: u64,
    },
    /// Operator resize, sharing the input direction's sequence
    TerminalResize {
        session_id: String,
        rows: u16,
        cols: u16,
        seq: u64,
    },
    /// Operator-side close of a remote session
    TerminalClose { session_id: String },
    /// PTY output heading back to the operator replica
    TerminalOutput {
        session_id: String,
        data: String,
        seq: u64,
    },
    /// Agent confirmed the PTY is up
    TerminalReady { session_id: String },
    /// Agent-side terminal failure
    TerminalError { session_id: String, reason: String },
    /// Agent-side session end
    TerminalClosed { session_id: String },
    /// Ask the receiving replica to drop its transport for an agent that
    /// just reconnected elsewhere
    Evict {
        agent_id: AgentId,
        reply_to: ReplicaId,
    },
    /// Confirmation that the eviction happened
    EvictAck { agent_id: AgentId },
}

/// Shared key-value + pub/sub store mapping agents to their owning replica.
///
/// Every operation may fail [`DirectoryError::Unavailable`]; on that, the
/// hub stops admitting new agents but keeps serving connected ones.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Record `agent_id` as online on `replica_id`, starting the TTL window
    async fn register(
        &self,
        agent_id: &AgentId,
        replica_id: &ReplicaId,
        now: i64,
    ) -> Result<(), DirectoryError>;

    /// Refresh the heartbeat timestamp and extend the TTL
    async fn touch(&self, agent_id: &AgentId, now: i64) -> Result<TouchResult, DirectoryError>;

    /// Conditional delete: a no-op unless `replica_id` is still the
    /// recorded owner, so a stale replica cannot clear a fresh reconnect
    async fn deregister(
        &self,
        agent_id: &AgentId,
        replica_id: &ReplicaId,
    ) -> Result<(), DirectoryError>;

    /// Current presence entry, if any
    async fn lookup(&self, agent_id: &AgentId) -> Result<Option<PresenceEntry>, DirectoryError>;

    /// Deliver an envelope to the named replica's inbox
    async fn deliver(
        &self,
        replica_id: &ReplicaId,
        envelope: Envelope,
    ) -> Result<(), DirectoryError>;

    /// Open this replica's envelope inbox. Called once per replica.
    async fn subscribe(
        &self,
        replica_id: &ReplicaId,
    ) -> Result<mpsc::Receiver<Envelope>, DirectoryError>;

    /// Subscribe to fleet-wide presence transitions
    fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent>;
}
