//! Per-session state
//!
//! A terminal session's mutable state lives with the replica that holds
//! the operator transport. When the agent is homed elsewhere, the agent's
//! replica keeps only a lightweight binding that routes frames back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fh_core::time::current_time_millis;
use fh_core::{AgentId, OperatorId, ReplicaId};
use fh_protocol::operator::OperatorEvent;

/// Reorders an at-least-once, possibly shuffled stream back into sequence.
///
/// Duplicates (already delivered or already pending) are dropped; items
/// arriving ahead of a gap are parked until the gap fills.
pub struct ReorderBuffer<T> {
    next_seq: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    /// Buffer expecting sequence numbers from 0
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Accept one item; return everything now deliverable, in order
    pub fn push(&mut self, seq: u64, item: T) -> Vec<T> {
        if seq < self.next_seq {
            return Vec::new();
        }
        self.pending.entry(seq).or_insert(item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_seq) {
            ready.push(item);
            self.next_seq += 1;
        }
        ready
    }

    /// Items parked behind a gap
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of pushing an event toward the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Event queued for the operator's writer
    Ok,
    /// Operator queue full; the session must be torn down rather than let
    /// the queue grow
    Full,
    /// Operator transport already gone
    Closed,
}

/// Operator-side state of one terminal session
pub struct TerminalSession {
    /// Opaque unique id
    pub id: String,
    pub agent_id: AgentId,
    pub operator_id: OperatorId,
    /// Replica that held the agent transport when the session opened
    pub owner_replica: ReplicaId,
    /// Unix seconds
    pub opened_at: i64,
    /// Queue drained by the operator's WebSocket writer
    operator_tx: mpsc::Sender<OperatorEvent>,
    /// Cancels the operator-side task
    pub cancel: CancellationToken,
    /// Exactly one teardown path wins this flag
    closed: AtomicBool,
    last_activity_millis: AtomicU64,
    /// Operator→agent sequence, assigned here (the originating replica)
    input_seq: AtomicU64,
    /// Agent→operator reordering, keyed by the agent-assigned sequence
    output_reorder: Mutex<ReorderBuffer<String>>,
}

impl TerminalSession {
    pub fn new(
        id: String,
        agent_id: AgentId,
        operator_id: OperatorId,
        owner_replica: ReplicaId,
        opened_at: i64,
        operator_tx: mpsc::Sender<OperatorEvent>,
    ) -> Self {
        Self {
            id,
            agent_id,
            operator_id,
            owner_replica,
            opened_at,
            operator_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            last_activity_millis: AtomicU64::new(current_time_millis()),
            input_seq: AtomicU64::new(0),
            output_reorder: Mutex::new(ReorderBuffer::new()),
        }
    }

    /// Claim the session for teardown. Only the first caller gets `true`.
    pub fn try_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether teardown has been claimed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the agent transport is on the same replica as the operator
    pub fn is_local_to(&self, replica: &ReplicaId) -> bool {
        self.owner_replica == *replica
    }

    /// Record traffic in either direction
    pub fn touch_activity(&self) {
        self.last_activity_millis
            .store(current_time_millis(), Ordering::SeqCst);
    }

    /// Time since the last byte in either direction
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_millis.load(Ordering::SeqCst);
        Duration::from_millis(current_time_millis().saturating_sub(last))
    }

    /// Allocate the next operator→agent sequence number
    pub fn next_input_seq(&self) -> u64 {
        self.input_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Feed one output chunk through the reorder buffer
    pub fn push_output(&self, seq: u64, data: String) -> Vec<String> {
        self.output_reorder.lock().unwrap().push(seq, data)
    }

    /// Push an event toward the operator without blocking the caller.
    ///
    /// The dispatching reader must never stall on a slow operator; a full
    /// queue is reported so the caller can tear the session down.
    pub fn notify(&self, event: OperatorEvent) -> NotifyOutcome {
        match self.operator_tx.try_send(event) {
            Ok(()) => NotifyOutcome::Ok,
            Err(mpsc::error::TrySendError::Full(_)) => NotifyOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => NotifyOutcome::Closed,
        }
    }
}

/// Agent-owner-side routing stub for a session whose operator lives on a
/// peer replica
pub struct RemoteBinding {
    pub session_id: String,
    pub agent_id: AgentId,
    /// Replica holding the operator transport
    pub return_to: ReplicaId,
    last_activity_millis: AtomicU64,
    /// Operator→agent reordering of cross-replica input
    input_reorder: Mutex<ReorderBuffer<BoundInput>>,
}

/// One ordered item of the operator→agent stream
#[derive(Debug, Clone)]
pub enum BoundInput {
    Input(String),
    Resize { rows: u16, cols: u16 },
}

impl RemoteBinding {
    pub fn new(session_id: String, agent_id: AgentId, return_to: ReplicaId) -> Self {
        Self {
            session_id,
            agent_id,
            return_to,
            last_activity_millis: AtomicU64::new(current_time_millis()),
            input_reorder: Mutex::new(ReorderBuffer::new()),
        }
    }

    pub fn touch_activity(&self) {
        self.last_activity_millis
            .store(current_time_millis(), Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_millis.load(Ordering::SeqCst);
        Duration::from_millis(current_time_millis().saturating_sub(last))
    }

    /// Feed one cross-replica input through the reorder buffer
    pub fn push_input(&self, seq: u64, input: BoundInput) -> Vec<BoundInput> {
        self.input_reorder.lock().unwrap().push(seq, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_in_order_stream() {
        let mut buf = ReorderBuffer::new();
        assert_eq!(buf.push(0, "a"), vec!["a"]);
        assert_eq!(buf.push(1, "b"), vec!["b"]);
        assert_eq!(buf.push(2, "c"), vec!["c"]);
    }

    #[test]
    fn test_reorder_shuffled_stream() {
        let mut buf = ReorderBuffer::new();
        assert!(buf.push(2, "c").is_empty());
        assert!(buf.push(1, "b").is_empty());
        assert_eq!(buf.pending_len(), 2);
        assert_eq!(buf.push(0, "a"), vec!["a", "b", "c"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_reorder_drops_duplicates() {
        let mut buf = ReorderBuffer::new();
        assert_eq!(buf.push(0, "a"), vec!["a"]);
        assert!(buf.push(0, "a-again").is_empty());

        assert!(buf.push(2, "c").is_empty());
        assert!(buf.push(2, "c-again").is_empty());
        assert_eq!(buf.push(1, "b"), vec!["b", "c"]);
    }

    fn session() -> (TerminalSession, mpsc::Receiver<OperatorEvent>) {
        let (tx, rx) = mpsc::channel(2);
        let session = TerminalSession::new(
            "s-1".to_string(),
            AgentId::new("probe-1"),
            OperatorId::new("op-1"),
            ReplicaId::new("r1"),
            0,
            tx,
        );
        (session, rx)
    }

    #[test]
    fn test_try_close_single_winner() {
        let (session, _rx) = session();
        assert!(session.try_close());
        assert!(!session.try_close());
        assert!(session.is_closed());
    }

    #[test]
    fn test_input_seq_monotonic() {
        let (session, _rx) = session();
        assert_eq!(session.next_input_seq(), 0);
        assert_eq!(session.next_input_seq(), 1);
        assert_eq!(session.next_input_seq(), 2);
    }

    #[tokio::test]
    async fn test_notify_reports_full_queue() {
        let (session, _rx) = session();
        let event = OperatorEvent::TerminalReady {
            session_id: "s-1".to_string(),
        };

        assert_eq!(session.notify(event.clone()), NotifyOutcome::Ok);
        assert_eq!(session.notify(event.clone()), NotifyOutcome::Ok);
        assert_eq!(session.notify(event), NotifyOutcome::Full);
    }

    #[tokio::test]
    async fn test_notify_reports_closed_operator() {
        let (session, rx) = session();
        drop(rx);
        let event = OperatorEvent::TerminalClosed {
            session_id: "s-1".to_string(),
            reason: None,
        };
        assert_eq!(session.notify(event), NotifyOutcome::Closed);
    }
}
