//! Per-agent transport handle
//!
//! One handle per locally-homed agent. Handlers anywhere in the replica
//! enqueue frames; a single writer task (owned by the WebSocket layer)
//! drains the queue, so the socket only ever has one producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fh_core::time::current_time_millis;
use fh_core::{AgentId, ConnectionError};
use fh_protocol::{CloseReason, Frame};

/// Handle to one connected agent's transport
pub struct AgentHandle {
    /// Agent identifier
    pub agent_id: AgentId,
    /// Version reported in the hello frame
    pub agent_version: String,
    /// Bounded queue drained by the transport's writer task
    outbound_tx: mpsc::Sender<Frame>,
    /// Cancelling tears down the reader, the writer, and the supervisor
    pub cancel: CancellationToken,
    /// Last heartbeat observed (epoch millis)
    last_heartbeat_millis: AtomicU64,
    /// When the transport was admitted
    connected_at: Instant,
    /// First close reason wins; later closers are no-ops
    close_reason: Mutex<Option<CloseReason>>,
}

impl AgentHandle {
    /// Create a handle with a fresh outbound queue of `queue_frames` slots
    pub fn new(
        agent_id: AgentId,
        agent_version: String,
        queue_frames: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_frames);
        let handle = Self {
            agent_id,
            agent_version,
            outbound_tx,
            cancel: CancellationToken::new(),
            last_heartbeat_millis: AtomicU64::new(current_time_millis()),
            connected_at: Instant::now(),
            close_reason: Mutex::new(None),
        };
        (handle, outbound_rx)
    }

    /// Enqueue a frame for the writer task.
    ///
    /// A full queue means the agent is not draining its socket; the
    /// transport is closed with `backpressure` rather than letting the
    /// queue balloon.
    pub fn enqueue(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        match self.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Write queue overflow for {}, closing transport",
                    self.agent_id
                );
                self.close(CloseReason::Backpressure);
                Err(ConnectionError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Initiate close with a reason. The first reason sticks; cancellation
    /// cascades to every task in the transport's group.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    /// The reason this transport was closed, once one was recorded
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap()
    }

    /// Update the last heartbeat timestamp
    pub fn record_heartbeat(&self) {
        self.last_heartbeat_millis
            .store(current_time_millis(), Ordering::SeqCst);
    }

    /// Get the last heartbeat timestamp (epoch millis)
    pub fn last_heartbeat_millis(&self) -> u64 {
        self.last_heartbeat_millis.load(Ordering::SeqCst)
    }

    /// Whether a heartbeat was observed within `timeout`
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        let elapsed = current_time_millis().saturating_sub(self.last_heartbeat_millis());
        elapsed < timeout.as_millis() as u64
    }

    /// How long this transport has been up
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
