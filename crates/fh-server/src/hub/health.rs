//! Heartbeat supervision
//!
//! A single sweep task per replica closes any local transport that has
//! gone silent past the miss window. Closing cancels the transport's task
//! group; the WebSocket layer's cleanup path then tears down sessions and
//! deregisters presence, so there is exactly one cleanup path regardless
//! of who noticed the death first.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fh_protocol::CloseReason;

use super::ConnectionHub;

/// Monitors transport liveness via observed heartbeats
pub struct HealthMonitor {
    /// Sweep interval
    pub interval: Duration,
    /// Silence after which a transport is closed
    pub timeout: Duration,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Start the supervision task
    pub fn spawn(
        &self,
        hub: Arc<ConnectionHub>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.interval;
        let timeout = self.timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for handle in hub.list() {
                            if !handle.is_healthy(timeout) {
                                tracing::warn!(
                                    "No heartbeat from {} for {:?}, closing transport",
                                    handle.agent_id,
                                    timeout
                                );
                                handle.close(CloseReason::Normal);
                            }
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("Health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
