//! Process-shared in-memory directory backend
//!
//! Entries expire lazily on read plus via a background sweeper, so a
//! crashed replica's registrations disappear within one TTL window even if
//! nothing looks them up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fh_core::{AgentId, DirectoryError, PresenceStatus, ReplicaId};

use super::{Envelope, PresenceDirectory, PresenceEntry, StatusEvent, TouchResult};

/// Capacity of each replica's envelope inbox.
///
/// Holds cross-replica terminal traffic between delivery and dispatch. A
/// full inbox fails the delivery rather than blocking the sender; terminal
/// sessions tolerate the loss through their sequence numbers, and anything
/// else is retried by its caller.
const INBOX_CAPACITY: usize = 256;

/// Capacity of the status-transition broadcast channel
const STATUS_CAPACITY: usize = 256;

struct StoredEntry {
    entry: PresenceEntry,
    expires_at: Instant,
}

struct Inner {
    ttl: Duration,
    entries: Mutex<HashMap<AgentId, StoredEntry>>,
    inboxes: Mutex<HashMap<ReplicaId, mpsc::Sender<Envelope>>>,
    status_tx: broadcast::Sender<StatusEvent>,
}

/// In-memory [`PresenceDirectory`] backend.
///
/// Cloning yields another handle onto the same store; every replica in a
/// deployment (or test) shares one clone.
#[derive(Clone)]
pub struct MemoryDirectory {
    inner: Arc<Inner>,
}

impl MemoryDirectory {
    /// Create a directory whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ttl,
                entries: Mutex::new(HashMap::new()),
                inboxes: Mutex::new(HashMap::new()),
                status_tx,
            }),
        }
    }

    /// Spawn the background sweeper that expires stale entries.
    ///
    /// Sweeps at half the TTL so an entry never outlives 1.5x its window.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let period = inner.ttl / 2;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep_expired(&inner);
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("Directory sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Number of live (unexpired) entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.inner.entries.lock().unwrap();
        entries.values().filter(|s| s.expires_at > now).count()
    }

    /// Whether the directory holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remove expired entries and announce the transitions
fn sweep_expired(inner: &Inner) {
    let now = Instant::now();
    let mut expired = Vec::new();

    {
        let mut entries = inner.entries.lock().unwrap();
        entries.retain(|agent_id, stored| {
            if stored.expires_at <= now {
                expired.push((agent_id.clone(), stored.entry.replica_id.clone()));
                false
            } else {
                true
            }
        });
    }

    for (agent_id, replica_id) in expired {
        tracing::debug!("Presence entry for {} expired", agent_id);
        let _ = inner.status_tx.send(StatusEvent {
            agent_id,
            status: PresenceStatus::Offline,
            replica_id,
        });
    }
}

#[async_trait]
impl PresenceDirectory for MemoryDirectory {
    async fn register(
        &self,
        agent_id: &AgentId,
        replica_id: &ReplicaId,
        now: i64,
    ) -> Result<(), DirectoryError> {
        let entry = PresenceEntry {
            agent_id: agent_id.clone(),
            status: PresenceStatus::Online,
            replica_id: replica_id.clone(),
            connected_at: now,
            last_heartbeat: now,
        };

        {
            let mut entries = self.inner.entries.lock().unwrap();
            entries.insert(
                agent_id.clone(),
                StoredEntry {
                    entry,
                    expires_at: Instant::now() + self.inner.ttl,
                },
            );
        }

        let _ = self.inner.status_tx.send(StatusEvent {
            agent_id: agent_id.clone(),
            status: PresenceStatus::Online,
            replica_id: replica_id.clone(),
        });

        Ok(())
    }

    async fn touch(&self, agent_id: &AgentId, now: i64) -> Result<TouchResult, DirectoryError> {
        let mut entries = self.inner.entries.lock().unwrap();
        let deadline = Instant::now();

        if let Some(stored) = entries.get_mut(agent_id) {
            if stored.expires_at > deadline {
                stored.entry.last_heartbeat = now;
                stored.expires_at = deadline + self.inner.ttl;
                return Ok(TouchResult::Ok);
            }
        }

        entries.remove(agent_id);
        Ok(TouchResult::Evicted)
    }

    async fn deregister(
        &self,
        agent_id: &AgentId,
        replica_id: &ReplicaId,
    ) -> Result<(), DirectoryError> {
        let removed = {
            let mut entries = self.inner.entries.lock().unwrap();
            let owner_matches = entries
                .get(agent_id)
                .map(|stored| stored.entry.replica_id == *replica_id)
                .unwrap_or(false);
            if owner_matches {
                entries.remove(agent_id);
            }
            owner_matches
        };

        if removed {
            let _ = self.inner.status_tx.send(StatusEvent {
                agent_id: agent_id.clone(),
                status: PresenceStatus::Offline,
                replica_id: replica_id.clone(),
            });
        }

        Ok(())
    }

    async fn lookup(&self, agent_id: &AgentId) -> Result<Option<PresenceEntry>, DirectoryError> {
        let mut entries = self.inner.entries.lock().unwrap();
        let deadline = Instant::now();

        let live = entries
            .get(agent_id)
            .filter(|stored| stored.expires_at > deadline)
            .map(|stored| stored.entry.clone());
        if live.is_none() {
            entries.remove(agent_id);
        }
        Ok(live)
    }

    async fn deliver(
        &self,
        replica_id: &ReplicaId,
        envelope: Envelope,
    ) -> Result<(), DirectoryError> {
        let sender = {
            let inboxes = self.inner.inboxes.lock().unwrap();
            inboxes.get(replica_id).cloned()
        };

        let Some(sender) = sender else {
            return Err(DirectoryError::NoSuchReplica(replica_id.to_string()));
        };

        sender.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                DirectoryError::Unavailable(format!("inbox full for {}", replica_id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                // Receiver gone: the replica is dead, drop its inbox
                let mut inboxes = self.inner.inboxes.lock().unwrap();
                inboxes.remove(replica_id);
                DirectoryError::NoSuchReplica(replica_id.to_string())
            }
        })
    }

    async fn subscribe(
        &self,
        replica_id: &ReplicaId,
    ) -> Result<mpsc::Receiver<Envelope>, DirectoryError> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut inboxes = self.inner.inboxes.lock().unwrap();
        inboxes.insert(replica_id.clone(), tx);
        Ok(rx)
    }

    fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }
}
