//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::duration_secs;
use crate::error::ConfigError;

/// Configuration for one server replica
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub listen_addr: String,

    /// Replica identifier.
    ///
    /// Replicas sharing a Presence Directory must use distinct ids. Falls
    /// back to the hostname when unset.
    pub replica_id: Option<String>,

    /// Path to the TOML table of registered agent records (id, owner,
    /// secret). Empty table when unset; all agent handshakes are then
    /// rejected.
    pub agent_records_path: Option<PathBuf>,

    /// Maximum frames buffered per transport before the connection is
    /// closed with `backpressure`
    pub write_queue_frames: usize,

    /// Snapshot history entries retained per agent
    pub snapshot_history: usize,

    /// Timers and limits
    pub timeouts: TimeoutConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            replica_id: None,
            agent_records_path: None,
            write_queue_frames: 64,
            snapshot_history: 32,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Get the replica id, falling back to the hostname
    pub fn replica_id(&self) -> String {
        self.replica_id
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// Check the invariants the presence model depends on.
    ///
    /// The presence TTL must outlive two heartbeat intervals (so a single
    /// missed heartbeat cannot evict an entry) and must expire before the
    /// fleet declares the agent offline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timeouts;
        if t.presence_ttl <= t.heartbeat_interval * 2 {
            return Err(ConfigError::Invalid(format!(
                "presence_ttl ({:?}) must be greater than 2x heartbeat_interval ({:?})",
                t.presence_ttl, t.heartbeat_interval
            )));
        }
        if t.presence_ttl >= t.offline_declare {
            return Err(ConfigError::Invalid(format!(
                "presence_ttl ({:?}) must be less than offline_declare ({:?})",
                t.presence_ttl, t.offline_declare
            )));
        }
        if self.write_queue_frames == 0 {
            return Err(ConfigError::Invalid(
                "write_queue_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timers governing liveness, sessions, and shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Heartbeat cadence advertised to agents in the welcome frame
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Inventory cadence advertised to agents in the welcome frame
    #[serde(with = "duration_secs")]
    pub inventory_interval: Duration,

    /// Silence after which a local transport is closed
    #[serde(with = "duration_secs")]
    pub heartbeat_miss: Duration,

    /// Supervisor sweep interval
    #[serde(with = "duration_secs")]
    pub heartbeat_check: Duration,

    /// TTL on presence entries in the directory
    #[serde(with = "duration_secs")]
    pub presence_ttl: Duration,

    /// Upper bound on how long a vanished agent may still be reported
    /// online anywhere in the fleet
    #[serde(with = "duration_secs")]
    pub offline_declare: Duration,

    /// Terminal session teardown after this long with no bytes in either
    /// direction
    #[serde(with = "duration_secs")]
    pub session_idle: Duration,

    /// Deadline on individual outbound socket writes
    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,

    /// Grace period for draining transports at shutdown
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            inventory_interval: Duration::from_secs(60),
            heartbeat_miss: Duration::from_secs(35),
            heartbeat_check: Duration::from_secs(5),
            presence_ttl: Duration::from_secs(45),
            offline_declare: Duration::from_secs(60),
            session_idle: Duration::from_secs(600),
            write_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_presence_ttl_must_exceed_two_heartbeats() {
        let mut config = ServerConfig::default();
        config.timeouts.presence_ttl = Duration::from_secs(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presence_ttl_must_precede_offline_declare() {
        let mut config = ServerConfig::default();
        config.timeouts.presence_ttl = Duration::from_secs(60);
        config.timeouts.offline_declare = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replica_id_falls_back_to_hostname() {
        let config = ServerConfig::default();
        assert!(!config.replica_id().is_empty());

        let named = ServerConfig {
            replica_id: Some("r2".to_string()),
            ..Default::default()
        };
        assert_eq!(named.replica_id(), "r2");
    }
}
