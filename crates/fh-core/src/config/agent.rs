//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration_secs;

/// Configuration for the probe agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket URL of the hub, e.g. `wss://hub.example.net/agent/connect`
    pub server_url: String,

    /// This agent's identifier.
    ///
    /// Falls back to the hostname when unset, which is only suitable for
    /// lab setups where hostnames are unique.
    pub agent_id: Option<String>,

    /// Shared secret presented in the hello frame
    pub secret: String,

    /// Heartbeat cadence used until the welcome frame overrides it
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Inventory cadence used until the welcome frame overrides it
    #[serde(with = "duration_secs")]
    pub inventory_interval: Duration,

    /// Shell spawned for terminal sessions when the operator does not ask
    /// for one. Falls back to `$SHELL`, then the platform default.
    pub shell: Option<String>,

    /// Timeout on the TCP+WebSocket connect
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout on the hello/welcome exchange once connected
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/agent/connect".to_string(),
            agent_id: None,
            secret: String::new(),
            heartbeat_interval: Duration::from_secs(15),
            inventory_interval: Duration::from_secs(60),
            shell: None,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Get the agent id, falling back to the hostname
    pub fn agent_id(&self) -> String {
        self.agent_id
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}

/// Exponential backoff parameters for reconnection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Cap on the retry delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Growth factor per consecutive failure
    pub multiplier: f64,

    /// Uniform jitter fraction (0.0 to 1.0) applied to each delay.
    ///
    /// Kept at 0.2 or above in production so a replica restart does not
    /// stampede the fleet onto the listener in lockstep.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_fallback() {
        let config = AgentConfig::default();
        assert!(!config.agent_id().is_empty());

        let named = AgentConfig {
            agent_id: Some("probe-7".to_string()),
            ..Default::default()
        };
        assert_eq!(named.agent_id(), "probe-7");
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = AgentConfig {
            server_url: "wss://hub.example.net/agent/connect".to_string(),
            agent_id: Some("probe-1".to_string()),
            secret: "s3cret".to_string(),
            ..Default::default()
        };

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&text).unwrap();

        assert_eq!(parsed.agent_id(), "probe-1");
        assert_eq!(parsed.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(parsed.backoff.multiplier, 2.0);
    }
}
