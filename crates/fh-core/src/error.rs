//! Core error types for FleetHub

use fh_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the FleetHub ecosystem
#[derive(Error, Debug)]
pub enum HubError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Presence directory error
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Handshake credentials rejected
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// First frame was not a hello
    #[error("Handshake violation: {0}")]
    HandshakeViolation(String),

    /// Agent is not homed on this replica
    #[error("Agent not connected here: {0}")]
    NotHere(String),

    /// Transport already closed
    #[error("Transport closed")]
    Closed,

    /// Outbound queue overflowed
    #[error("Write queue overflow")]
    Backpressure,

    /// Connection lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session already exists
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// PTY allocation failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// Target agent has no presence entry
    #[error("Agent offline: {0}")]
    AgentOffline(String),

    /// Operator does not own the target agent
    #[error("Operator not authorised for agent {0}")]
    Unauthorised(String),

    /// A collaborator needed to route the session is down
    #[error("Session routing unavailable: {0}")]
    Unavailable(String),

    /// Session closed unexpectedly
    #[error("Session closed unexpectedly")]
    UnexpectedClose,
}

/// Presence directory errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// The backing store is unreachable; callers fail fast and the hub
    /// enters degraded mode
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// Envelope addressed to a replica with no live subscription
    #[error("No such replica: {0}")]
    NoSuchReplica(String),

    /// Touch on an entry that has already expired
    #[error("Presence entry evicted: {0}")]
    Evicted(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
