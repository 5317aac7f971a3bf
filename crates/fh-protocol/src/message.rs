//! Message types for the FleetHub protocol

use serde::{Deserialize, Serialize};

use crate::inventory::InventorySnapshot;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Default terminal size (24x80)
    pub fn default_size() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// Protocol messages, one variant per frame `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// First frame from an agent, carrying its credentials
    Hello {
        agent_id: String,
        secret: String,
        agent_version: String,
    },

    /// Server reply to an accepted hello, carrying the cadences the agent
    /// must adopt
    Welcome {
        agent_id: String,
        server_version: String,
        heartbeat_interval_s: u64,
        inventory_interval_s: u64,
    },

    /// Periodic liveness frame from the agent
    Heartbeat {
        status: String,
        uptime_s: u64,
        agent_version: String,
    },

    /// Server acknowledgement of a heartbeat
    HeartbeatAck { server_time_s: u64 },

    /// Inventory snapshot from the agent
    Inventory(InventorySnapshot),

    /// Server acknowledgement of an accepted inventory
    InventoryAck { received: bool, changed: bool },

    /// Terminal control frame from the server to the agent
    TerminalCommand {
        session_id: String,
        #[serde(flatten)]
        action: TerminalAction,
    },

    /// PTY output from the agent, base64-encoded
    TerminalOutput {
        session_id: String,
        data: String,
        seq: u64,
    },

    /// Agent confirmation that a PTY session is up
    TerminalReady { session_id: String },

    /// Agent-side terminal failure
    TerminalError { session_id: String, reason: String },

    /// Agent notification that a PTY session has ended
    TerminalClosed { session_id: String },

    /// Server-initiated command addressed to the agent, correlated with its
    /// response by the frame's `message_id`
    Command {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },

    /// Agent response to a server command
    CommandResponse {
        success: bool,
        #[serde(default)]
        output: serde_json::Value,
    },

    /// Typed error frame (recoverable unless followed by a close)
    Error { code: ErrorCode, message: String },
}

impl Message {
    /// Get the wire `type` tag for this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Welcome { .. } => "welcome",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatAck { .. } => "heartbeat_ack",
            Message::Inventory(_) => "inventory",
            Message::InventoryAck { .. } => "inventory_ack",
            Message::TerminalCommand { .. } => "terminal_command",
            Message::TerminalOutput { .. } => "terminal_output",
            Message::TerminalReady { .. } => "terminal_ready",
            Message::TerminalError { .. } => "terminal_error",
            Message::TerminalClosed { .. } => "terminal_closed",
            Message::Command { .. } => "command",
            Message::CommandResponse { .. } => "command_response",
            Message::Error { .. } => "error",
        }
    }
}

/// Sub-commands of a `terminal_command` frame, flattened into its data
/// object alongside the session id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TerminalAction {
    /// Create a PTY with the given dimensions and optional shell override
    Init {
        rows: u16,
        cols: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
    },
    /// Raw keystrokes for the PTY
    Input { data: String },
    /// Change the PTY dimensions
    Resize { rows: u16, cols: u16 },
    /// Terminate the PTY process and release the session
    Close,
}

/// Error codes carried in `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid or revoked credentials
    Auth,
    /// Schema or timestamp violation
    InvalidMessage,
    /// Too many frames in a window
    RateLimit,
    /// Operator does not own the target agent
    Unauthorised,
    /// Target agent has no presence entry
    AgentOffline,
    /// A required external collaborator is down
    Unavailable,
    /// Frame referenced a session this side does not know
    UnknownSession,
    /// Uncategorised server-side failure
    Internal,
}

/// Reasons attached to a transport close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Handshake rejected
    Auth,
    /// Target agent not connected anywhere
    AgentOffline,
    /// Operator not permitted
    Unauthorised,
    /// Outbound queue overflowed
    Backpressure,
    /// Outbound write missed its deadline
    Stalled,
    /// A newer transport for the same agent id took over
    DuplicateAgent,
    /// Replica is draining
    Shutdown,
    /// Clean close
    Normal,
    /// Task failure inside the replica; the agent should just reconnect
    Internal,
}

impl CloseReason {
    /// Wire string for this reason
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Auth => "auth",
            CloseReason::AgentOffline => "agent_offline",
            CloseReason::Unauthorised => "unauthorised",
            CloseReason::Backpressure => "backpressure",
            CloseReason::Stalled => "stalled",
            CloseReason::DuplicateAgent => "duplicate_agent",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Normal => "normal",
            CloseReason::Internal => "internal",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
