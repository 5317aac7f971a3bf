//! Operator-facing wire contract
//!
//! The web terminal speaks a flat JSON dialect over its own WebSocket: an
//! initial sizing frame, then typed input/resize frames inbound and typed
//! terminal events outbound. It never sees the agent envelope.

use serde::{Deserialize, Serialize};

/// First frame an operator sends after the upgrade, sizing the terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorInit {
    pub cols: u16,
    pub rows: u16,
    /// Preferred shell; empty or absent means the agent default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// Frames an operator sends while a session is active
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorRequest {
    /// Keystrokes for the remote PTY
    Input { data: String },
    /// New terminal dimensions
    Resize { cols: u16, rows: u16 },
}

/// Frames the server sends to an operator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorEvent {
    /// The agent-side PTY is up; input will be accepted from here on
    TerminalReady { session_id: String },
    /// Decoded PTY output, in production order
    TerminalOutput { session_id: String, output: String },
    /// The session failed; the transport closes after this frame
    TerminalError { session_id: String, error: String },
    /// The session ended
    TerminalClosed {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}
