//! FleetHub probe agent library
//!
//! The agent keeps one WebSocket connection to the hub, heartbeats on the
//! cadence the welcome frame dictates, submits inventory snapshots, and
//! serves terminal sessions against local PTYs. On any failure it
//! reconnects with jittered exponential backoff.

pub mod collector;
pub mod connection;
pub mod reconnect;
pub mod runtime;
pub mod terminal;

pub use connection::{AgentEvent, ConnectError, ConnectionSender, ServerConnection};
pub use reconnect::ExponentialBackoff;
pub use runtime::AgentRuntime;
