//! fh-protocol: Wire protocol for FleetHub connections
//!
//! This crate defines the JSON frame envelope exchanged between the hub and
//! its probe agents, and between the hub and operator terminals. Every frame
//! is a single JSON text message with a `type` tag, a `data` object, a Unix
//! timestamp, and an optional correlation id.

pub mod error;
pub mod frame;
pub mod inventory;
pub mod message;
pub mod operator;

pub use error::ProtocolError;
pub use frame::{Frame, MAX_CLOCK_SKEW_SECS};
pub use inventory::{
    chunk_terminal_output, InventorySnapshot, MAX_INVENTORY_BYTES, TERMINAL_CHUNK_BYTES,
};
pub use message::{CloseReason, ErrorCode, Message, TerminalAction, TerminalSize};
pub use operator::{OperatorEvent, OperatorInit, OperatorRequest};

/// Protocol version advertised in the welcome frame.
pub const PROTOCOL_VERSION: &str = "1.0";
