//! Frame envelope encoding/decoding
//!
//! Every frame on the wire is one JSON text message:
//!
//! ```json
//! { "type": "...", "data": { ... }, "timestamp": 1700000000, "message_id": "..." }
//! ```
//!
//! `timestamp` is Unix seconds at the sender. Receivers reject frames whose
//! timestamp differs from their own clock by more than [`MAX_CLOCK_SKEW_SECS`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::message::Message;

/// Maximum tolerated difference between a frame's timestamp and the
/// receiver's clock, in seconds.
///
/// Frames outside this window are answered with `error{invalid_message}`
/// and the transport is closed.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// A complete frame: message plus envelope metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// The typed message (`type` + `data` on the wire)
    #[serde(flatten)]
    pub message: Message,
    /// Unix seconds at the sender
    pub timestamp: i64,
    /// Correlation id, set on frames that expect a matched response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Frame {
    /// Create a frame stamped with the current time
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: unix_now(),
            message_id: None,
        }
    }

    /// Create a frame with a fresh correlation id
    pub fn with_message_id(message: Message) -> Self {
        Self {
            message,
            timestamp: unix_now(),
            message_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Encode the frame to its wire representation
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a frame without timestamp validation
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a frame and validate its timestamp against `now` (Unix seconds)
    pub fn decode_validated(text: &str, now: i64) -> Result<Self, ProtocolError> {
        let frame = Self::decode(text)?;
        let skew = (now - frame.timestamp).abs();
        if skew > MAX_CLOCK_SKEW_SECS {
            return Err(ProtocolError::ClockSkew {
                skew_s: skew,
                max_s: MAX_CLOCK_SKEW_SECS,
            });
        }
        Ok(frame)
    }
}

/// Current Unix time in seconds
fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
