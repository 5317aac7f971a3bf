//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not match any known frame shape
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame timestamp is too far from the receiver's clock
    #[error("Frame timestamp skew of {skew_s}s exceeds maximum of {max_s}s")]
    ClockSkew { skew_s: i64, max_s: i64 },

    /// Payload exceeds the configured maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Terminal output payload is not valid base64
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}
