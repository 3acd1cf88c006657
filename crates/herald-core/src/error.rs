//! # Error Types
//!
//! Decode errors raised while turning wire frames back into envelopes.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  herald-core errors (this file)                                        │
//! │  └── CoreError        - Frame / envelope decode failures               │
//! │                                                                         │
//! │  herald-bus errors (separate crate)                                    │
//! │  └── BusError         - Config, admission, transport failures          │
//! │                                                                         │
//! │  Flow: CoreError ─► logged and discarded by the client (never fatal)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by the framing and envelope layers.
///
/// None of these are fatal to a connection: a client that receives a bad
/// frame drops that single message and keeps reading.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The frame did not follow the `data: <json>` line format.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame payload was not a valid envelope.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The envelope could not be serialized.
    #[error("Failed to encode envelope: {0}")]
    EncodeFailed(String),
}

impl CoreError {
    /// Returns true if the error came from inbound data rather than our own encoder.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, CoreError::MalformedFrame(_) | CoreError::InvalidEnvelope(_))
    }
}
