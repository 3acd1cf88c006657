//! # Bus Error Types
//!
//! Error types for the notification server and client.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Bus Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Admission     │  │     Transport           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  AdmissionDenied│  │  ConnectionFailed       │ │
//! │  │  InvalidUrl     │  │                 │  │  HttpStatus / Timeout   │ │
//! │  │  ConfigLoad/Save│  │                 │  │  Disconnected           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Protocol     │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  Serialization  │  │  ChannelError   │                              │
//! │  │  Frame          │  │  ShuttingDown   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Write failures on individual push channels are deliberately NOT errors:
//! they are reported through `BroadcastReport` and never reach the publisher.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use herald_core::CoreError;

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors produced by the notification server and client.
#[derive(Debug, Error)]
pub enum BusError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid events endpoint URL.
    #[error("Invalid events URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Admission Errors
    // =========================================================================
    /// The caller's session was missing, invalid or expired.
    #[error("Admission denied: {0}")]
    AdmissionDenied(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the push channel.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The server answered the channel request with a non-success status.
    #[error("Events endpoint returned HTTP {0}")]
    HttpStatus(u16),

    /// Channel open timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// The channel ended or failed mid-stream.
    #[error("Push channel disconnected: {0}")]
    Disconnected(String),

    /// Failed to bind the hub listener.
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Failed to serialize an envelope or body.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Failed to decode a frame.
    #[error("Frame error: {0}")]
    Frame(#[from] CoreError),

    /// A publish request was well-formed JSON but not a usable event.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Actor channel closed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The client or server is shutting down.
    #[error("Shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for BusError {
    fn from(err: url::ParseError) -> Self {
        BusError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for BusError {
    fn from(err: toml::de::Error) -> Self {
        BusError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for BusError {
    fn from(err: toml::ser::Error) -> Self {
        BusError::ConfigSaveFailed(err.to_string())
    }
}

impl From<reqwest::Error> for BusError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return BusError::Timeout(0);
        }
        match err.status() {
            Some(status) => BusError::HttpStatus(status.as_u16()),
            None => BusError::ConnectionFailed(err.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for BusError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => BusError::AdmissionDenied("session expired".into()),
            _ => BusError::AdmissionDenied(format!("invalid session token: {}", err)),
        }
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl BusError {
    /// Returns true if the client should schedule a reconnect after this error.
    ///
    /// Admission failures and 4xx answers are not retried automatically;
    /// the console has to re-authenticate first.
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::ConnectionFailed(_)
            | BusError::Timeout(_)
            | BusError::Disconnected(_) => true,
            BusError::HttpStatus(code) => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BusError::InvalidConfig(_)
                | BusError::InvalidUrl(_)
                | BusError::ConfigLoadFailed(_)
                | BusError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the server refused the session.
    pub fn is_admission_error(&self) -> bool {
        matches!(self, BusError::AdmissionDenied(_) | BusError::HttpStatus(401 | 403))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            BusError::AdmissionDenied(_) => StatusCode::UNAUTHORIZED,
            BusError::Serialization(_) | BusError::Frame(_) | BusError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            BusError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BusError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
