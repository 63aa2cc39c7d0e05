//! Error types for the HomeSide client
//!
//! One taxonomy covers the whole crate: catalogue problems are fatal at
//! load (`Config`), transport problems are transient and drive the session
//! state machine (`ConnectionLost`/`Timeout`), authentication problems are
//! sticky (`AuthFailed`), and caller errors are rejected synchronously
//! (`NotAuthenticated`/`NotFound`/`OutOfRange`/`WriteRejected`).

use thiserror::Error;

/// Result type alias for HomeSide operations
pub type Result<T> = std::result::Result<T, HomesideError>;

/// Error types for HomeSide controller operations
#[derive(Error, Debug)]
pub enum HomesideError {
    /// Malformed variable catalogue or invalid configuration, fatal at load
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport dropped or was never established; transient, retried with backoff
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No matching response arrived within the bounded window
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Handshake rejected by the controller; never retried automatically
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Write attempted without an authenticated session
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// Unknown variable identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Value violates declared min/max/step bounds
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// Write rejected before reaching the controller
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Controller reported a write error on the wire
    #[error("Controller write error {code}: {text}")]
    WriteFailed { code: i64, text: String },

    /// Handshake or payload cipher failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// WebSocket transport errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid caller input (addresses, values)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON framing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HomesideError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection_lost<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionLost(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn auth_failed<S: Into<String>>(msg: S) -> Self {
        Self::AuthFailed(msg.into())
    }

    pub fn not_authenticated<S: Into<String>>(msg: S) -> Self {
        Self::NotAuthenticated(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn out_of_range<S: Into<String>>(msg: S) -> Self {
        Self::OutOfRange(msg.into())
    }

    pub fn write_rejected<S: Into<String>>(msg: S) -> Self {
        Self::WriteRejected(msg.into())
    }

    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn websocket<S: Into<String>>(msg: S) -> Self {
        Self::WebSocket(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the session may recover from this error by reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HomesideError::ConnectionLost(_)
                | HomesideError::Timeout(_)
                | HomesideError::WebSocket(_)
                | HomesideError::Io(_)
        )
    }

    /// Whether this error requires operator action before any retry
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            HomesideError::AuthFailed(_) | HomesideError::NotAuthenticated(_)
        )
    }

    /// Whether the caller is at fault (rejected synchronously, never retried)
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            HomesideError::NotFound(_)
                | HomesideError::OutOfRange(_)
                | HomesideError::WriteRejected(_)
                | HomesideError::NotAuthenticated(_)
                | HomesideError::InvalidInput(_)
        )
    }
}
