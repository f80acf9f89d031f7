//! Errors from the wire layer.

use thiserror::Error;

/// Errors from connections, streams and framing.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to parse frame: {reason} (payload: {preview})")]
    Parse { reason: String, preview: String },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Stream closed before a response was received")]
    StreamClosed,
    #[error("Timed out waiting for response")]
    Timeout,
    #[error("Read aborted: timed out or cancelled")]
    Aborted,
    #[error("Stream creation failed: {0}")]
    StreamCreation(String),
    #[error("Connection invalid: {0}")]
    ConnectionInvalid(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Dial to {address} failed: {reason}")]
    Dial { address: String, reason: String },
}

impl WireError {
    /// Timeouts and aborted reads share the time-out flavour; a clean
    /// close does not.
    pub fn is_timeout(&self) -> bool {
        matches!(self, WireError::Timeout | WireError::Aborted)
    }
}
