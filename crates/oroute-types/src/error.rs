//! Shared error types for the overlay.

use thiserror::Error;

/// Top-level error type for values crossing the network boundary.
#[derive(Error, Debug)]
pub enum OrouteError {
    /// An address failed validation.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address (as received).
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A method name failed validation.
    #[error("Invalid method '{method}': {reason}")]
    InvalidMethod {
        /// The offending method name.
        method: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Request parameters were malformed.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrouteError {
    /// Shorthand for an [`OrouteError::InvalidAddress`].
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`OrouteError::InvalidMethod`].
    pub fn invalid_method(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMethod {
            method: method.into(),
            reason: reason.into(),
        }
    }
}

/// Alias for Result with OrouteError.
pub type OrouteResult<T> = Result<T, OrouteError>;
