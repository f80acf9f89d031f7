//! Routing errors.

use oroute_types::OrouteError;
use thiserror::Error;

/// Errors raised while resolving a route. None of these are retried here.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Cannot resolve {address}: {reason}")]
    Unresolvable { address: String, reason: String },
    #[error("No leader transports known while resolving {address}")]
    NoLeaderTransports { address: String },
    #[error("Registry error: {0}")]
    Registry(String),
    #[error(transparent)]
    InvalidAddress(#[from] OrouteError),
}

impl RouteError {
    pub fn unresolvable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unresolvable {
            address: address.into(),
            reason: reason.into(),
        }
    }
}
