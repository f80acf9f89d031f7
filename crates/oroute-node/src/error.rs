//! Node-level errors.

use oroute_router::RouteError;
use oroute_types::OrouteError;
use oroute_wire::WireError;
use thiserror::Error;

/// Errors surfaced to callers of [`Node`](crate::Node).
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Oroute(#[from] OrouteError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Route(#[from] RouteError),
    /// The request was refused before any routing happened.
    #[error("Rejected: {0}")]
    Rejected(String),
}

pub type NodeResult<T> = Result<T, NodeError>;
