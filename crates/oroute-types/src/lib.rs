//! Core types for the oroute addressing and routing overlay.
//!
//! This crate defines the data structures shared by the wire layer, the
//! resolver/router and the node facade: hierarchical addresses, transport
//! descriptors, the request/response envelope, boundary validation and
//! node configuration. It contains no networking logic.

pub mod address;
pub mod config;
pub mod envelope;
pub mod error;
pub mod transport;
pub mod validation;

pub use address::{Address, LEADER_ADDRESS, REGISTRY_ADDRESS, SCHEME};
pub use envelope::{Request, RequestId, Response, ResponseBuilder, ResponseResult};
pub use error::{OrouteError, OrouteResult};
pub use transport::{Transport, TransportKind};
