//! The oroute node.
//!
//! Ties the layers together: a [`Node`] validates caller input, asks its
//! [`Router`](oroute_router::Router) for the next hop, and transmits over a
//! cached connection. Inbound requests that are not addressed to the node
//! are routed onward, so a request travels one hop at a time until it
//! reaches its target.

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod registry_service;
pub mod remote_registry;

pub use error::{NodeError, NodeResult};
pub use node::{LocalHandler, Node, NodeBuilder};
pub use registry_service::RegistryService;
pub use remote_registry::RemoteRegistry;
