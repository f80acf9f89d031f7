//! Address resolution and routing for the oroute overlay.
//!
//! Given a target [`Address`](oroute_types::Address), the [`Router`] decides
//! whether the target is internal to this node's network, runs the
//! [`ResolverChain`] to pick the immediate next hop, and attaches the
//! transports needed to dial it.
//!
//! ## Resolution order
//!
//! 1. [`HierarchyResolver`]: known children win, no network round trip
//! 2. [`RegistrySearchResolver`]: static names looked up in the registry
//! 3. [`NextHopResolver`]: walk the tree toward the target (or the leader)

pub mod error;
pub mod hierarchy;
pub mod registry;
pub mod resolver;
pub mod resolvers;
pub mod router;

pub use error::RouteError;
pub use hierarchy::{HierarchyTable, NodeContext};
pub use registry::{InMemoryRegistry, RegistryClient, RegistryEntry, SearchParams};
pub use resolver::{
    PassthroughResolver, ResolveRequest, Resolver, ResolverChain, RouteResponse,
};
pub use resolvers::hierarchy::HierarchyResolver;
pub use resolvers::next_hop::NextHopResolver;
pub use resolvers::registry_search::RegistrySearchResolver;
pub use resolvers::selector::{CandidateSelector, FirstCandidate, RoundRobin};
pub use router::Router;
