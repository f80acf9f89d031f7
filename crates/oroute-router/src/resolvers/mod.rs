//! Concrete resolvers.

pub mod hierarchy;
pub mod next_hop;
pub mod registry_search;
pub mod selector;
