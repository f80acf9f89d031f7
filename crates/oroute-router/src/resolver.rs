//! The resolver capability and the chain that composes resolvers.

use crate::error::RouteError;
use crate::hierarchy::NodeContext;
use async_trait::async_trait;
use oroute_types::{Address, Request};
use std::sync::Arc;
use tracing::debug;

/// Input to one resolver step.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// The address resolved so far (the previous step's next hop).
    pub address: Address,
    /// The final destination as currently understood.
    pub target_address: Address,
    /// The request being routed, possibly rewritten by an earlier step.
    pub request: Option<Request>,
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResponse {
    pub next_hop_address: Address,
    pub target_address: Address,
    pub request_override: Option<Request>,
}

impl RouteResponse {
    /// The identity outcome for `request`.
    pub fn unchanged(request: ResolveRequest) -> Self {
        Self {
            next_hop_address: request.address,
            target_address: request.target_address,
            request_override: request.request,
        }
    }
}

/// One resolution strategy.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn resolve(
        &self,
        node: &NodeContext,
        request: ResolveRequest,
    ) -> Result<RouteResponse, RouteError>;
}

/// Returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

#[async_trait]
impl Resolver for PassthroughResolver {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    async fn resolve(
        &self,
        _node: &NodeContext,
        request: ResolveRequest,
    ) -> Result<RouteResponse, RouteError> {
        Ok(RouteResponse::unchanged(request))
    }
}

/// Ordered resolvers. Each step sees the previous step's next hop as its
/// `address`; the latest target and request override are carried forward.
#[derive(Clone, Default)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl std::fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.resolvers.iter().map(|r| r.name()))
            .finish()
    }
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `resolver`, or put it first when `is_priority`.
    pub fn add_resolver(&mut self, resolver: Arc<dyn Resolver>, is_priority: bool) {
        if is_priority {
            self.resolvers.insert(0, resolver);
        } else {
            self.resolvers.push(resolver);
        }
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    pub async fn resolve(
        &self,
        node: &NodeContext,
        address: &Address,
        request: Option<Request>,
    ) -> Result<RouteResponse, RouteError> {
        let mut current = RouteResponse {
            next_hop_address: address.clone(),
            target_address: address.clone(),
            request_override: request,
        };

        for resolver in &self.resolvers {
            let step = resolver
                .resolve(
                    node,
                    ResolveRequest {
                        address: current.next_hop_address.clone(),
                        target_address: current.target_address.clone(),
                        request: current.request_override.clone(),
                    },
                )
                .await?;
            debug!(
                resolver = resolver.name(),
                next_hop = %step.next_hop_address,
                target_address = %step.target_address,
                "Resolver step"
            );
            current.next_hop_address = step.next_hop_address;
            current.target_address = step.target_address;
            if step.request_override.is_some() {
                current.request_override = step.request_override;
            }
        }
        Ok(current)
    }
}
