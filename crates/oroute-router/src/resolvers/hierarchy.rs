//! Resolution through known children.

use crate::error::RouteError;
use crate::hierarchy::NodeContext;
use crate::resolver::{ResolveRequest, Resolver, RouteResponse};
use async_trait::async_trait;
use oroute_types::Address;
use tracing::debug;

/// If the next hop toward the target is a child this node knows, route to
/// that child with its stored transports. Otherwise leave the input alone
/// so later resolvers still see the original address.
///
/// A miss returns its input rather than the computed hop. Registry search
/// and next-hop resolution both skip addresses that already carry
/// transports, and next-hop computes the same hop itself, so rewriting here
/// would change nothing except hide the original address from the
/// registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct HierarchyResolver;

#[async_trait]
impl Resolver for HierarchyResolver {
    fn name(&self) -> &'static str {
        "hierarchy"
    }

    async fn resolve(
        &self,
        node: &NodeContext,
        request: ResolveRequest,
    ) -> Result<RouteResponse, RouteError> {
        let next = Address::next(&node.address, &request.target_address);
        match node.hierarchy.find_child(&next) {
            Some(child) => {
                debug!(child = %child, target_address = %request.target_address, "Routing via known child");
                Ok(RouteResponse {
                    next_hop_address: child,
                    target_address: request.target_address,
                    request_override: request.request,
                })
            }
            None => Ok(RouteResponse::unchanged(request)),
        }
    }
}
