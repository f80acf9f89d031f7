//! Tree-walking fallback.

use crate::error::RouteError;
use crate::hierarchy::NodeContext;
use crate::resolver::{ResolveRequest, Resolver, RouteResponse};
use async_trait::async_trait;
use oroute_types::Address;

/// Steps one hop toward the target when nothing earlier found transports.
///
/// The hop is `next(self, target)`: the leader for static or unrelated
/// targets (with the leader's transports), otherwise the next level down,
/// carrying transports when that level is a known child or parent.
#[derive(Debug, Default, Clone, Copy)]
pub struct NextHopResolver;

#[async_trait]
impl Resolver for NextHopResolver {
    fn name(&self) -> &'static str {
        "next_hop"
    }

    async fn resolve(
        &self,
        node: &NodeContext,
        request: ResolveRequest,
    ) -> Result<RouteResponse, RouteError> {
        if request.address.has_transports() {
            return Ok(RouteResponse::unchanged(request));
        }

        let next = Address::next(&node.address, &request.target_address);
        let transports = if next.is_leader() {
            node.leader_transports()
        } else {
            node.hierarchy
                .find_child(&next)
                .or_else(|| node.hierarchy.find_parent(&next))
                .map(|known| known.transports().to_vec())
                .unwrap_or_default()
        };

        Ok(RouteResponse {
            next_hop_address: next.with_transports(transports),
            target_address: request.target_address,
            request_override: request.request,
        })
    }
}
