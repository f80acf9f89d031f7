//! Resolution of static and unknown addresses through the registry.

use crate::error::RouteError;
use crate::hierarchy::NodeContext;
use crate::registry::{RegistryClient, SearchParams};
use crate::resolver::{ResolveRequest, Resolver, RouteResponse};
use crate::resolvers::selector::{CandidateSelector, FirstCandidate};
use async_trait::async_trait;
use oroute_types::{Address, REGISTRY_ADDRESS};
use std::sync::Arc;
use tracing::debug;

/// Looks the address up in the registry when no transports are known yet.
///
/// The registry reports a full hierarchical address; the caller may have
/// named the service by a shorter form (`o://embeddings-text`) possibly with
/// extra segments after it. The resolved target is the registry's address
/// plus only the caller's segments that the registry address does not
/// already end with.
pub struct RegistrySearchResolver {
    registry: Arc<dyn RegistryClient>,
    selector: Arc<dyn CandidateSelector>,
}

impl RegistrySearchResolver {
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self {
            registry,
            selector: Arc::new(FirstCandidate),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn CandidateSelector>) -> Self {
        self.selector = selector;
        self
    }
}

/// Join the registry's full address with the unresolved tail of the
/// requested address, never repeating a segment the two share.
pub fn merge_resolved_path(resolved: &Address, requested: &Address) -> Address {
    if resolved.value().starts_with(requested.value()) {
        return resolved.clone();
    }
    let r: Vec<&str> = resolved.segments().collect();
    let q: Vec<&str> = requested.segments().collect();

    // Longest suffix of the registry path equal to a prefix of the request.
    let overlap = (1..=q.len().min(r.len()))
        .rev()
        .find(|&k| r[r.len() - k..] == q[..k])
        // The search matched on the request's root, so that much is resolved.
        .unwrap_or(1);

    q[overlap.min(q.len())..]
        .iter()
        .fold(resolved.clone(), |acc, seg| acc.child(seg))
}

#[async_trait]
impl Resolver for RegistrySearchResolver {
    fn name(&self) -> &'static str {
        "registry_search"
    }

    async fn resolve(
        &self,
        node: &NodeContext,
        request: ResolveRequest,
    ) -> Result<RouteResponse, RouteError> {
        if request.address.has_transports() {
            return Ok(RouteResponse::unchanged(request));
        }

        let params = SearchParams {
            static_address: Some(request.address.root()),
            address: Some(request.address.to_string()),
            protocols: None,
        };
        let results = self.registry.search(params).await?;
        let candidates: Vec<_> = results
            .into_iter()
            .filter(|e| e.static_address.as_deref() != Some(REGISTRY_ADDRESS))
            .collect();

        let Some(candidate) = self.selector.select(&candidates) else {
            debug!(address = %request.address, "No registry candidates");
            return Ok(RouteResponse::unchanged(request));
        };

        let transports = candidate.transports.clone();
        let found = Address::new(candidate.address.clone())?;
        let target = merge_resolved_path(&found, &request.address).with_transports(transports.clone());

        let next = Address::next(&node.address, &target);
        let next_hop = if next.is_leader() {
            next.with_transports(node.leader_transports())
        } else {
            next.with_transports(transports)
        };
        debug!(
            address = %request.address,
            peer_id = %candidate.peer_id,
            target_address = %target,
            next_hop = %next_hop,
            "Resolved through registry"
        );

        let request_override = request.request.map(|mut r| {
            r.set_target_address(target.value());
            r
        });
        Ok(RouteResponse {
            next_hop_address: next_hop,
            target_address: target,
            request_override,
        })
    }
}
