//! The router: internal/external classification, chain resolution and the
//! final transport lookup for the chosen next hop.

use crate::error::RouteError;
use crate::hierarchy::NodeContext;
use crate::registry::RegistryClient;
use crate::resolver::{ResolverChain, RouteResponse};
use crate::resolvers::hierarchy::HierarchyResolver;
use crate::resolvers::next_hop::NextHopResolver;
use crate::resolvers::registry_search::RegistrySearchResolver;
use oroute_types::validation::validate_address;
use oroute_types::{Address, OrouteError, Request, Transport};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Routes requests from one node.
#[derive(Debug, Clone)]
pub struct Router {
    node: NodeContext,
    chain: ResolverChain,
}

impl Router {
    pub fn new(node: NodeContext, chain: ResolverChain) -> Self {
        Self { node, chain }
    }

    /// Hierarchy first so local knowledge beats a registry round trip,
    /// then the registry (when one is reachable), then the tree walk.
    pub fn with_default_chain(node: NodeContext, registry: Option<Arc<dyn RegistryClient>>) -> Self {
        let mut chain = ResolverChain::new();
        chain.add_resolver(Arc::new(HierarchyResolver), false);
        if let Some(registry) = registry {
            chain.add_resolver(Arc::new(RegistrySearchResolver::new(registry)), false);
        }
        chain.add_resolver(Arc::new(NextHopResolver), false);
        Self::new(node, chain)
    }

    pub fn node(&self) -> &NodeContext {
        &self.node
    }

    pub fn chain(&self) -> &ResolverChain {
        &self.chain
    }

    /// An address is internal when it has no physical transports, or when
    /// one of them is also a transport of our leader (our own when we lead).
    pub fn is_internal(&self, address: &Address) -> bool {
        let physical: Vec<&Transport> = address.physical_transports().collect();
        if physical.is_empty() {
            return true;
        }
        let known = if self.node.is_leader() {
            self.node.address.transports().to_vec()
        } else {
            self.node.leader_transports()
        };
        physical
            .iter()
            .any(|t| known.iter().any(|k| k.value == t.value))
    }

    /// Compute the next hop for `address`.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn translate(
        &self,
        address: &Address,
        request: Option<Request>,
    ) -> Result<RouteResponse, RouteError> {
        if !self.is_internal(address) {
            let transports = address.physical_transports().cloned().collect();
            debug!("External address; bouncing to the leader");
            return Ok(RouteResponse {
                next_hop_address: Address::leader().with_transports(transports),
                target_address: address.clone(),
                request_override: request,
            });
        }

        let mut resolved = self.chain.resolve(&self.node, address, request).await?;
        let transports = self.get_transports(&resolved.next_hop_address)?;
        resolved.next_hop_address.set_transports(transports);
        debug!(
            next_hop = %resolved.next_hop_address,
            target_address = %resolved.target_address,
            "Translated"
        );
        Ok(resolved)
    }

    /// Transports to dial `address` with. Falls back to the leader when the
    /// address carries none of its own.
    fn get_transports(&self, address: &Address) -> Result<Vec<Transport>, RouteError> {
        if address.has_transports() {
            return Ok(address.transports().to_vec());
        }
        let leader = self.node.leader_transports();
        if leader.is_empty() {
            return Err(RouteError::NoLeaderTransports {
                address: address.to_string(),
            });
        }
        let transports = if self.node.is_leader() {
            self.node.address.transports().to_vec()
        } else {
            leader
        };
        if transports.is_empty() {
            return Err(RouteError::unresolvable(
                address.value(),
                "no transports available",
            ));
        }
        Ok(transports)
    }

    /// Route a request by its `_targetAddress` param.
    pub async fn route(&self, request: &Request) -> Result<RouteResponse, RouteError> {
        let target = request.target_address().ok_or_else(|| {
            OrouteError::InvalidParams("missing _targetAddress".to_string())
        })?;
        validate_address(target)?;
        let address = Address::new(target)?;
        self.translate(&address, Some(request.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, RegistryEntry};
    use serde_json::json;

    fn addr(value: &str, transport: &str) -> Address {
        Address::new(value)
            .unwrap()
            .with_transports(vec![Transport::physical(transport)])
    }

    fn leader_router(registry: Option<Arc<dyn RegistryClient>>) -> Router {
        let node = NodeContext::new(addr("o://leader", "/memory/leader"));
        node.hierarchy
            .add_child(addr("o://leader/services", "/memory/services"));
        Router::with_default_chain(node, registry)
    }

    fn child_router() -> Router {
        let node = NodeContext::new(addr("o://leader/services", "/memory/services"))
            .with_leader(addr("o://leader", "/memory/leader"));
        Router::with_default_chain(node, None)
    }

    #[test]
    fn test_default_chain_order() {
        let with_registry = leader_router(Some(Arc::new(InMemoryRegistry::new())));
        assert_eq!(
            with_registry.chain().names(),
            vec!["hierarchy", "registry_search", "next_hop"]
        );
        assert_eq!(leader_router(None).chain().names(), vec!["hierarchy", "next_hop"]);
    }

    #[test]
    fn test_is_internal() {
        let router = child_router();
        assert!(router.is_internal(&Address::new("o://leader/x").unwrap()));
        assert!(router.is_internal(&addr("o://leader", "/memory/leader")));
        assert!(!router.is_internal(&addr("o://elsewhere", "/memory/foreign")));

        // Non-physical transports do not make an address external.
        let bridged = Address::new("o://leader/x")
            .unwrap()
            .with_transports(vec![Transport::custom("bridge:abc")]);
        assert!(router.is_internal(&bridged));
    }

    #[tokio::test]
    async fn test_external_bounces_to_leader() {
        let router = child_router();
        let foreign = addr("o://leader/remote", "/memory/foreign");
        let out = router.translate(&foreign, None).await.unwrap();
        assert!(out.next_hop_address.is_leader());
        assert_eq!(out.next_hop_address.transports()[0].value, "/memory/foreign");
        assert_eq!(out.target_address, foreign);
    }

    #[tokio::test]
    async fn test_known_child_is_dialed_directly() {
        let router = leader_router(None);
        let target = Address::new("o://leader/services/embeddings-text").unwrap();
        let out = router.translate(&target, None).await.unwrap();
        assert_eq!(out.next_hop_address.value(), "o://leader/services");
        assert_eq!(out.next_hop_address.transports()[0].value, "/memory/services");
        assert_eq!(out.target_address.value(), target.value());
    }

    #[tokio::test]
    async fn test_unknown_target_goes_through_leader() {
        let router = child_router();
        let target = Address::new("o://leader/tools/search").unwrap();
        let out = router.translate(&target, None).await.unwrap();
        assert!(out.next_hop_address.is_leader());
        assert_eq!(out.next_hop_address.transports()[0].value, "/memory/leader");
    }

    #[tokio::test]
    async fn test_static_address_via_registry() {
        let registry = InMemoryRegistry::new();
        registry.commit_entry(
            RegistryEntry::new("p1", "o://leader/services/embeddings-text")
                .with_static_address("o://embeddings-text")
                .with_transports(vec![Transport::physical("/memory/embeddings")]),
        );
        let router = leader_router(Some(Arc::new(registry)));
        let request = Request::new("embed", json!({ "_targetAddress": "o://embeddings-text" }));

        let out = router.route(&request).await.unwrap();
        assert_eq!(out.target_address.value(), "o://leader/services/embeddings-text");
        assert_eq!(out.next_hop_address.value(), "o://leader/services");
        assert_eq!(
            out.request_override.unwrap().target_address(),
            Some("o://leader/services/embeddings-text")
        );
    }

    #[tokio::test]
    async fn test_no_leader_transports_is_an_error() {
        let node = NodeContext::new(addr("o://leader/orphan", "/memory/orphan"));
        let router = Router::with_default_chain(node, None);
        let target = Address::new("o://leader/elsewhere").unwrap();
        assert!(matches!(
            router.translate(&target, None).await,
            Err(RouteError::NoLeaderTransports { .. })
        ));
    }

    #[tokio::test]
    async fn test_route_rejects_bad_targets() {
        let router = leader_router(None);
        let missing = Request::new("ping", json!({}));
        assert!(matches!(
            router.route(&missing).await,
            Err(RouteError::InvalidAddress(OrouteError::InvalidParams(_)))
        ));

        let traversal = Request::new("ping", json!({ "_targetAddress": "o://tool/../../etc/passwd" }));
        assert!(matches!(
            router.route(&traversal).await,
            Err(RouteError::InvalidAddress(OrouteError::InvalidAddress { .. }))
        ));
    }
}
