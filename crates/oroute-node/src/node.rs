//! The node: entry point for outbound calls and handler for inbound ones.

use crate::error::{NodeError, NodeResult};
use crate::remote_registry::RemoteRegistry;
use async_trait::async_trait;
use oroute_router::{HierarchyTable, NodeContext, RegistryClient, RegistryEntry, RouteError, RouteResponse, Router};
use oroute_types::config::{AddressConfig, NodeConfig};
use oroute_types::validation::{sanitize_map, sanitize_params, validate_address, validate_method};
use oroute_types::{Address, Request, Response};
use oroute_wire::{
    ChunkCallback, ChunkWriter, ConnectionConfig, ConnectionManager, Dialer, Listener, RequestHandler,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Application methods served by a node.
#[async_trait]
pub trait LocalHandler: Send + Sync + 'static {
    /// Handle `request`, or return `None` if the method is not served here.
    /// Streaming handlers send chunks through `chunks` before returning the
    /// final response.
    async fn handle(&self, request: &Request, chunks: &ChunkWriter) -> Option<Response>;
}

/// Assembles a [`Node`] from its configuration.
pub struct NodeBuilder {
    config: NodeConfig,
    local: Option<Arc<dyn LocalHandler>>,
    registry: Option<Arc<dyn RegistryClient>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            local: None,
            registry: None,
        }
    }

    pub fn local_handler(mut self, handler: Arc<dyn LocalHandler>) -> Self {
        self.local = Some(handler);
        self
    }

    /// Use `registry` for static-address lookups instead of the one named in
    /// the config.
    pub fn registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the node and start serving it on `network`, which both dials
    /// next hops and accepts inbound streams.
    pub fn boot<N>(self, network: Arc<N>) -> NodeResult<Arc<Node>>
    where
        N: Dialer + Listener,
    {
        let NodeBuilder {
            config,
            local,
            registry,
        } = self;

        let address = config.self_address()?;
        validate_address(address.value())?;

        let mut context = NodeContext::new(address.clone());
        if let Some(leader) = &config.leader {
            context = context.with_leader(checked(leader)?);
        }
        for parent in &config.parents {
            context.hierarchy.add_parent(checked(parent)?);
        }
        for child in &config.children {
            context.hierarchy.add_child(checked(child)?);
        }

        let dialer: Arc<dyn Dialer> = network.clone();
        let listener: Arc<dyn Listener> = network;
        let connections = Arc::new(ConnectionManager::new(dialer, config.stream.clone()));
        let registry = match (registry, &config.registry) {
            (Some(registry), _) => Some(registry),
            (None, Some(remote)) => Some(Arc::new(RemoteRegistry::new(
                checked(remote)?,
                connections.clone(),
            )) as Arc<dyn RegistryClient>),
            (None, None) => None,
        };

        let node = Arc::new(Node {
            id: uuid::Uuid::new_v4().to_string(),
            address: address.clone(),
            router: Router::with_default_chain(context, registry.clone()),
            connections,
            listener: listener.clone(),
            local,
            registry,
            started: Instant::now(),
        });
        listener.listen(&address, node.clone(), config.stream.clone())?;
        info!(
            address = %address,
            peer_id = %node.id,
            resolvers = ?node.router.chain().names(),
            "Node started"
        );
        Ok(node)
    }
}

fn checked(config: &AddressConfig) -> NodeResult<Address> {
    validate_address(&config.address)?;
    Ok(config.to_address()?)
}

/// One overlay node.
pub struct Node {
    id: String,
    address: Address,
    router: Router,
    connections: Arc<ConnectionManager>,
    listener: Arc<dyn Listener>,
    local: Option<Arc<dyn LocalHandler>>,
    registry: Option<Arc<dyn RegistryClient>>,
    started: Instant,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// Random per-process peer id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn hierarchy(&self) -> &HierarchyTable {
        &self.router.node().hierarchy
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Call `method` on the node or service at `address`.
    ///
    /// The response may carry `success = false`; transport and routing
    /// failures come back as errors.
    pub async fn use_address(
        &self,
        address: &str,
        method: &str,
        params: Value,
    ) -> NodeResult<Response> {
        let request = self.build_request(address, method, params)?;
        self.send(request, None).await
    }

    /// Like [`use_address`](Self::use_address) for a streamed call;
    /// intermediate chunks go to `on_chunk`.
    pub async fn use_streaming(
        &self,
        address: &str,
        method: &str,
        params: Value,
        on_chunk: &ChunkCallback,
    ) -> NodeResult<Response> {
        let request = self.build_request(address, method, params)?.streaming();
        self.send(request, Some(on_chunk)).await
    }

    fn build_request(&self, address: &str, method: &str, params: Value) -> NodeResult<Request> {
        validate_address(address)?;
        validate_method(method)?;
        if self.is_self(address) {
            return Err(NodeError::Rejected(format!(
                "{address} is this node; call it locally"
            )));
        }
        let mut request = Request::new(method, sanitize_params(params));
        request.set_target_address(address);
        Ok(request)
    }

    #[instrument(skip_all, fields(method = %request.method, target_address = request.target_address().unwrap_or_default()))]
    async fn send(&self, request: Request, on_chunk: Option<&ChunkCallback>) -> NodeResult<Response> {
        let route = self.router.route(&request).await?;
        self.refuse_self_hop(&route)?;
        let request = route.request_override.unwrap_or(request);

        let connection = self
            .connections
            .connect(ConnectionConfig {
                address: route.target_address,
                next_hop_address: route.next_hop_address,
                caller_address: Some(self.address.clone()),
            })
            .await?;
        let response = match on_chunk {
            Some(cb) => connection.transmit_streaming(&request, cb).await?,
            None => connection.transmit(&request).await?,
        };
        Ok(response)
    }

    /// A next hop reachable at one of our own transports would loop back here.
    fn refuse_self_hop(&self, route: &RouteResponse) -> Result<(), RouteError> {
        let own = self.address.transports();
        if route
            .next_hop_address
            .physical_transports()
            .any(|t| own.contains(t))
        {
            warn!(
                target_address = %route.target_address,
                next_hop = %route.next_hop_address,
                "Next hop resolves back to this node"
            );
            return Err(RouteError::unresolvable(
                route.target_address.value(),
                "next hop resolves back to this node",
            ));
        }
        Ok(())
    }

    /// Whether `target` names this node, by full or static address.
    fn is_self(&self, target: &str) -> bool {
        match Address::new(target) {
            Ok(t) => {
                t.same_value(&self.address)
                    || (t.is_static() && t.same_value(&self.address.to_static_address()))
            }
            Err(_) => false,
        }
    }

    /// Whether an inbound request for `target` ends here: it names this
    /// node, or lies below it with no known child to carry it further.
    /// The leader never absorbs unknown descendants.
    fn is_destination(&self, target: &str) -> bool {
        if self.is_self(target) {
            return true;
        }
        if self.router.node().is_leader() {
            return false;
        }
        let Ok(target) = Address::new(target) else {
            return false;
        };
        let next = Address::next(&self.address, &target);
        !next.is_leader()
            && !next.same_value(&self.address)
            && self.hierarchy().find_child(&next).is_none()
    }

    /// Tell each configured parent (or the leader, when none is configured)
    /// that this node is its child.
    pub async fn announce(&self) -> NodeResult<usize> {
        let mut parents = self.hierarchy().parents();
        if parents.is_empty() && !self.router.node().is_leader() {
            parents.extend(self.router.node().leader.clone());
        }

        let mut announced = 0;
        for parent in parents {
            let mut request = Request::new(
                "child_register",
                json!({
                    "address": self.address.value(),
                    "transports": self.address.transports(),
                }),
            );
            request.set_target_address(parent.value());
            let connection = self
                .connections
                .connect(ConnectionConfig {
                    address: parent.clone(),
                    next_hop_address: parent.clone(),
                    caller_address: Some(self.address.clone()),
                })
                .await?;
            match connection.transmit(&request).await?.into_result() {
                Ok(_) => announced += 1,
                Err(e) => warn!(parent = %parent, error = %e, "Parent refused registration"),
            }
        }
        Ok(announced)
    }

    /// Commit this node to the registry under its static name.
    pub async fn register(&self, protocols: Vec<String>) -> NodeResult<()> {
        let Some(registry) = &self.registry else {
            return Err(NodeError::Rejected("no registry configured".to_string()));
        };
        let entry = RegistryEntry::new(self.id.clone(), self.address.value())
            .with_static_address(self.address.to_static_address().value())
            .with_protocols(protocols)
            .with_transports(self.address.transports().to_vec());
        registry.commit(entry).await?;
        info!(address = %self.address, "Registered");
        Ok(())
    }

    /// Stop serving and drop every connection.
    pub async fn stop(&self) {
        self.listener.unlisten(&self.address);
        self.connections.close_all().await;
        self.hierarchy().clear();
        info!(address = %self.address, "Node stopped");
    }

    async fn handle_local(&self, mut request: Request, chunks: &ChunkWriter) -> Response {
        let builder = chunks.builder();
        request.params = sanitize_map(std::mem::take(&mut request.params));
        match request.method.as_str() {
            "ping" => builder.success(json!({
                "address": self.address.value(),
                "peerId": self.id,
                "uptimeSecs": self.uptime_secs(),
            })),
            "child_register" => match self.register_child(&request) {
                Ok(child) => builder.success(json!({ "registered": child.value() })),
                Err(e) => builder.error(e),
            },
            _ => {
                let handled = match &self.local {
                    Some(local) => local.handle(&request, chunks).await,
                    None => None,
                };
                handled.unwrap_or_else(|| {
                    debug!(method = %request.method, "Unknown method");
                    builder.error(format!("Unknown method '{}'", request.method))
                })
            }
        }
    }

    fn register_child(&self, request: &Request) -> NodeResult<Address> {
        let config: AddressConfig = serde_json::from_value(request.params_value())
            .map_err(|e| oroute_types::OrouteError::InvalidParams(e.to_string()))?;
        let child = checked(&config)?;
        info!(child = %child, transports = child.transports().len(), "Child registered");
        self.hierarchy().add_child(child.clone());
        Ok(child)
    }

    /// Route `request` one hop further and relay what comes back.
    async fn forward(&self, request: Request, chunks: &ChunkWriter) -> Response {
        let builder = chunks.builder();
        let route = match self.router.route(&request).await {
            Ok(route) => route,
            Err(e) => {
                warn!(method = %request.method, error = %e, "Cannot route forwarded request");
                return builder.error(e);
            }
        };
        if let Err(e) = self.refuse_self_hop(&route) {
            return builder.error(e);
        }
        debug!(
            method = %request.method,
            next_hop = %route.next_hop_address,
            target_address = %route.target_address,
            "Forwarding"
        );
        let request = route.request_override.clone().unwrap_or(request);
        let connection = match self
            .connections
            .connect(ConnectionConfig {
                address: route.target_address,
                next_hop_address: route.next_hop_address,
                caller_address: Some(self.address.clone()),
            })
            .await
        {
            Ok(connection) => connection,
            Err(e) => return builder.error(e),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let on_chunk = move |chunk: Response| {
            let _ = tx.send(chunk);
        };
        let transmit = connection.transmit_streaming(&request, &on_chunk);
        tokio::pin!(transmit);

        let result = loop {
            tokio::select! {
                biased;
                Some(chunk) = rx.recv() => relay(chunks, chunk).await,
                result = &mut transmit => break result,
            }
        };
        while let Ok(chunk) = rx.try_recv() {
            relay(chunks, chunk).await;
        }

        match result {
            Ok(mut response) => {
                response.id = builder.id().clone();
                response
            }
            Err(e) => builder.error(e),
        }
    }
}

async fn relay(chunks: &ChunkWriter, chunk: Response) {
    if let Err(e) = chunks.relay(chunk).await {
        debug!(error = %e, "Dropping relayed chunk");
    }
}

#[async_trait]
impl RequestHandler for Node {
    async fn handle_request(&self, request: Request, chunks: &ChunkWriter) -> Response {
        if let Err(e) = validate_method(&request.method) {
            return chunks.builder().error(e);
        }
        let onward = request
            .target_address()
            .is_some_and(|target| !self.is_destination(target));
        if onward {
            self.forward(request, chunks).await
        } else {
            self.handle_local(request, chunks).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oroute_types::Transport;
    use oroute_wire::memory::MemoryNetwork;

    fn config(address: &str, transport: &str) -> NodeConfig {
        NodeConfig {
            address: address.to_string(),
            transports: vec![Transport::physical(transport)],
            ..Default::default()
        }
    }

    fn leader_cfg() -> AddressConfig {
        AddressConfig {
            address: "o://leader".to_string(),
            transports: vec![Transport::physical("/memory/leader")],
        }
    }

    #[tokio::test]
    async fn test_boot_loads_hierarchy_from_config() {
        let net = MemoryNetwork::new();
        let mut cfg = config("o://leader/services", "/memory/services");
        cfg.leader = Some(leader_cfg());
        cfg.children = vec![AddressConfig {
            address: "o://leader/services/a".to_string(),
            transports: vec![Transport::physical("/memory/a")],
        }];
        let node = Node::builder(cfg).boot(net).unwrap();
        assert_eq!(node.hierarchy().children().len(), 1);
        assert_eq!(node.hierarchy().leaders().len(), 1);
        assert_eq!(node.router().chain().names(), vec!["hierarchy", "next_hop"]);
    }

    #[tokio::test]
    async fn test_boot_rejects_bad_addresses() {
        let net = MemoryNetwork::new();
        let mut cfg = config("o://leader/a", "/memory/a");
        cfg.children = vec![AddressConfig {
            address: "o://leader/../etc".to_string(),
            transports: vec![],
        }];
        assert!(matches!(
            Node::builder(cfg).boot(net.clone()),
            Err(NodeError::Oroute(_))
        ));
        assert!(Node::builder(config("leader", "/memory/x")).boot(net).is_err());
    }

    #[tokio::test]
    async fn test_use_validates_before_routing() {
        let net = MemoryNetwork::new();
        let node = Node::builder(config("o://leader", "/memory/leader"))
            .boot(net.clone())
            .unwrap();

        let bad_address = node.use_address("o://tool\u{0}/x", "ping", json!({})).await;
        assert!(matches!(bad_address, Err(NodeError::Oroute(_))));
        let bad_method = node.use_address("o://leader/a", "__proto__", json!({})).await;
        assert!(matches!(bad_method, Err(NodeError::Oroute(_))));
        let to_self = node.use_address("o://leader", "ping", json!({})).await;
        assert!(matches!(to_self, Err(NodeError::Rejected(_))));
        assert_eq!(net.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_child_does_not_loop() {
        let net = MemoryNetwork::new();
        let leader = Node::builder(config("o://leader", "/memory/leader"))
            .boot(net.clone())
            .unwrap();
        let result = leader.use_address("o://leader/ghost", "ping", json!({})).await;
        assert!(matches!(
            result,
            Err(NodeError::Route(RouteError::Unresolvable { .. }))
        ));
        assert_eq!(net.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_is_self_matches_static_form() {
        let net = MemoryNetwork::new();
        let node = Node::builder(config("o://leader/services/embed", "/memory/e"))
            .boot(net)
            .unwrap();
        assert!(node.is_self("o://leader/services/embed"));
        assert!(node.is_self("o://embed"));
        assert!(!node.is_self("o://leader/services"));
        assert!(!node.is_self("not-an-address"));
    }

    #[tokio::test]
    async fn test_unknown_descendants_end_at_service_node() {
        let net = MemoryNetwork::new();
        let mut cfg = config("o://leader/services/embed", "/memory/e");
        cfg.leader = Some(leader_cfg());
        cfg.children = vec![AddressConfig {
            address: "o://leader/services/embed/shard".to_string(),
            transports: vec![Transport::physical("/memory/shard")],
        }];
        let node = Node::builder(cfg).boot(net.clone()).unwrap();
        assert!(node.is_destination("o://leader/services/embed/custom/path"));
        assert!(!node.is_destination("o://leader/services/embed/shard/x"));
        assert!(!node.is_destination("o://leader/services/other"));
        assert!(!node.is_destination("o://embeddings-text"));

        let leader = Node::builder(config("o://leader", "/memory/leader"))
            .boot(net)
            .unwrap();
        assert!(!leader.is_destination("o://leader/ghost"));
    }

    #[tokio::test]
    async fn test_register_without_registry() {
        let net = MemoryNetwork::new();
        let node = Node::builder(config("o://leader/a", "/memory/a"))
            .boot(net)
            .unwrap();
        assert!(matches!(
            node.register(vec![]).await,
            Err(NodeError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_unlistens() {
        let net = MemoryNetwork::new();
        let leader = Node::builder(config("o://leader", "/memory/leader"))
            .boot(net.clone())
            .unwrap();
        let mut cfg = config("o://leader/a", "/memory/a");
        cfg.leader = Some(leader_cfg());
        let child = Node::builder(cfg).boot(net.clone()).unwrap();

        assert!(child.use_address("o://leader/b", "ping", json!({})).await.is_ok());
        leader.stop().await;
        child.connections().close_all().await;
        assert!(matches!(
            child.use_address("o://leader", "ping", json!({})).await,
            Err(NodeError::Wire(_))
        ));
    }
}
