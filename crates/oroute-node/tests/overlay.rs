//! Multi-node tests over the in-memory transport.

use async_trait::async_trait;
use oroute_node::{LocalHandler, Node, NodeError, RegistryService};
use oroute_types::config::{AddressConfig, NodeConfig, ReusePolicy};
use oroute_types::{Address, Request, Response, Transport};
use oroute_wire::memory::MemoryNetwork;
use oroute_wire::ChunkWriter;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

const EMBEDDINGS: &str = "o://leader/services/embeddings-text";

/// `embed` answers directly; `embed_stream` sends two chunks first. `echo`
/// returns the params as received and `whereami` the recorded target.
struct Embedder;

#[async_trait]
impl LocalHandler for Embedder {
    async fn handle(&self, request: &Request, chunks: &ChunkWriter) -> Option<Response> {
        let text = request.param_str("text").unwrap_or_default().to_string();
        match request.method.as_str() {
            "embed" => Some(chunks.builder().success(json!({ "len": text.len() }))),
            "echo" => Some(chunks.builder().success(request.params_value())),
            "whereami" => Some(chunks.builder().success(json!({ "target": request.target_address() }))),
            "embed_stream" => {
                for part in ["a", "b"] {
                    chunks.send(json!({ "part": part })).await.ok()?;
                }
                Some(chunks.builder().success(json!({ "done": true })))
            }
            _ => None,
        }
    }
}

fn at(address: &str, transport: &str) -> AddressConfig {
    AddressConfig {
        address: address.to_string(),
        transports: vec![Transport::physical(transport)],
    }
}

fn config(address: &str, transport: &str) -> NodeConfig {
    NodeConfig {
        address: address.to_string(),
        transports: vec![Transport::physical(transport)],
        leader: (address != "o://leader").then(|| at("o://leader", "/memory/leader")),
        registry: Some(at("o://registry", "/memory/registry")),
        ..Default::default()
    }
}

struct Overlay {
    net: Arc<MemoryNetwork>,
    registry: Arc<RegistryService>,
    leader: Arc<Node>,
    services: Arc<Node>,
    embeddings: Arc<Node>,
}

impl Overlay {
    fn new() -> Self {
        Self::with_leader_config(config("o://leader", "/memory/leader"))
    }

    fn with_leader_config(leader_config: NodeConfig) -> Self {
        let net = MemoryNetwork::new();
        let registry = Arc::new(RegistryService::new());
        Node::builder(NodeConfig {
            address: "o://registry".to_string(),
            transports: vec![Transport::physical("/memory/registry")],
            ..Default::default()
        })
        .local_handler(registry.clone())
        .boot(net.clone())
        .unwrap();

        let leader = Node::builder(leader_config).boot(net.clone()).unwrap();
        let services = Node::builder(config("o://leader/services", "/memory/services"))
            .boot(net.clone())
            .unwrap();
        let mut embed_config = config(EMBEDDINGS, "/memory/embeddings");
        embed_config.parents = vec![at("o://leader/services", "/memory/services")];
        let embeddings = Node::builder(embed_config)
            .local_handler(Arc::new(Embedder))
            .boot(net.clone())
            .unwrap();

        Self {
            net,
            registry,
            leader,
            services,
            embeddings,
        }
    }

    async fn announce_all(&self) {
        assert_eq!(self.services.announce().await.unwrap(), 1);
        assert_eq!(self.embeddings.announce().await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_announce_builds_the_tree() {
    let overlay = Overlay::new();
    overlay.announce_all().await;

    let leader_children = overlay.leader.hierarchy().children();
    assert_eq!(leader_children.len(), 1);
    assert_eq!(leader_children[0].value(), "o://leader/services");
    assert_eq!(leader_children[0].transports()[0].value, "/memory/services");

    let services_children = overlay.services.hierarchy().children();
    assert_eq!(services_children[0].value(), EMBEDDINGS);
}

#[tokio::test]
async fn test_request_travels_hop_by_hop() {
    let overlay = Overlay::new();
    overlay.announce_all().await;

    let response = overlay
        .leader
        .use_address(EMBEDDINGS, "embed", json!({ "text": "hello" }))
        .await
        .unwrap();
    assert_eq!(response.into_result().unwrap(), json!({ "len": 5 }));

    // leader -> services -> embeddings: one dial from each forwarding hop.
    assert!(overlay
        .leader
        .connections()
        .is_cached(&Address::new("o://leader/services").unwrap()));
    assert!(overlay
        .services
        .connections()
        .is_cached(&Address::new(EMBEDDINGS).unwrap()));
}

#[tokio::test]
async fn test_upward_request_bounces_through_leader() {
    let overlay = Overlay::new();
    overlay.announce_all().await;

    let response = overlay
        .embeddings
        .use_address("o://leader/services", "ping", json!({}))
        .await
        .unwrap();
    let data = response.into_result().unwrap();
    assert_eq!(data["address"], "o://leader/services");
    assert_eq!(data["peerId"], overlay.services.id());
}

#[tokio::test]
async fn test_static_address_resolved_through_registry() {
    let overlay = Overlay::new();
    overlay.embeddings.register(vec!["/o/embed".into()]).await.unwrap();
    assert_eq!(overlay.registry.registry().len(), 1);

    // The services node has no route to its static name other than the
    // registry, which answers with the full hierarchical address.
    let response = overlay
        .services
        .use_address("o://embeddings-text", "embed", json!({ "text": "abc" }))
        .await
        .unwrap();
    assert_eq!(response.into_result().unwrap(), json!({ "len": 3 }));
    assert!(overlay
        .services
        .connections()
        .is_cached(&Address::new(EMBEDDINGS).unwrap()));
}

#[tokio::test]
async fn test_static_address_with_extra_segments_reaches_service() {
    let overlay = Overlay::new();
    overlay.embeddings.register(vec!["/o/embed".into()]).await.unwrap();

    let response = overlay
        .services
        .use_address("o://embeddings-text/custom/path", "whereami", json!({}))
        .await
        .unwrap();
    assert_eq!(
        response.into_result().unwrap(),
        json!({ "target": "o://leader/services/embeddings-text/custom/path" })
    );
}

#[tokio::test]
async fn test_streamed_chunks_are_relayed() {
    let overlay = Overlay::new();
    overlay.announce_all().await;

    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = seen.clone();
    let on_chunk = move |chunk: Response| {
        sink.lock().unwrap().push(chunk.result.data.unwrap_or_default());
    };
    let response = overlay
        .leader
        .use_streaming(EMBEDDINGS, "embed_stream", json!({}), &on_chunk)
        .await
        .unwrap();

    assert!(response.result.last);
    assert_eq!(response.into_result().unwrap(), json!({ "done": true }));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![json!({ "part": "a" }), json!({ "part": "b" })]
    );
}

#[tokio::test]
async fn test_unknown_method_is_a_failed_response() {
    let overlay = Overlay::new();
    overlay.announce_all().await;
    let response = overlay
        .leader
        .use_address(EMBEDDINGS, "translate", json!({}))
        .await
        .unwrap();
    assert!(!response.is_success());
    assert!(response.into_result().unwrap_err().contains("Unknown method"));
}

#[tokio::test]
async fn test_forbidden_params_never_reach_handlers() {
    let overlay = Overlay::new();
    overlay.announce_all().await;
    let response = overlay
        .leader
        .use_address(
            EMBEDDINGS,
            "echo",
            json!({ "text": "hey", "__proto__": { "polluted": true } }),
        )
        .await
        .unwrap();
    let seen = response.into_result().unwrap();
    assert_eq!(seen["text"], "hey");
    assert!(seen.get("__proto__").is_none());
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let overlay = Overlay::new();
    overlay.announce_all().await;

    let calls = (0..10).map(|i| {
        overlay
            .leader
            .use_address(EMBEDDINGS, "embed", json!({ "text": "x".repeat(i) }))
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().into_result().unwrap(), json!({ "len": i }));
    }
    assert_eq!(overlay.leader.connections().cached_count(), 1);
}

#[tokio::test]
async fn test_reuse_policy_keeps_one_stream() {
    let mut leader_config = config("o://leader", "/memory/leader");
    leader_config.stream.reuse_policy = ReusePolicy::Reuse;
    let overlay = Overlay::with_leader_config(leader_config);
    overlay.announce_all().await;

    for _ in 0..5 {
        let response = overlay
            .leader
            .use_address("o://leader/services", "ping", json!({}))
            .await
            .unwrap();
        assert!(response.is_success());
    }
    let connection = overlay
        .leader
        .connections()
        .get_cached_connection(&Address::new("o://leader/services").unwrap())
        .unwrap();
    assert_eq!(connection.streams().stream_count(), 1);
}

#[tokio::test]
async fn test_stopped_hop_surfaces_a_wire_error() {
    let overlay = Overlay::new();
    overlay.announce_all().await;
    overlay.services.stop().await;

    let result = overlay
        .leader
        .use_address("o://leader/services", "ping", json!({}))
        .await;
    assert!(matches!(result, Err(NodeError::Wire(_))));
    assert!(overlay.net.dial_count() >= 1);
}
