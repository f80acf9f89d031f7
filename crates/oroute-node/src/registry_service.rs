//! Serves an [`InMemoryRegistry`] over RPC.
//!
//! Methods: `search`, `commit`, `remove`, `find_all`. Params use the same
//! camelCase shapes as [`SearchParams`] and [`RegistryEntry`].

use crate::node::LocalHandler;
use async_trait::async_trait;
use oroute_router::{InMemoryRegistry, RegistryEntry, SearchParams};
use oroute_types::validation::validate_address;
use oroute_types::{OrouteError, OrouteResult, Request, Response};
use oroute_wire::ChunkWriter;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct RegistryService {
    registry: InMemoryRegistry,
}

impl RegistryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: InMemoryRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &InMemoryRegistry {
        &self.registry
    }

    fn dispatch(&self, request: &Request) -> Option<OrouteResult<Value>> {
        let result = match request.method.as_str() {
            "search" => params::<SearchParams>(request)
                .and_then(|p| to_value(self.registry.search_entries(&p))),
            "commit" => params::<RegistryEntry>(request).and_then(|entry| {
                validate_address(&entry.address)?;
                if let Some(s) = &entry.static_address {
                    validate_address(s)?;
                }
                let peer_id = entry.peer_id.clone();
                self.registry.commit_entry(entry);
                Ok(json!({ "committed": peer_id }))
            }),
            "remove" => param_str(request, "peerId")
                .map(|peer_id| json!({ "removed": self.registry.remove_entry(&peer_id) })),
            "find_all" => to_value(self.registry.all_entries()),
            _ => return None,
        };
        Some(result)
    }
}

fn params<T: DeserializeOwned>(request: &Request) -> OrouteResult<T> {
    serde_json::from_value(request.params_value())
        .map_err(|e| OrouteError::InvalidParams(format!("{}: {e}", request.method)))
}

fn param_str(request: &Request, key: &str) -> OrouteResult<String> {
    request
        .param_str(key)
        .map(str::to_string)
        .ok_or_else(|| OrouteError::InvalidParams(format!("missing '{key}'")))
}

fn to_value(entries: Vec<RegistryEntry>) -> OrouteResult<Value> {
    serde_json::to_value(entries).map_err(|e| OrouteError::Serialization(e.to_string()))
}

#[async_trait]
impl LocalHandler for RegistryService {
    async fn handle(&self, request: &Request, chunks: &ChunkWriter) -> Option<Response> {
        let result = self.dispatch(request)?;
        debug!(method = %request.method, ok = result.is_ok(), "Registry call");
        Some(match result {
            Ok(data) => chunks.builder().success(data),
            Err(e) => chunks.builder().error(e),
        })
    }
}
