//! [`RegistryClient`] backed by a registry node reached over the overlay.

use async_trait::async_trait;
use oroute_router::{RegistryClient, RegistryEntry, RouteError, SearchParams};
use oroute_types::{Address, Request, REGISTRY_ADDRESS};
use oroute_wire::{ConnectionConfig, ConnectionManager};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Calls the registry service directly at its configured transports.
///
/// The registry is never resolved through the router: resolving it would
/// itself need the registry.
pub struct RemoteRegistry {
    registry: Address,
    connections: Arc<ConnectionManager>,
}

impl RemoteRegistry {
    pub fn new(registry: Address, connections: Arc<ConnectionManager>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RouteError> {
        let mut request = Request::new(method, params);
        request.set_target_address(REGISTRY_ADDRESS);

        let connection = self
            .connections
            .connect(ConnectionConfig {
                address: self.registry.clone(),
                next_hop_address: self.registry.clone(),
                caller_address: None,
            })
            .await
            .map_err(|e| RouteError::Registry(e.to_string()))?;
        let response = connection
            .transmit(&request)
            .await
            .map_err(|e| RouteError::Registry(e.to_string()))?;
        debug!(method, success = response.is_success(), "Registry RPC");
        response.into_result().map_err(RouteError::Registry)
    }
}

fn entries(value: Value) -> Result<Vec<RegistryEntry>, RouteError> {
    serde_json::from_value(value).map_err(|e| RouteError::Registry(e.to_string()))
}

#[async_trait]
impl RegistryClient for RemoteRegistry {
    async fn search(&self, params: SearchParams) -> Result<Vec<RegistryEntry>, RouteError> {
        let params = serde_json::to_value(params).map_err(|e| RouteError::Registry(e.to_string()))?;
        entries(self.call("search", params).await?)
    }

    async fn commit(&self, entry: RegistryEntry) -> Result<(), RouteError> {
        let params = serde_json::to_value(entry).map_err(|e| RouteError::Registry(e.to_string()))?;
        self.call("commit", params).await.map(|_| ())
    }

    async fn remove(&self, peer_id: &str) -> Result<bool, RouteError> {
        let data = self.call("remove", json!({ "peerId": peer_id })).await?;
        Ok(data["removed"].as_bool().unwrap_or(false))
    }

    async fn find_all(&self) -> Result<Vec<RegistryEntry>, RouteError> {
        entries(self.call("find_all", json!({})).await?)
    }
}
