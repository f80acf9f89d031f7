//! Connection cache keyed by next-hop address.
//!
//! A cached connection is validated on every lookup. One that fails is
//! evicted and its in-flight work cancelled, so a broken link never serves
//! a second caller; the next `connect` dials afresh.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::WireError;
use crate::handler::RequestHandler;
use crate::stream_manager::StreamManager;
use crate::transport::Dialer;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use oroute_types::config::StreamConfig;
use oroute_types::Address;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    stream_config: StreamConfig,
    /// Serves requests the remote pushes back over our connections.
    handler: Option<Arc<dyn RequestHandler>>,
    cache: DashMap<String, Arc<Connection>>,
    /// Bumped by `close_all` to abandon dials still in flight.
    generation: watch::Sender<u64>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>, stream_config: StreamConfig) -> Self {
        Self {
            dialer,
            stream_config,
            handler: None,
            cache: DashMap::new(),
            generation: watch::channel(0).0,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn key(address: &Address) -> String {
        address.to_string()
    }

    /// Cached connection to `config.next_hop_address`, dialing on a miss.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<Arc<Connection>, WireError> {
        if let Some(existing) = self.get_cached_connection(&config.next_hop_address) {
            return Ok(existing);
        }

        let key = Self::key(&config.next_hop_address);
        let mut generation = self.generation.subscribe();
        let timeout = self.stream_config.connect_timeout();
        let physical = tokio::select! {
            dialed = tokio::time::timeout(timeout, self.dialer.dial(&config.next_hop_address)) => match dialed {
                Ok(result) => result?,
                Err(_) => {
                    warn!(next_hop = %key, timeout_secs = timeout.as_secs(), "Dial timed out");
                    return Err(WireError::Dial {
                        address: key,
                        reason: format!("timed out after {}s", timeout.as_secs()),
                    });
                }
            },
            _ = generation.changed() => {
                debug!(next_hop = %key, "Dial abandoned by close_all");
                return Err(WireError::Aborted);
            }
        };
        let streams = StreamManager::new(
            physical.clone(),
            self.stream_config.clone(),
            self.handler.clone(),
        );
        let connection = Arc::new(Connection::new(config, physical, streams));

        // Another caller may have connected while we were dialing. The
        // check and the insert happen under the same shard lock.
        let raced = match self.cache.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().validate().is_ok() => Some(entry.get().clone()),
            Entry::Occupied(mut entry) => {
                entry.insert(connection.clone());
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(connection.clone());
                None
            }
        };
        if let Some(raced) = raced {
            debug!(next_hop = %key, "Connection raced; keeping the cached one");
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Ignoring close error on raced connection");
            }
            return Ok(raced);
        }

        info!(next_hop = %key, conn_id = %connection.id(), "Connected");
        Ok(connection)
    }

    /// Whether an entry exists for `address`. Does not validate.
    pub fn is_cached(&self, address: &Address) -> bool {
        self.cache.contains_key(&Self::key(address))
    }

    /// The cached connection for `address`, if present and still valid.
    pub fn get_cached_connection(&self, address: &Address) -> Option<Arc<Connection>> {
        let key = Self::key(address);
        let Some(connection) = self.cache.get(&key).map(|e| e.value().clone()) else {
            debug!(next_hop = %key, "No cached connection");
            self.cache.remove(&key);
            return None;
        };

        if let Err(e) = connection.validate() {
            warn!(next_hop = %key, error = %e, "Evicting invalid cached connection");
            self.cache
                .remove_if(&key, |_, cached| Arc::ptr_eq(cached, &connection));
            connection.streams().cancel();
            return None;
        }
        Some(connection)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Close and forget every cached connection. Dials still in flight
    /// fail with [`WireError::Aborted`].
    pub async fn close_all(&self) {
        self.generation.send_modify(|g| *g += 1);
        let connections: Vec<Arc<Connection>> =
            self.cache.iter().map(|e| e.value().clone()).collect();
        self.cache.clear();
        for connection in connections {
            if let Err(e) = connection.close().await {
                debug!(conn_id = %connection.id(), error = %e, "Ignoring close error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ChunkWriter;
    use crate::memory::MemoryNetwork;
    use crate::transport::Listener;
    use async_trait::async_trait;
    use oroute_types::{Request, Response, ResponseBuilder, Transport};
    use serde_json::json;

    struct Pong;

    #[async_trait]
    impl RequestHandler for Pong {
        async fn handle_request(&self, request: Request, _chunks: &ChunkWriter) -> Response {
            ResponseBuilder::new(&request).success(json!("pong"))
        }
    }

    fn services() -> Address {
        Address::new("o://leader/services")
            .unwrap()
            .with_transports(vec![Transport::physical("/memory/services")])
    }

    fn config(next_hop: Address) -> ConnectionConfig {
        ConnectionConfig {
            address: next_hop.clone(),
            next_hop_address: next_hop,
            caller_address: None,
        }
    }

    fn setup() -> (Arc<MemoryNetwork>, ConnectionManager) {
        let net = MemoryNetwork::new();
        net.listen(&services(), Arc::new(Pong), StreamConfig::default())
            .unwrap();
        let manager = ConnectionManager::new(net.clone(), StreamConfig::default());
        (net, manager)
    }

    #[tokio::test]
    async fn test_connect_caches_by_next_hop() {
        let (net, manager) = setup();
        let a = manager.connect(config(services())).await.unwrap();
        let b = manager.connect(config(services())).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(net.dial_count(), 1);
        assert!(manager.is_cached(&services()));

        let resp = a
            .transmit(&Request::new("ping", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.into_result().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_invalid_connection_is_evicted() {
        let (net, manager) = setup();
        let conn = manager.connect(config(services())).await.unwrap();
        conn.close().await.unwrap();

        assert!(manager.get_cached_connection(&services()).is_none());
        assert!(!manager.is_cached(&services()));

        // A fresh connect dials again and works.
        let fresh = manager.connect(config(services())).await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
        assert_eq!(net.dial_count(), 2);
        assert!(fresh.transmit(&Request::new("ping", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_absent_entry_returns_none() {
        let (_net, manager) = setup();
        assert!(manager.get_cached_connection(&services()).is_none());
        assert!(!manager.is_cached(&services()));
    }

    #[tokio::test]
    async fn test_dial_failure_is_not_cached() {
        let (_net, manager) = setup();
        let nowhere = Address::new("o://leader/nowhere").unwrap();
        assert!(matches!(
            manager.connect(config(nowhere.clone())).await,
            Err(WireError::Dial { .. })
        ));
        assert!(!manager.is_cached(&nowhere));
    }

    #[tokio::test]
    async fn test_close_all_empties_cache() {
        let (_net, manager) = setup();
        let conn = manager.connect(config(services())).await.unwrap();
        manager.close_all().await;
        assert_eq!(manager.cached_count(), 0);
        assert!(conn.validate().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_connection() {
        let (_net, manager) = setup();
        let manager = Arc::new(manager);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect(config(services())).await })
            })
            .collect();
        let conns: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert_eq!(manager.cached_count(), 1);
        let cached = manager.get_cached_connection(&services()).unwrap();
        // Losers of the race were closed; the survivor is what is cached.
        for conn in &conns {
            assert!(Arc::ptr_eq(conn, &cached) || conn.validate().is_err());
        }
    }

    #[tokio::test]
    async fn test_stalled_dial_times_out() {
        let net = MemoryNetwork::new();
        net.stall_dials(true);
        let manager = ConnectionManager::new(
            net.clone(),
            StreamConfig {
                connect_timeout_secs: 0,
                ..Default::default()
            },
        );
        match manager.connect(config(services())).await {
            Err(WireError::Dial { reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("Expected dial timeout, got {other:?}"),
        }
        assert!(!manager.is_cached(&services()));
    }

    #[tokio::test]
    async fn test_close_all_abandons_inflight_dial() {
        let net = MemoryNetwork::new();
        net.stall_dials(true);
        let manager = Arc::new(ConnectionManager::new(net.clone(), StreamConfig::default()));
        let dial = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(config(services())).await })
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while net.dial_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        manager.close_all().await;
        assert!(matches!(dial.await.unwrap(), Err(WireError::Aborted)));
    }
}
