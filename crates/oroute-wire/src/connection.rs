//! A connection to one next hop.

use crate::error::WireError;
use crate::handler::ChunkCallback;
use crate::stream_manager::StreamManager;
use crate::transport::{ConnectionStatus, PhysicalConnection};
use oroute_types::config::StreamConfig;
use oroute_types::{Address, Request, Response};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Addresses a connection is opened for.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Final target of the traffic.
    pub address: Address,
    /// The hop the physical link actually goes to.
    pub next_hop_address: Address,
    /// The node opening the connection.
    pub caller_address: Option<Address>,
}

/// One physical link plus the stream manager that multiplexes requests
/// over it.
pub struct Connection {
    id: String,
    address: Address,
    next_hop_address: Address,
    caller_address: Option<Address>,
    physical: Arc<dyn PhysicalConnection>,
    streams: Arc<StreamManager>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("next_hop", &self.next_hop_address.value())
            .field("status", &self.physical.status())
            .finish()
    }
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        physical: Arc<dyn PhysicalConnection>,
        streams: Arc<StreamManager>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            address: config.address,
            next_hop_address: config.next_hop_address,
            caller_address: config.caller_address,
            physical,
            streams,
        }
    }

    /// Wrap `physical` with a stream manager built from `stream_config`.
    pub fn open(
        config: ConnectionConfig,
        physical: Arc<dyn PhysicalConnection>,
        stream_config: StreamConfig,
    ) -> Self {
        let streams = StreamManager::new(physical.clone(), stream_config, None);
        Self::new(config, physical, streams)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn next_hop_address(&self) -> &Address {
        &self.next_hop_address
    }

    pub fn caller_address(&self) -> Option<&Address> {
        self.caller_address.as_ref()
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Fails when the underlying link is no longer open.
    pub fn validate(&self) -> Result<(), WireError> {
        match self.physical.status() {
            ConnectionStatus::Open => Ok(()),
            status => Err(WireError::ConnectionInvalid(format!(
                "connection {} to {} is {:?}",
                self.id, self.next_hop_address, status
            ))),
        }
    }

    /// Send `request` and wait for its terminal response.
    pub async fn transmit(&self, request: &Request) -> Result<Response, WireError> {
        self.transmit_inner(request, None).await
    }

    /// Like [`transmit`](Self::transmit), passing intermediate chunks to
    /// `on_chunk`.
    pub async fn transmit_streaming(
        &self,
        request: &Request,
        on_chunk: &ChunkCallback,
    ) -> Result<Response, WireError> {
        self.transmit_inner(request, Some(on_chunk)).await
    }

    #[instrument(skip_all, fields(conn_id = %self.id, method = %request.method, next_hop = %self.next_hop_address))]
    async fn transmit_inner(
        &self,
        request: &Request,
        on_chunk: Option<&ChunkCallback>,
    ) -> Result<Response, WireError> {
        let protocol = self.next_hop_address.protocol();
        let stream = self
            .streams
            .get_or_create_stream(&protocol, Some(&self.next_hop_address))
            .await?;
        let result = self.streams.send_request(&stream, request, on_chunk).await;
        self.streams.post_transmit(&stream).await;
        debug!(ok = result.is_ok(), "Transmit finished");
        result
    }

    pub async fn close(&self) -> Result<(), WireError> {
        self.streams.close().await;
        self.physical.close().await
    }
}
