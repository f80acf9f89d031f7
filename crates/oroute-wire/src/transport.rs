//! Physical transport capabilities.
//!
//! The wire layer never talks to sockets directly. A transport (libp2p,
//! TCP, the in-memory [`crate::memory`] network) implements these traits
//! and the stream/connection managers drive them.

use crate::error::WireError;
use crate::handler::RequestHandler;
use async_trait::async_trait;
use bytes::Bytes;
use oroute_types::config::StreamConfig;
use oroute_types::Address;
use std::sync::Arc;

/// Lifecycle of a physical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Open,
    Closing,
    Closed,
    Reset,
}

/// Local write half state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Writable,
    Closing,
    Closed,
}

/// Remote side's read state as last reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Readable,
    Closing,
    Closed,
}

/// Lifecycle of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    Closing,
    Closed,
}

/// Options passed when opening a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Forwarded unmodified; zero and negative values included.
    pub max_outbound_streams: Option<i64>,
    pub run_on_limited_connection: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_outbound_streams: None,
            run_on_limited_connection: true,
        }
    }
}

/// A bidirectional byte stream over a connection.
#[async_trait]
pub trait PhysicalStream: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// The protocol the stream was opened for.
    fn protocol(&self) -> &str;

    fn status(&self) -> StreamStatus;

    fn write_status(&self) -> WriteStatus;

    fn remote_read_status(&self) -> ReadStatus;

    /// Write raw bytes. Framing is the caller's concern.
    async fn write(&self, data: Bytes) -> Result<(), WireError>;

    /// Next chunk of bytes, or `None` at end of stream.
    async fn read(&self) -> Result<Option<Bytes>, WireError>;

    /// Graceful close.
    async fn close(&self) -> Result<(), WireError>;

    /// Immediate teardown.
    fn abort(&self);

    /// Resolves once the stream is no longer open. Transports without a
    /// close notification leave this pending and rely on status polling.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// A physical link to one remote peer.
#[async_trait]
pub trait PhysicalConnection: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn status(&self) -> ConnectionStatus;

    /// Relayed or otherwise resource-limited connection.
    fn is_limited(&self) -> bool {
        false
    }

    async fn new_stream(
        &self,
        protocol: &str,
        options: StreamOptions,
    ) -> Result<Arc<dyn PhysicalStream>, WireError>;

    async fn close(&self) -> Result<(), WireError>;
}

/// Opens physical connections to resolved addresses.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, address: &Address) -> Result<Arc<dyn PhysicalConnection>, WireError>;
}

/// Accepts inbound connections on behalf of a node.
pub trait Listener: Send + Sync + 'static {
    /// Serve `handler` at `address` and its physical transports. Streams
    /// accepted there are managed with `config`.
    fn listen(
        &self,
        address: &Address,
        handler: Arc<dyn RequestHandler>,
        config: StreamConfig,
    ) -> Result<(), WireError>;

    /// Stop accepting for `address`. Established connections are left to
    /// their owners.
    fn unlisten(&self, address: &Address);
}
