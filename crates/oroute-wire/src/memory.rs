//! In-process transport.
//!
//! [`MemoryNetwork`] routes dials to handlers registered in the same
//! process, which is enough to run a whole overlay in one test. The stream
//! and connection types expose knobs (reset, half-close, injected creation
//! failures) for driving the managers through their failure paths.

use crate::error::WireError;
use crate::handler::RequestHandler;
use crate::stream_manager::StreamManager;
use crate::transport::{
    ConnectionStatus, Dialer, Listener, PhysicalConnection, PhysicalStream, ReadStatus,
    StreamOptions, StreamStatus, WriteStatus,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use oroute_types::config::StreamConfig;
use oroute_types::Address;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct StreamState {
    status: StreamStatus,
    write: WriteStatus,
    remote_read: ReadStatus,
}

/// One end of an in-memory stream pair.
pub struct MemoryStream {
    id: String,
    protocol: String,
    state: Mutex<StreamState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    peer: Mutex<Weak<MemoryStream>>,
    closed_tx: watch::Sender<bool>,
    close_count: AtomicUsize,
    aborted: AtomicBool,
}

impl MemoryStream {
    fn new(
        protocol: &str,
        outgoing: mpsc::UnboundedSender<Bytes>,
        incoming: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol: protocol.to_string(),
            state: Mutex::new(StreamState {
                status: StreamStatus::Open,
                write: WriteStatus::Writable,
                remote_read: ReadStatus::Readable,
            }),
            outgoing: Mutex::new(Some(outgoing)),
            incoming: tokio::sync::Mutex::new(incoming),
            peer: Mutex::new(Weak::new()),
            closed_tx,
            close_count: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    /// Two connected ends: bytes written on one are read on the other.
    pub fn pair(protocol: &str) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self::new(protocol, a_tx, a_rx));
        let b = Arc::new(Self::new(protocol, b_tx, b_rx));
        *a.peer.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&b);
        *b.peer.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&a);
        (a, b)
    }

    fn update(&self, f: impl FnOnce(&mut StreamState)) {
        f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn state(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drop_outgoing(&self) {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn notify_peer_stopped_reading(&self) {
        let peer = self.peer.lock().unwrap_or_else(|e| e.into_inner()).upgrade();
        if let Some(peer) = peer {
            peer.update(|s| s.remote_read = ReadStatus::Closed);
        }
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Simulate a transport reset.
    pub fn reset(&self) {
        self.update(|s| {
            s.status = StreamStatus::Reset;
            s.write = WriteStatus::Closed;
        });
        self.drop_outgoing();
        self.notify_peer_stopped_reading();
        self.closed_tx.send_replace(true);
    }

    /// Close the local write half; the stream stays open.
    pub fn close_write(&self) {
        self.update(|s| s.write = WriteStatus::Closed);
        self.drop_outgoing();
    }

    /// Mark the remote side as no longer reading.
    pub fn close_remote_read(&self) {
        self.update(|s| s.remote_read = ReadStatus::Closed);
    }

    /// Number of graceful closes requested.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PhysicalStream for MemoryStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn status(&self) -> StreamStatus {
        self.state().status
    }

    fn write_status(&self) -> WriteStatus {
        self.state().write
    }

    fn remote_read_status(&self) -> ReadStatus {
        self.state().remote_read
    }

    async fn write(&self, data: Bytes) -> Result<(), WireError> {
        let state = self.state();
        if state.status != StreamStatus::Open || state.write != WriteStatus::Writable {
            return Err(WireError::StreamClosed);
        }
        let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        match outgoing.as_ref() {
            Some(tx) => tx.send(data).map_err(|_| WireError::StreamClosed),
            None => Err(WireError::StreamClosed),
        }
    }

    async fn read(&self) -> Result<Option<Bytes>, WireError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            chunk = incoming.recv() => Ok(chunk),
            _ = self.wait_closed() => match self.status() {
                StreamStatus::Reset => Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "stream reset",
                ))),
                _ => Ok(None),
            },
        }
    }

    async fn close(&self) -> Result<(), WireError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.update(|s| {
            s.status = StreamStatus::Closed;
            s.write = WriteStatus::Closed;
        });
        self.drop_outgoing();
        self.notify_peer_stopped_reading();
        self.closed_tx.send_replace(true);
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.reset();
    }

    async fn closed(&self) {
        self.wait_closed().await
    }
}

type Acceptor = dyn Fn(Arc<dyn PhysicalStream>) + Send + Sync;

/// An in-memory connection recording every stream it opens.
pub struct MemoryConnection {
    id: String,
    status: Mutex<ConnectionStatus>,
    limited: AtomicBool,
    fail_new_stream: AtomicBool,
    stall_new_stream: AtomicBool,
    created: Mutex<Vec<Arc<MemoryStream>>>,
    remotes: Mutex<Vec<Arc<MemoryStream>>>,
    last_options: Mutex<Option<StreamOptions>>,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
}

impl MemoryConnection {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            status: Mutex::new(ConnectionStatus::Open),
            limited: AtomicBool::new(false),
            fail_new_stream: AtomicBool::new(false),
            stall_new_stream: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            remotes: Mutex::new(Vec::new()),
            last_options: Mutex::new(None),
            acceptor: Mutex::new(None),
        })
    }

    /// Hand the remote end of every new stream to `acceptor`.
    pub fn set_acceptor<F>(&self, acceptor: F)
    where
        F: Fn(Arc<dyn PhysicalStream>) + Send + Sync + 'static,
    {
        *self.acceptor.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(acceptor));
    }

    pub fn set_limited(&self, limited: bool) {
        self.limited.store(limited, Ordering::SeqCst);
    }

    /// Make `new_stream` fail until switched off.
    pub fn fail_new_stream(&self, fail: bool) {
        self.fail_new_stream.store(fail, Ordering::SeqCst);
    }

    /// Make later `new_stream` calls hang without completing.
    pub fn stall_new_stream(&self, stall: bool) {
        self.stall_new_stream.store(stall, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Local ends of every stream opened so far.
    pub fn created_streams(&self) -> Vec<Arc<MemoryStream>> {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Remote ends, in creation order.
    pub fn remote_ends(&self) -> Vec<Arc<MemoryStream>> {
        self.remotes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Options passed to the most recent `new_stream` call.
    pub fn last_options(&self) -> Option<StreamOptions> {
        *self.last_options.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PhysicalConnection for MemoryConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_limited(&self) -> bool {
        self.limited.load(Ordering::SeqCst)
    }

    async fn new_stream(
        &self,
        protocol: &str,
        options: StreamOptions,
    ) -> Result<Arc<dyn PhysicalStream>, WireError> {
        *self.last_options.lock().unwrap_or_else(|e| e.into_inner()) = Some(options);
        if self.stall_new_stream.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if self.fail_new_stream.load(Ordering::SeqCst) {
            return Err(WireError::StreamCreation(format!(
                "new_stream refused on connection {}",
                self.id
            )));
        }
        if self.is_limited() && !options.run_on_limited_connection {
            return Err(WireError::StreamCreation(
                "connection is limited and run_on_limited_connection is off".to_string(),
            ));
        }
        if self.status() != ConnectionStatus::Open {
            return Err(WireError::ConnectionClosed);
        }

        let (local, remote) = MemoryStream::pair(protocol);
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(local.clone());
        self.remotes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(remote.clone());

        let acceptor = self.acceptor.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(accept) = acceptor {
            accept(remote as Arc<dyn PhysicalStream>);
        }
        Ok(local)
    }

    async fn close(&self) -> Result<(), WireError> {
        self.set_status(ConnectionStatus::Closed);
        for stream in self.created_streams() {
            if stream.status() == StreamStatus::Open {
                stream.close().await?;
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Registration {
    address: Address,
    handler: Arc<dyn RequestHandler>,
    config: StreamConfig,
}

/// Routes dials to in-process listeners by transport value, falling back
/// to the logical address.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: DashMap<String, Registration>,
    dials: AtomicUsize,
    stall_dials: AtomicBool,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make later dials hang without completing.
    pub fn stall_dials(&self, stall: bool) {
        self.stall_dials.store(stall, Ordering::SeqCst);
    }

    /// Total dials attempted.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn lookup(&self, address: &Address) -> Option<Registration> {
        address
            .physical_transports()
            .find_map(|t| self.listeners.get(&t.value).map(|l| l.clone()))
            .or_else(|| self.listeners.get(address.value()).map(|l| l.clone()))
    }
}

impl Listener for MemoryNetwork {
    fn listen(
        &self,
        address: &Address,
        handler: Arc<dyn RequestHandler>,
        config: StreamConfig,
    ) -> Result<(), WireError> {
        let registration = Registration {
            address: address.clone(),
            handler,
            config,
        };
        for transport in address.physical_transports() {
            self.listeners
                .insert(transport.value.clone(), registration.clone());
        }
        self.listeners
            .insert(address.value().to_string(), registration);
        debug!(address = %address, "Memory listener registered");
        Ok(())
    }

    fn unlisten(&self, address: &Address) {
        self.listeners
            .retain(|_, l| !l.address.same_value(address));
    }
}

#[async_trait]
impl Dialer for MemoryNetwork {
    async fn dial(&self, address: &Address) -> Result<Arc<dyn PhysicalConnection>, WireError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.stall_dials.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let listener = self.lookup(address).ok_or_else(|| WireError::Dial {
            address: address.to_string(),
            reason: "no listener for address or transports".to_string(),
        })?;

        let conn_id = uuid::Uuid::new_v4().to_string();
        let client = MemoryConnection::new(conn_id.clone());
        let server = StreamManager::new(
            MemoryConnection::new(format!("{conn_id}-server")),
            listener.config.clone(),
            Some(listener.handler.clone()),
        );
        client.set_acceptor(move |remote| {
            server.accept_inbound(remote, None);
        });
        debug!(address = %address, listener = %listener.address, conn_id = %conn_id, "Memory dial");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_moves_bytes_both_ways() {
        let (a, b) = MemoryStream::pair("/o/leader");
        a.write(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.read().await.unwrap().unwrap(), Bytes::from_static(b"ping"));
        b.write(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.read().await.unwrap().unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_close_ends_peer_reads_and_marks_remote() {
        let (a, b) = MemoryStream::pair("/o/leader");
        a.close().await.unwrap();
        assert_eq!(a.status(), StreamStatus::Closed);
        assert!(b.read().await.unwrap().is_none());
        assert_eq!(b.remote_read_status(), ReadStatus::Closed);
        assert!(a.write(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_fails_local_read_and_fires_closed() {
        let (a, _b) = MemoryStream::pair("/o/leader");
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.closed().await })
        };
        a.reset();
        assert!(a.read().await.is_err());
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_unknown_address_fails() {
        let net = MemoryNetwork::new();
        let target = Address::new("o://leader/nowhere").unwrap();
        assert!(matches!(
            net.dial(&target).await,
            Err(WireError::Dial { .. })
        ));
        assert_eq!(net.dial_count(), 1);
    }
}
