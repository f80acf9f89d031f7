//! Per-connection stream lifecycle: create-vs-reuse, the reader/writer pair
//! for limited connections, frame dispatch and response correlation.
//!
//! One [`StreamManager`] exists per connection. Every tracked stream gets a
//! dispatch task that reads frames and routes them:
//!
//! - requests go to the [`RequestHandler`] in their own task
//! - responses are delivered to the waiter registered for their `id`
//! - `stream-init` designates the stream as the caller's reader or writer
//!
//! Closing the manager cancels every dispatch task through a shared
//! shutdown signal, so pending calls fail with [`WireError::Aborted`]
//! rather than [`WireError::StreamClosed`].

use crate::codec::{decode_payload, FrameDecoder};
use crate::error::WireError;
use crate::handler::{ChunkCallback, ChunkWriter, RequestHandler};
use crate::message::{StreamInit, StreamInitAck, StreamRole, WireMessage};
use crate::stream::{Stream, StreamDirection};
use crate::transport::{PhysicalConnection, PhysicalStream, StreamOptions};
use dashmap::DashMap;
use oroute_types::config::{ReusePolicy, StreamConfig};
use oroute_types::{Address, Request, Response, ResponseBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications emitted by a [`StreamManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A designated reader or writer stream was observed closed.
    StreamClosed { stream_id: String, role: StreamRole },
    /// The manager finished closing.
    ManagerClosed,
}

/// Manages the streams of one connection.
pub struct StreamManager {
    connection: Arc<dyn PhysicalConnection>,
    config: StreamConfig,
    handler: Option<Arc<dyn RequestHandler>>,
    streams: DashMap<String, Arc<Stream>>,
    caller_reader: Mutex<Option<Arc<Stream>>>,
    caller_writer: Mutex<Option<Arc<Stream>>>,
    /// Serialises check-then-create under the reuse policy.
    creation_lock: tokio::sync::Mutex<()>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    events: broadcast::Sender<StreamEvent>,
    closed: AtomicBool,
}

impl StreamManager {
    pub fn new(
        connection: Arc<dyn PhysicalConnection>,
        config: StreamConfig,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connection,
            config,
            handler,
            streams: DashMap::new(),
            caller_reader: Mutex::new(None),
            caller_writer: Mutex::new(None),
            creation_lock: tokio::sync::Mutex::new(()),
            watchers: Mutex::new(Vec::new()),
            shutdown_tx,
            events,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Subscribe to stream and manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Number of tracked streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn get_stream(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.get(id).map(|e| e.value().clone())
    }

    pub fn caller_reader(&self) -> Option<Arc<Stream>> {
        self.caller_reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn caller_writer(&self) -> Option<Arc<Stream>> {
        self.caller_writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A stream for one outbound logical request.
    ///
    /// An open caller reader stream always wins. Otherwise the default
    /// policy opens a fresh stream; the reuse policy hands back a live
    /// stream for the same protocol when one exists.
    pub async fn get_or_create_stream(
        self: &Arc<Self>,
        protocol: &str,
        remote: Option<&Address>,
    ) -> Result<Arc<Stream>, WireError> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        if let Some(reader) = self.caller_reader() {
            if reader.is_open() {
                debug!(stream_id = %reader.id(), "Using caller reader stream");
                return Ok(reader);
            }
        }

        match self.config.reuse_policy {
            ReusePolicy::None => self.create_stream(protocol, remote).await,
            ReusePolicy::Reuse => {
                let _guard = self.creation_lock.lock().await;
                if let Some(existing) = self.find_reusable(protocol) {
                    return Ok(existing);
                }
                self.evict_dead();
                self.create_stream(protocol, remote).await
            }
        }
    }

    fn find_reusable(&self, protocol: &str) -> Option<Arc<Stream>> {
        self.streams
            .iter()
            .find(|e| {
                let s = e.value();
                s.direction() == StreamDirection::Outbound
                    && s.protocol() == protocol
                    && s.is_reusable()
            })
            .map(|e| e.value().clone())
    }

    fn evict_dead(&self) {
        self.streams.retain(|id, s| {
            let keep = s.is_open();
            if !keep {
                debug!(stream_id = %id, "Evicting dead stream");
            }
            keep
        });
    }

    /// Open and track a new outbound stream. Transport errors are returned
    /// as-is.
    pub async fn create_stream(
        self: &Arc<Self>,
        protocol: &str,
        remote: Option<&Address>,
    ) -> Result<Arc<Stream>, WireError> {
        let options = StreamOptions {
            max_outbound_streams: self.config.max_outbound_streams,
            run_on_limited_connection: self.config.run_on_limited_connection,
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Err(WireError::Aborted);
        }
        let timeout = self.config.connect_timeout();
        let opened = tokio::select! {
            opened = tokio::time::timeout(timeout, self.connection.new_stream(protocol, options)) => opened,
            _ = shutdown.changed() => return Err(WireError::Aborted),
        };
        let physical = match opened {
            Ok(Ok(physical)) => physical,
            Ok(Err(e)) => {
                warn!(protocol, error = %e, "Stream creation failed");
                return Err(e);
            }
            Err(_) => {
                warn!(protocol, timeout_secs = timeout.as_secs(), "Stream creation timed out");
                return Err(WireError::StreamCreation(format!(
                    "new_stream timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };
        let stream = Arc::new(Stream::new(
            physical,
            StreamDirection::Outbound,
            remote.cloned(),
        ));
        debug!(stream_id = %stream.id(), protocol, "Opened outbound stream");
        self.track(stream.clone());
        Ok(stream)
    }

    /// Track a stream opened by the remote side and start dispatching it.
    pub fn accept_inbound(
        self: &Arc<Self>,
        physical: Arc<dyn PhysicalStream>,
        remote: Option<Address>,
    ) -> Arc<Stream> {
        let stream = Arc::new(Stream::new(physical, StreamDirection::Inbound, remote));
        debug!(stream_id = %stream.id(), protocol = %stream.protocol(), "Accepted inbound stream");
        self.track(stream.clone());
        stream
    }

    fn track(self: &Arc<Self>, stream: Arc<Stream>) {
        self.streams.insert(stream.id().to_string(), stream.clone());
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let stream_id = stream.id().to_string();
            match manager.handle_incoming_stream(stream).await {
                Ok(()) => debug!(stream_id = %stream_id, "Stream read loop finished"),
                Err(e) if e.is_timeout() => {
                    debug!(stream_id = %stream_id, error = %e, "Stream read loop aborted")
                }
                Err(e) => warn!(stream_id = %stream_id, error = %e, "Stream read loop failed"),
            }
        });
    }

    /// Stop tracking a stream and close it, ignoring close errors.
    pub async fn release_stream(&self, stream_id: &str) {
        if let Some((_, stream)) = self.streams.remove(stream_id) {
            Self::close_quietly(&stream).await;
        }
    }

    /// Untrack `stream` if it is still tracked, then close it. Streams the
    /// read loop already dropped are closed too.
    async fn release(&self, stream: &Arc<Stream>) {
        self.streams
            .remove_if(stream.id(), |_, tracked| Arc::ptr_eq(tracked, stream));
        Self::close_quietly(stream).await;
    }

    async fn close_quietly(stream: &Stream) {
        if stream.is_open() {
            if let Err(e) = stream.close().await {
                debug!(stream_id = %stream.id(), error = %e, "Ignoring close error on release");
            }
        }
    }

    fn is_caller_stream(&self, stream: &Arc<Stream>) -> bool {
        let same = |slot: Option<Arc<Stream>>| slot.is_some_and(|s| Arc::ptr_eq(&s, stream));
        same(self.caller_reader()) || same(self.caller_writer())
    }

    /// Called once a transmit on `stream` completes. The default policy
    /// releases the stream; reused and caller streams stay open.
    pub async fn post_transmit(&self, stream: &Arc<Stream>) {
        if self.config.reuse_policy == ReusePolicy::Reuse || self.is_caller_stream(stream) {
            return;
        }
        self.release(stream).await;
    }

    /// Send `request` on `stream` and wait for its terminal response.
    ///
    /// Intermediate chunks of a streamed response are passed to `on_chunk`
    /// in arrival order. Responses for other ids are never seen here.
    pub async fn send_request(
        &self,
        stream: &Arc<Stream>,
        request: &Request,
        on_chunk: Option<&ChunkCallback>,
    ) -> Result<Response, WireError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Err(WireError::Aborted);
        }

        let deadline = Instant::now() + self.config.request_timeout();
        let mut rx = stream.register_pending(request.id.clone());
        let written = tokio::select! {
            written = tokio::time::timeout_at(deadline, stream.write_message(request)) => {
                written.unwrap_or(Err(WireError::Timeout))
            }
            _ = shutdown.changed() => Err(WireError::Aborted),
        };
        if let Err(e) = written {
            stream.remove_pending(&request.id);
            return Err(e);
        }

        loop {
            tokio::select! {
                received = tokio::time::timeout_at(deadline, rx.recv()) => match received {
                    Err(_) => {
                        stream.remove_pending(&request.id);
                        warn!(request_id = %request.id, method = %request.method, "Request timed out");
                        return Err(WireError::Timeout);
                    }
                    Ok(None) => {
                        return Err(if *shutdown.borrow() {
                            WireError::Aborted
                        } else {
                            stream.failure()
                        });
                    }
                    Ok(Some(response)) if response.is_terminal() => return Ok(response),
                    Ok(Some(chunk)) => {
                        if let Some(cb) = on_chunk {
                            cb(chunk);
                        }
                    }
                },
                _ = shutdown.changed() => {
                    stream.remove_pending(&request.id);
                    return Err(WireError::Aborted);
                }
            }
        }
    }

    /// Read loop for one stream. Exits at end of stream, on a framing or
    /// parse error, or when the manager shuts down. Pending requests fail on
    /// the way out and see the parse error if there was one. Unless the
    /// manager is shutting down, the stream is also untracked and closed.
    pub async fn handle_incoming_stream(
        self: &Arc<Self>,
        stream: Arc<Stream>,
    ) -> Result<(), WireError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut decoder = FrameDecoder::new();

        let result = loop {
            if *shutdown.borrow() {
                break Err(WireError::Aborted);
            }
            let read = tokio::select! {
                read = stream.physical().read() => read,
                _ = shutdown.changed() => break Err(WireError::Aborted),
            };
            match read {
                Ok(Some(bytes)) => {
                    decoder.extend(&bytes);
                    if let Err(e) = self.drain_frames(&stream, &mut decoder).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            stream.record_failure(e);
        }
        // On shutdown the manager's close owns untracking and closing.
        if !matches!(result, Err(WireError::Aborted)) {
            self.streams
                .remove_if(stream.id(), |_, tracked| Arc::ptr_eq(tracked, &stream));
            // Close before waking waiters so their release finds it closed.
            if stream.is_open() {
                if let Err(e) = stream.physical().close().await {
                    debug!(stream_id = %stream.id(), error = %e, "Ignoring close error after read loop");
                }
            }
        }
        stream.clear_pending();
        result
    }

    async fn drain_frames(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        decoder: &mut FrameDecoder,
    ) -> Result<(), WireError> {
        while let Some(frame) = decoder.next_frame()? {
            let value = decode_payload(&frame)?;
            self.dispatch(stream, WireMessage::classify(value)).await;
        }
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, stream: &Arc<Stream>, message: WireMessage) {
        match message {
            WireMessage::Request(request) => self.spawn_request(stream.clone(), request),
            WireMessage::Response(response) => {
                let id = response.id.clone();
                if !stream.deliver_response(response) {
                    debug!(stream_id = %stream.id(), request_id = %id, "Skipping response with no waiter");
                }
            }
            WireMessage::StreamInit(init) => self.handle_stream_init(stream, init).await,
            WireMessage::StreamInitAck(ack) => {
                debug!(stream_id = %ack.stream_id, role = %ack.role, status = ?ack.status, "Stream-init acknowledged");
            }
            WireMessage::Unknown(value) => {
                let keys: Vec<String> = value
                    .as_object()
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                warn!(stream_id = %stream.id(), ?keys, "Dropping unrecognised message");
            }
        }
    }

    fn spawn_request(self: &Arc<Self>, stream: Arc<Stream>, request: Request) {
        let handler = self.handler.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let Some(handler) = handler else {
                let response = ResponseBuilder::new(&request).error("no request handler on this node");
                if let Err(e) = stream.write_message(&response).await {
                    debug!(error = %e, "Failed to write handler error response");
                }
                return;
            };

            let request_id = request.id.clone();
            let chunks = ChunkWriter::new(stream.clone(), &request);
            let response = tokio::select! {
                response = handler.handle_request(request, &chunks) => response,
                _ = shutdown.changed() => {
                    debug!(request_id = %request_id, "Request handler cancelled");
                    return;
                }
            };
            let response = if chunks.sent() > 0 {
                chunks.builder().finish_stream(response)
            } else {
                response
            };
            if let Err(e) = stream.write_message(&response).await {
                warn!(request_id = %request_id, error = %e, "Failed to write response");
            }
        });
    }

    async fn handle_stream_init(self: &Arc<Self>, stream: &Arc<Stream>, init: StreamInit) {
        let ack = match init.role() {
            Some(role) => {
                stream.set_role(role);
                *self.role_slot(role).lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(stream.clone());
                self.spawn_liveness_watcher(stream.clone(), role);
                info!(
                    stream_id = %stream.id(),
                    %role,
                    connection_id = %init.connection_id,
                    "Designated caller stream"
                );
                StreamInitAck::success(stream.id(), role)
            }
            None => {
                warn!(stream_id = %stream.id(), role = %init.role, "Unknown stream-init role");
                StreamInitAck::error(
                    stream.id(),
                    init.role.clone(),
                    format!("unknown stream role '{}'", init.role),
                )
            }
        };
        if let Err(e) = stream.write_message(&ack).await {
            warn!(stream_id = %stream.id(), error = %e, "Failed to send stream-init ack");
        }
    }

    fn role_slot(&self, role: StreamRole) -> &Mutex<Option<Arc<Stream>>> {
        match role {
            StreamRole::Reader => &self.caller_reader,
            StreamRole::Writer => &self.caller_writer,
        }
    }

    /// Watch a designated stream until it leaves the open state. The close
    /// notification is preferred; the poll covers transports that never
    /// signal it.
    fn spawn_liveness_watcher(self: &Arc<Self>, stream: Arc<Stream>, role: StreamRole) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let poll = Duration::from_millis(self.config.liveness_poll_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stream.physical().closed() => {}
                }
                if stream.is_open() {
                    continue;
                }
                if let Some(manager) = manager.upgrade() {
                    manager.clear_caller_stream(&stream, role);
                }
                return;
            }
        });
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn clear_caller_stream(&self, stream: &Arc<Stream>, role: StreamRole) {
        let mut slot = self.role_slot(role).lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, stream)) {
            *slot = None;
            drop(slot);
            info!(stream_id = %stream.id(), %role, "Caller stream closed");
            let _ = self.events.send(StreamEvent::StreamClosed {
                stream_id: stream.id().to_string(),
                role,
            });
        }
    }

    fn abort_watchers(&self) {
        for handle in self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
    }

    /// Abort in-flight reads and watchers without closing streams.
    pub fn cancel(&self) {
        self.abort_watchers();
        self.shutdown_tx.send_replace(true);
    }

    /// Tear everything down: watchers, in-flight reads and handlers, every
    /// tracked stream. Individual close failures do not stop the sweep.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_watchers();
        self.shutdown_tx.send_replace(true);

        let streams: Vec<Arc<Stream>> = self.streams.iter().map(|e| e.value().clone()).collect();
        for stream in &streams {
            if let Err(e) = stream.close().await {
                debug!(stream_id = %stream.id(), error = %e, "Ignoring close error");
            }
        }

        self.streams.clear();
        *self.caller_reader.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.caller_writer.lock().unwrap_or_else(|e| e.into_inner()) = None;

        info!(closed_streams = streams.len(), "Stream manager closed");
        let _ = self.events.send(StreamEvent::ManagerClosed);
    }
}
