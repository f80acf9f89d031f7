//! A managed stream: physical stream plus framing and response correlation.

use crate::codec::encode_frame;
use crate::error::WireError;
use crate::message::StreamRole;
use crate::transport::{PhysicalStream, ReadStatus, StreamStatus, WriteStatus};
use oroute_types::{Address, RequestId, Response};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Who opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Inbound,
    Outbound,
}

/// A physical stream wrapped with framing, a write lock and the table of
/// requests awaiting a response on it.
pub struct Stream {
    physical: Arc<dyn PhysicalStream>,
    direction: StreamDirection,
    remote_address: Option<Address>,
    /// Set once a stream-init designates this stream.
    role: Mutex<Option<StreamRole>>,
    pending: Mutex<HashMap<RequestId, mpsc::UnboundedSender<Response>>>,
    /// Why the read loop gave up, when waiters should hear more than
    /// "stream closed".
    failure: Mutex<Option<WireError>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("protocol", &self.protocol())
            .field("direction", &self.direction)
            .field("status", &self.physical.status())
            .finish()
    }
}

impl Stream {
    pub fn new(
        physical: Arc<dyn PhysicalStream>,
        direction: StreamDirection,
        remote_address: Option<Address>,
    ) -> Self {
        Self {
            physical,
            direction,
            remote_address,
            role: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        self.physical.id()
    }

    pub fn protocol(&self) -> &str {
        self.physical.protocol()
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn remote_address(&self) -> Option<&Address> {
        self.remote_address.as_ref()
    }

    pub fn physical(&self) -> &Arc<dyn PhysicalStream> {
        &self.physical
    }

    pub fn role(&self) -> Option<StreamRole> {
        *self.role.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_role(&self, role: StreamRole) {
        *self.role.lock().unwrap_or_else(|e| e.into_inner()) = Some(role);
    }

    pub fn is_open(&self) -> bool {
        self.physical.status() == StreamStatus::Open
    }

    /// Open, locally writable, and the remote still reading. All three must
    /// hold; a stream whose remote stopped reading would swallow requests.
    pub fn is_reusable(&self) -> bool {
        self.physical.status() == StreamStatus::Open
            && self.physical.write_status() == WriteStatus::Writable
            && self.physical.remote_read_status() == ReadStatus::Readable
    }

    /// Frame and write one message. Concurrent writers are serialised so
    /// frames never interleave.
    pub async fn write_message<T: Serialize>(&self, msg: &T) -> Result<(), WireError> {
        let frame = encode_frame(msg)?;
        let _guard = self.write_lock.lock().await;
        self.physical.write(frame).await
    }

    /// Register interest in responses with `id`.
    pub fn register_pending(&self, id: RequestId) -> mpsc::UnboundedReceiver<Response> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        rx
    }

    /// Route a response to its waiter. Returns false when nobody is
    /// waiting for that id.
    pub fn deliver_response(&self, response: Response) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let terminal = response.is_terminal();
        let id = response.id.clone();
        let Some(tx) = pending.get(&id) else {
            return false;
        };
        let delivered = tx.send(response).is_ok();
        if terminal || !delivered {
            pending.remove(&id);
        }
        delivered
    }

    pub fn remove_pending(&self, id: &RequestId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn clear_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !pending.is_empty() {
            debug!(stream_id = %self.id(), count = pending.len(), "Dropping pending requests");
        }
        pending.clear();
    }

    /// Remember a framing or parse failure so waiters woken by the
    /// following [`clear_pending`](Self::clear_pending) can report it.
    pub(crate) fn record_failure(&self, error: &WireError) {
        if let Some(kept) = replayable(error) {
            *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(kept);
        }
    }

    /// The error a waiter should see when its response never arrives.
    pub fn failure(&self) -> WireError {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(replayable)
            .unwrap_or(WireError::StreamClosed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn close(&self) -> Result<(), WireError> {
        self.clear_pending();
        self.physical.close().await
    }

    pub fn abort(&self) {
        self.clear_pending();
        self.physical.abort();
    }
}

/// Copy of the errors worth reporting to every waiter on a stream.
fn replayable(error: &WireError) -> Option<WireError> {
    match error {
        WireError::Parse { reason, preview } => Some(WireError::Parse {
            reason: reason.clone(),
            preview: preview.clone(),
        }),
        WireError::MessageTooLarge { size, max } => Some(WireError::MessageTooLarge {
            size: *size,
            max: *max,
        }),
        _ => None,
    }
}
