//! Inbound request handling.

use crate::error::WireError;
use crate::stream::Stream;
use async_trait::async_trait;
use oroute_types::{Request, Response, ResponseBuilder};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Callback receiving intermediate chunks of a streamed response.
pub type ChunkCallback = dyn Fn(Response) + Send + Sync;

/// Handles requests arriving on inbound streams.
///
/// The returned response is the final one. Handlers that stream send
/// intermediate chunks through `chunks` first; the stream manager marks the
/// final response as the last chunk when any were sent.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, request: Request, chunks: &ChunkWriter) -> Response;
}

/// Writes intermediate streaming chunks for one request.
pub struct ChunkWriter {
    stream: Arc<Stream>,
    builder: ResponseBuilder,
    sent: AtomicUsize,
}

impl ChunkWriter {
    pub fn new(stream: Arc<Stream>, request: &Request) -> Self {
        Self {
            stream,
            builder: ResponseBuilder::new(request),
            sent: AtomicUsize::new(0),
        }
    }

    /// Send one intermediate chunk.
    pub async fn send(&self, data: Value) -> Result<(), WireError> {
        self.stream.write_message(&self.builder.chunk(data)).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Forward a chunk produced elsewhere (e.g. by a downstream hop),
    /// re-addressed to this request.
    pub async fn relay(&self, mut chunk: Response) -> Result<(), WireError> {
        chunk.id = self.builder.id().clone();
        chunk.result.is_streaming = true;
        chunk.result.last = false;
        self.stream.write_message(&chunk).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn builder(&self) -> &ResponseBuilder {
        &self.builder
    }
}
