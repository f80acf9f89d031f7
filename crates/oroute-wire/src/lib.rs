//! oroute wire layer: connections, streams and framing.
//!
//! Carries requests to a resolved next hop over a multiplexed connection
//! using length-prefixed JSON frames.
//!
//! ## Architecture
//!
//! - **ConnectionManager**: caches one [`Connection`] per next-hop address,
//!   validating before reuse and evicting on failure
//! - **Connection**: one physical link; transmits requests through its
//!   stream manager
//! - **StreamManager**: create-vs-reuse policy, reader/writer stream pairs
//!   for limited connections, frame dispatch and response correlation
//! - **transport**: the physical capability traits the layer is built on
//! - **memory**: an in-process transport for local simulation and tests

pub mod codec;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod handler;
pub mod memory;
pub mod message;
pub mod stream;
pub mod stream_manager;
pub mod transport;

pub use connection::{Connection, ConnectionConfig};
pub use connection_manager::ConnectionManager;
pub use error::WireError;
pub use handler::{ChunkCallback, ChunkWriter, RequestHandler};
pub use message::{StreamInit, StreamInitAck, StreamRole, WireMessage};
pub use stream::{Stream, StreamDirection};
pub use stream_manager::{StreamEvent, StreamManager};
pub use transport::{Dialer, Listener, PhysicalConnection, PhysicalStream, StreamOptions};
