//! Node configuration types.
//!
//! Loading from disk lives in the node crate; these are the plain serde
//! structures with their defaults.

use crate::address::{Address, LEADER_ADDRESS};
use crate::error::OrouteResult;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable overriding [`StreamConfig::max_outbound_streams`].
pub const MAX_OUTBOUND_STREAMS_ENV: &str = "MAX_OUTBOUND_STREAMS";

/// Whether a stream manager may hand out an existing stream for a new
/// logical request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReusePolicy {
    /// Open a fresh stream per request.
    #[default]
    None,
    /// Reuse a live stream for the same protocol.
    Reuse,
}

/// Stream-layer settings for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Create-new vs reuse.
    pub reuse_policy: ReusePolicy,
    /// Passed through to the transport when opening a stream. Zero and
    /// negative values are forwarded as-is.
    pub max_outbound_streams: Option<i64>,
    /// Allow streams over relayed / limited connections.
    pub run_on_limited_connection: bool,
    /// Interval for the reader/writer liveness poll.
    pub liveness_poll_ms: u64,
    /// Upper bound on writing a request and waiting for its response.
    pub request_timeout_secs: u64,
    /// Upper bound on dialing a next hop or opening a stream on it.
    pub connect_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reuse_policy: ReusePolicy::None,
            max_outbound_streams: None,
            run_on_limited_connection: true,
            liveness_poll_ms: 1000,
            request_timeout_secs: 120,
            connect_timeout_secs: 30,
        }
    }
}

/// Parse a `MAX_OUTBOUND_STREAMS` value. Any signed integer is accepted
/// unmodified.
pub fn parse_max_outbound_streams(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

impl StreamConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    /// Apply environment overrides using `lookup` for variable access.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(MAX_OUTBOUND_STREAMS_ENV) {
            match parse_max_outbound_streams(&raw) {
                Some(n) => self.max_outbound_streams = Some(n),
                None => warn!(
                    value = %raw,
                    "Ignoring unparseable {MAX_OUTBOUND_STREAMS_ENV}"
                ),
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }
}

/// An address plus the transports it is known to be reachable at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressConfig {
    pub address: String,
    #[serde(default)]
    pub transports: Vec<Transport>,
}

impl AddressConfig {
    /// Convert to a validated [`Address`].
    pub fn to_address(&self) -> OrouteResult<Address> {
        Ok(Address::new(self.address.clone())?.with_transports(self.transports.clone()))
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's own address.
    pub address: String,
    /// Transports this node listens on.
    pub transports: Vec<Transport>,
    /// The leader, when this node is not the leader itself.
    pub leader: Option<AddressConfig>,
    /// Known parents.
    pub parents: Vec<AddressConfig>,
    /// Known children.
    pub children: Vec<AddressConfig>,
    /// The registry, if reachable directly.
    pub registry: Option<AddressConfig>,
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Stream settings.
    pub stream: StreamConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: LEADER_ADDRESS.to_string(),
            transports: Vec::new(),
            leader: None,
            parents: Vec::new(),
            children: Vec::new(),
            registry: None,
            log_level: "info".to_string(),
            stream: StreamConfig::default(),
        }
    }
}

impl NodeConfig {
    /// This node's address with its own transports attached.
    pub fn self_address(&self) -> OrouteResult<Address> {
        Ok(Address::new(self.address.clone())?.with_transports(self.transports.clone()))
    }
}
