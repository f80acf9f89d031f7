//! Transport descriptors: how a logical address is physically reached.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of endpoint a [`Transport`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A physical multiaddress (`/ip4/10.0.0.1/tcp/4000/p2p/...`).
    Physical,
    /// A bridge-specific endpoint understood only by a custom dialer.
    Custom,
}

/// One reachable endpoint for an address.
///
/// Transports are owned by the [`Address`](crate::Address) that lists them
/// and have no lifecycle of their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transport {
    /// Opaque endpoint value. For physical transports this is a multiaddress.
    pub value: String,
    /// Endpoint kind.
    #[serde(default = "default_kind")]
    pub kind: TransportKind,
}

fn default_kind() -> TransportKind {
    TransportKind::Physical
}

impl Transport {
    /// A physical multiaddress transport.
    pub fn physical(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: TransportKind::Physical,
        }
    }

    /// A custom bridge transport.
    pub fn custom(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: TransportKind::Custom,
        }
    }

    /// Whether this is a physical multiaddress.
    pub fn is_physical(&self) -> bool {
        self.kind == TransportKind::Physical
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::Physical => write!(f, "{}", self.value),
            TransportKind::Custom => write!(f, "custom:{}", self.value),
        }
    }
}
