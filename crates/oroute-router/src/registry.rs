//! Registry of reachable services.
//!
//! The [`RegistryClient`] trait is what the registry search resolver
//! consumes; [`InMemoryRegistry`] is the store the registry node serves.

use crate::error::RouteError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oroute_types::Transport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// One registered node or service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub peer_id: String,
    /// Full hierarchical address (`o://leader/services/embeddings-text`).
    pub address: String,
    /// Static name (`o://embeddings-text`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_address: Option<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub transports: Vec<Transport>,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn new(peer_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: address.into(),
            static_address: None,
            protocols: Vec::new(),
            transports: Vec::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn with_static_address(mut self, static_address: impl Into<String>) -> Self {
        self.static_address = Some(static_address.into());
        self
    }

    pub fn with_transports(mut self, transports: Vec<Transport>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }
}

/// Search filters. Every filter that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_address: Option<String>,
    /// Matches an entry whose full or static address is this value or a
    /// segment prefix of it (`o://embeddings-text` serves
    /// `o://embeddings-text/custom/path`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// The entry must offer all of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
}

impl SearchParams {
    fn matches(&self, entry: &RegistryEntry) -> bool {
        if let Some(s) = &self.static_address {
            if entry.static_address.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        if let Some(a) = &self.address {
            let served = is_path_prefix(&entry.address, a)
                || entry
                    .static_address
                    .as_deref()
                    .is_some_and(|s| is_path_prefix(s, a));
            if !served {
                return false;
            }
        }
        if let Some(protocols) = &self.protocols {
            if !protocols.iter().all(|p| entry.protocols.contains(p)) {
                return false;
            }
        }
        true
    }
}

/// `prefix` equals `value` or names one of its ancestors. A bare string
/// prefix is not enough: `o://embed` does not serve `o://embeddings-text`.
fn is_path_prefix(prefix: &str, value: &str) -> bool {
    match value.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Access to a registry, local or remote.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Matching entries, most recently registered first.
    async fn search(&self, params: SearchParams) -> Result<Vec<RegistryEntry>, RouteError>;

    /// Register or replace the entry for `entry.peer_id`.
    async fn commit(&self, entry: RegistryEntry) -> Result<(), RouteError>;

    /// Remove a peer's entry. Returns whether one existed.
    async fn remove(&self, peer_id: &str) -> Result<bool, RouteError>;

    async fn find_all(&self) -> Result<Vec<RegistryEntry>, RouteError>;
}

#[derive(Debug, Default)]
struct Store {
    /// peer_id -> (insertion sequence, entry)
    entries: HashMap<String, (u64, RegistryEntry)>,
    seq: u64,
}

/// Thread-safe in-process registry.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    store: Arc<RwLock<Store>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_entry(&self, mut entry: RegistryEntry) {
        entry.registered_at = Utc::now();
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.seq += 1;
        let seq = store.seq;
        info!(peer_id = %entry.peer_id, address = %entry.address, "Registry commit");
        store.entries.insert(entry.peer_id.clone(), (seq, entry));
    }

    pub fn remove_entry(&self, peer_id: &str) -> bool {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        let removed = store.entries.remove(peer_id).is_some();
        if removed {
            info!(peer_id, "Registry remove");
        }
        removed
    }

    pub fn search_entries(&self, params: &SearchParams) -> Vec<RegistryEntry> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<&(u64, RegistryEntry)> = store
            .entries
            .values()
            .filter(|(_, e)| params.matches(e))
            .collect();
        // Sequence numbers follow commit order, so newest first.
        hits.sort_by(|(a, _), (b, _)| b.cmp(a));
        debug!(?params, hits = hits.len(), "Registry search");
        hits.into_iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn all_entries(&self) -> Vec<RegistryEntry> {
        self.search_entries(&SearchParams::default())
    }

    pub fn len(&self) -> usize {
        self.store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn search(&self, params: SearchParams) -> Result<Vec<RegistryEntry>, RouteError> {
        Ok(self.search_entries(&params))
    }

    async fn commit(&self, entry: RegistryEntry) -> Result<(), RouteError> {
        self.commit_entry(entry);
        Ok(())
    }

    async fn remove(&self, peer_id: &str) -> Result<bool, RouteError> {
        Ok(self.remove_entry(peer_id))
    }

    async fn find_all(&self) -> Result<Vec<RegistryEntry>, RouteError> {
        Ok(self.all_entries())
    }
}
