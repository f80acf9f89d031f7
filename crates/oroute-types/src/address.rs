//! Hierarchical logical addresses and their path algebra.
//!
//! An [`Address`] names a node or service (`o://leader/services/embeddings`)
//! independently of how it is reached. Physical reachability is carried
//! alongside as an ordered list of [`Transport`]s, attached once the address
//! has been resolved.
//!
//! The only invariant the type itself enforces is the `o://` scheme prefix.
//! Network-boundary sanitisation lives in [`crate::validation`].

use crate::error::{OrouteError, OrouteResult};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address scheme prefix.
pub const SCHEME: &str = "o://";

/// The well-known leader address. Static addresses always resolve here first.
pub const LEADER_ADDRESS: &str = "o://leader";

/// The registry's reserved address.
pub const REGISTRY_ADDRESS: &str = "o://registry";

/// Prefix of the slash-delimited RPC protocol form.
const PROTOCOL_PREFIX: &str = "/o/";

/// First path segment of every hierarchical (leader-rooted) address.
const LEADER_SEGMENT: &str = "leader";

/// A hierarchical logical address plus its known transports.
///
/// Two addresses are equal when their values match and their transports
/// are element-wise equal. Use [`Address::same_value`] for the logical
/// comparison that ignores transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AddressRepr", into = "AddressRepr")]
pub struct Address {
    value: String,
    transports: Vec<Transport>,
}

#[derive(Serialize, Deserialize)]
struct AddressRepr {
    value: String,
    #[serde(default)]
    transports: Vec<Transport>,
}

impl TryFrom<AddressRepr> for Address {
    type Error = OrouteError;

    fn try_from(repr: AddressRepr) -> Result<Self, Self::Error> {
        Ok(Address::new(repr.value)?.with_transports(repr.transports))
    }
}

impl From<Address> for AddressRepr {
    fn from(address: Address) -> Self {
        Self {
            value: address.value,
            transports: address.transports,
        }
    }
}

impl Address {
    /// Parse an address, enforcing the scheme prefix.
    pub fn new(value: impl Into<String>) -> OrouteResult<Self> {
        let value = value.into();
        if !value.starts_with(SCHEME) {
            return Err(OrouteError::invalid_address(
                value,
                format!("missing '{SCHEME}' prefix"),
            ));
        }
        Ok(Self {
            value,
            transports: Vec::new(),
        })
    }

    /// Build from a value already known to carry the scheme prefix.
    fn from_trusted(value: String) -> Self {
        debug_assert!(value.starts_with(SCHEME));
        Self {
            value,
            transports: Vec::new(),
        }
    }

    /// The well-known leader address (no transports).
    pub fn leader() -> Self {
        Self::from_trusted(LEADER_ADDRESS.to_string())
    }

    /// The registry's reserved address (no transports).
    pub fn registry() -> Self {
        Self::from_trusted(REGISTRY_ADDRESS.to_string())
    }

    /// Canonical string value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Known transports, in insertion order.
    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    /// Physical transports only.
    pub fn physical_transports(&self) -> impl Iterator<Item = &Transport> {
        self.transports.iter().filter(|t| t.is_physical())
    }

    /// Whether any transport is attached.
    pub fn has_transports(&self) -> bool {
        !self.transports.is_empty()
    }

    /// Replace the transport list.
    pub fn set_transports(&mut self, transports: Vec<Transport>) {
        self.transports = transports;
    }

    /// Builder form of [`Address::set_transports`].
    pub fn with_transports(mut self, transports: Vec<Transport>) -> Self {
        self.transports = transports;
        self
    }

    /// Append a transport unless an identical one is already listed.
    pub fn add_transport(&mut self, transport: Transport) {
        if !self.transports.contains(&transport) {
            self.transports.push(transport);
        }
    }

    /// Value without the scheme (`leader/services`).
    pub fn paths(&self) -> &str {
        &self.value[SCHEME.len()..]
    }

    /// Non-empty path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.paths().split('/').filter(|s| !s.is_empty())
    }

    /// RPC protocol form (`o://leader/services` -> `/o/leader/services`).
    pub fn protocol(&self) -> String {
        format!("{PROTOCOL_PREFIX}{}", self.paths())
    }

    /// The first path segment, re-prefixed (`o://leader`).
    pub fn root(&self) -> String {
        format!("{SCHEME}{}", self.segments().next().unwrap_or_default())
    }

    /// Whether this is the well-known leader address.
    pub fn is_leader(&self) -> bool {
        self.value == LEADER_ADDRESS
    }

    /// Whether this is the registry's reserved address.
    pub fn is_registry(&self) -> bool {
        self.value == REGISTRY_ADDRESS
    }

    /// A static address is any address not rooted at the leader. Static
    /// addresses are resolved centrally.
    pub fn is_static(&self) -> bool {
        self.segments().next() != Some(LEADER_SEGMENT)
    }

    /// Logical equality, ignoring transports.
    pub fn same_value(&self, other: &Address) -> bool {
        self.value == other.value
    }

    /// The last path segment as its own address, keeping transports.
    /// Single-segment addresses return an equal copy.
    pub fn to_static_address(&self) -> Address {
        match self.segments().last() {
            Some(last) if self.segments().count() > 1 => Address {
                value: format!("{SCHEME}{last}"),
                transports: self.transports.clone(),
            },
            _ => self.clone(),
        }
    }

    /// The first path segment as its own address, keeping transports.
    /// Single-segment addresses return an equal copy.
    pub fn to_root_address(&self) -> Address {
        if self.segments().count() > 1 {
            Address {
                value: self.root(),
                transports: self.transports.clone(),
            }
        } else {
            self.clone()
        }
    }

    /// Append one path segment.
    pub fn child(&self, segment: &str) -> Address {
        Self::from_trusted(format!(
            "{}/{}",
            self.value.trim_end_matches('/'),
            segment.trim_matches('/')
        ))
    }

    /// Compute the immediate next hop from `current` toward `target`.
    ///
    /// - already at the target: `current` is returned unchanged;
    /// - static target, or `target` not below `current`: the leader;
    /// - otherwise `current` extended by the first unresolved segment.
    pub fn next(current: &Address, target: &Address) -> Address {
        let current_protocol = current.protocol();
        let target_protocol = target.protocol();
        if target_protocol == current_protocol {
            return current.clone();
        }
        if target.is_static() {
            return Address::leader();
        }

        let prefix = format!("{}/", current_protocol.trim_end_matches('/'));
        let Some(remaining) = target_protocol.strip_prefix(&prefix) else {
            return Address::leader();
        };
        let remaining = remaining.strip_prefix(PROTOCOL_PREFIX).unwrap_or(remaining);

        match remaining.split('/').find(|s| !s.is_empty()) {
            Some(segment) => current.child(segment),
            None => current.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl FromStr for Address {
    type Err = OrouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[test]
    fn test_rejects_missing_scheme() {
        assert!(Address::new("leader/services").is_err());
        assert!(Address::new("").is_err());
        assert!(Address::new("http://leader").is_err());
    }

    #[test]
    fn test_derived_views() {
        let a = addr("o://leader/services/embeddings");
        assert_eq!(a.paths(), "leader/services/embeddings");
        assert_eq!(a.protocol(), "/o/leader/services/embeddings");
        assert_eq!(a.root(), "o://leader");
        assert!(!a.is_static());
        assert!(addr("o://embeddings").is_static());
    }

    #[test]
    fn test_next_already_there() {
        let next = Address::next(&addr("o://leader"), &addr("o://leader"));
        assert_eq!(next.value(), "o://leader");
    }

    #[test]
    fn test_next_direct_child() {
        let next = Address::next(&addr("o://leader"), &addr("o://leader/services"));
        assert_eq!(next.value(), "o://leader/services");
    }

    #[test]
    fn test_next_takes_first_remaining_segment() {
        // Two levels above the target: must stop at the intermediate level,
        // never jump to (or duplicate) the leaf name.
        let next = Address::next(
            &addr("o://leader"),
            &addr("o://leader/services/embeddings-text"),
        );
        assert_eq!(next.value(), "o://leader/services");
    }

    #[test]
    fn test_next_from_intermediate_level() {
        let next = Address::next(
            &addr("o://leader/services"),
            &addr("o://leader/services/embeddings-text"),
        );
        assert_eq!(next.value(), "o://leader/services/embeddings-text");
    }

    #[test]
    fn test_next_deep_path_walks_one_segment() {
        let next = Address::next(
            &addr("o://leader"),
            &addr("o://leader/a/b/c/d"),
        );
        assert_eq!(next.value(), "o://leader/a");
        let next = Address::next(&next, &addr("o://leader/a/b/c/d"));
        assert_eq!(next.value(), "o://leader/a/b");
    }

    #[test]
    fn test_next_unrelated_bounces_to_leader() {
        let next = Address::next(&addr("o://worker"), &addr("o://leader/services"));
        assert_eq!(next.value(), "o://leader");
    }

    #[test]
    fn test_next_static_bounces_to_leader() {
        let next = Address::next(&addr("o://leader"), &addr("o://embeddings-text"));
        assert_eq!(next.value(), "o://leader");
    }

    #[test]
    fn test_next_sibling_prefix_is_not_a_child() {
        // "o://leader/serv" is not an ancestor of "o://leader/services".
        let next = Address::next(&addr("o://leader/serv"), &addr("o://leader/services"));
        assert_eq!(next.value(), "o://leader");
    }

    #[test]
    fn test_static_and_root_of_single_segment() {
        let a = addr("o://leader").with_transports(vec![Transport::physical("/ip4/1.2.3.4")]);
        assert_eq!(a.to_static_address(), a);
        assert_eq!(a.to_root_address(), a);
    }

    #[test]
    fn test_static_and_root_keep_transports() {
        let t = vec![Transport::physical("/ip4/1.2.3.4/tcp/1")];
        let a = addr("o://leader/services/embeddings").with_transports(t.clone());
        let s = a.to_static_address();
        assert_eq!(s.value(), "o://embeddings");
        assert_eq!(s.transports(), t.as_slice());
        let r = a.to_root_address();
        assert_eq!(r.value(), "o://leader");
        assert_eq!(r.transports(), t.as_slice());
    }

    #[test]
    fn test_static_of_root_is_not_the_original() {
        let a = addr("o://leader/services");
        let round = a.to_root_address().to_static_address();
        assert_ne!(round, a);
    }

    #[test]
    fn test_equality_includes_transports() {
        let a = addr("o://leader");
        let b = addr("o://leader").with_transports(vec![Transport::physical("/ip4/1.1.1.1")]);
        assert_ne!(a, b);
        assert!(a.same_value(&b));
    }

    #[test]
    fn test_add_transport_dedupes() {
        let mut a = addr("o://leader");
        a.add_transport(Transport::physical("/ip4/1.1.1.1"));
        a.add_transport(Transport::physical("/ip4/1.1.1.1"));
        assert_eq!(a.transports().len(), 1);
    }

    #[test]
    fn test_serde_enforces_scheme() {
        let ok: Address = serde_json::from_str(r#"{"value":"o://leader"}"#).unwrap();
        assert!(ok.is_leader());
        let bad: Result<Address, _> = serde_json::from_str(r#"{"value":"leader"}"#);
        assert!(bad.is_err());
    }
}
