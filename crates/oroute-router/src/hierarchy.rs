//! The hierarchy table: leaders, parents and children this node knows.
//!
//! Each list holds at most one entry per address value. Re-adding an
//! address replaces the stored entry in place, so the most recently added
//! transports win.

use oroute_types::{Address, Transport};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Tables {
    leaders: Vec<Address>,
    parents: Vec<Address>,
    children: Vec<Address>,
}

/// Thread-safe table of neighbouring nodes.
#[derive(Debug, Clone, Default)]
pub struct HierarchyTable {
    inner: Arc<RwLock<Tables>>,
}

fn upsert(list: &mut Vec<Address>, address: Address) {
    match list.iter_mut().find(|a| a.same_value(&address)) {
        Some(existing) => *existing = address,
        None => list.push(address),
    }
}

impl HierarchyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_leader(&self, address: Address) {
        let mut t = self.inner.write().unwrap_or_else(|e| e.into_inner());
        upsert(&mut t.leaders, address);
    }

    pub fn add_parent(&self, address: Address) {
        let mut t = self.inner.write().unwrap_or_else(|e| e.into_inner());
        upsert(&mut t.parents, address);
    }

    pub fn add_child(&self, address: Address) {
        let mut t = self.inner.write().unwrap_or_else(|e| e.into_inner());
        upsert(&mut t.children, address);
    }

    pub fn remove_child(&self, address: &Address) -> Option<Address> {
        let mut t = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let idx = t.children.iter().position(|a| a.same_value(address))?;
        Some(t.children.remove(idx))
    }

    pub fn leaders(&self) -> Vec<Address> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .leaders
            .clone()
    }

    pub fn parents(&self) -> Vec<Address> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .parents
            .clone()
    }

    pub fn children(&self) -> Vec<Address> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .children
            .clone()
    }

    /// The stored child with the same value as `address`, transports included.
    pub fn find_child(&self, address: &Address) -> Option<Address> {
        let t = self.inner.read().unwrap_or_else(|e| e.into_inner());
        t.children.iter().find(|a| a.same_value(address)).cloned()
    }

    pub fn find_parent(&self, address: &Address) -> Option<Address> {
        let t = self.inner.read().unwrap_or_else(|e| e.into_inner());
        t.parents.iter().find(|a| a.same_value(address)).cloned()
    }

    /// Drop every entry. Used on node teardown.
    pub fn clear(&self) {
        let mut t = self.inner.write().unwrap_or_else(|e| e.into_inner());
        t.leaders.clear();
        t.parents.clear();
        t.children.clear();
    }
}

/// What resolvers may know about the node they run on.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// This node's address with its own transports.
    pub address: Address,
    /// The configured leader, for non-leader nodes.
    pub leader: Option<Address>,
    pub hierarchy: HierarchyTable,
}

impl NodeContext {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            leader: None,
            hierarchy: HierarchyTable::new(),
        }
    }

    pub fn with_leader(mut self, leader: Address) -> Self {
        self.hierarchy.add_leader(leader.clone());
        self.leader = Some(leader);
        self
    }

    pub fn is_leader(&self) -> bool {
        self.address.is_leader()
    }

    /// Transports the leader is reachable at: this node's own when it is
    /// the leader, else the configured leader's, else any leader in the
    /// hierarchy table that has transports.
    pub fn leader_transports(&self) -> Vec<Transport> {
        if self.is_leader() {
            return self.address.transports().to_vec();
        }
        if let Some(leader) = self.leader.as_ref().filter(|l| l.has_transports()) {
            return leader.transports().to_vec();
        }
        self.hierarchy
            .leaders()
            .into_iter()
            .find(|l| l.has_transports())
            .map(|l| l.transports().to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(value: &str, transport: &str) -> Address {
        Address::new(value)
            .unwrap()
            .with_transports(vec![Transport::physical(transport)])
    }

    #[test]
    fn test_dedup_last_write_wins() {
        let table = HierarchyTable::new();
        table.add_child(addr("o://leader/a", "/t/1"));
        table.add_child(addr("o://leader/b", "/t/2"));
        table.add_child(addr("o://leader/a", "/t/3"));

        let children = table.children();
        assert_eq!(children.len(), 2);
        // Position is kept, transports replaced.
        assert_eq!(children[0].value(), "o://leader/a");
        assert_eq!(children[0].transports()[0].value, "/t/3");
    }

    #[test]
    fn test_find_and_remove_child() {
        let table = HierarchyTable::new();
        table.add_child(addr("o://leader/a", "/t/1"));
        let probe = Address::new("o://leader/a").unwrap();
        assert_eq!(table.find_child(&probe).unwrap().transports().len(), 1);
        assert!(table.remove_child(&probe).is_some());
        assert!(table.find_child(&probe).is_none());
        assert!(table.remove_child(&probe).is_none());
    }

    #[test]
    fn test_clear_empties_all_lists() {
        let table = HierarchyTable::new();
        table.add_leader(addr("o://leader", "/t/0"));
        table.add_parent(addr("o://leader/p", "/t/1"));
        table.add_child(addr("o://leader/p/c", "/t/2"));
        table.clear();
        assert!(table.leaders().is_empty());
        assert!(table.parents().is_empty());
        assert!(table.children().is_empty());
    }

    #[test]
    fn test_leader_transports_fallbacks() {
        let leader = NodeContext::new(addr("o://leader", "/t/self"));
        assert_eq!(leader.leader_transports()[0].value, "/t/self");

        let child = NodeContext::new(addr("o://leader/a", "/t/a"))
            .with_leader(addr("o://leader", "/t/leader"));
        assert_eq!(child.leader_transports()[0].value, "/t/leader");

        let orphan = NodeContext::new(addr("o://leader/a", "/t/a"));
        assert!(orphan.leader_transports().is_empty());
        orphan.hierarchy.add_leader(addr("o://leader", "/t/late"));
        assert_eq!(orphan.leader_transports()[0].value, "/t/late");
    }
}
