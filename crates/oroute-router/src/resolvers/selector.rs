//! Picking one registry candidate out of several.

use crate::registry::RegistryEntry;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses which of several matching registry entries to route to.
pub trait CandidateSelector: Send + Sync {
    fn select<'a>(&self, candidates: &'a [RegistryEntry]) -> Option<&'a RegistryEntry>;
}

/// Always the first (most recently registered) candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstCandidate;

impl CandidateSelector for FirstCandidate {
    fn select<'a>(&self, candidates: &'a [RegistryEntry]) -> Option<&'a RegistryEntry> {
        candidates.first()
    }
}

/// Rotates through candidates across calls.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CandidateSelector for RoundRobin {
    fn select<'a>(&self, candidates: &'a [RegistryEntry]) -> Option<&'a RegistryEntry> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        candidates.get(i % candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<RegistryEntry> {
        (0..n)
            .map(|i| RegistryEntry::new(format!("p{i}"), "o://leader/x"))
            .collect()
    }

    #[test]
    fn test_first_candidate() {
        assert!(FirstCandidate.select(&[]).is_none());
        assert_eq!(FirstCandidate.select(&entries(3)).unwrap().peer_id, "p0");
    }

    #[test]
    fn test_round_robin_rotates() {
        let rr = RoundRobin::new();
        let list = entries(3);
        let picked: Vec<_> = (0..4)
            .map(|_| rr.select(&list).unwrap().peer_id.clone())
            .collect();
        assert_eq!(picked, vec!["p0", "p1", "p2", "p0"]);
        assert!(rr.select(&[]).is_none());
    }
}
