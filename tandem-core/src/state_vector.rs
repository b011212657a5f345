//! Per-replica causal summary.
//!
//! Each entry is the highest counter applied from that replica. Because a
//! replica's operations are integrated strictly in creation order, the entry
//! also means "every counter up to here has been applied".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{OpId, ReplicaId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen from `replica` (0 if none).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Raise the entry for `replica` to `counter`. Never lowers it.
    pub fn observe(&mut self, replica: ReplicaId, counter: u64) {
        let entry = self.clocks.entry(replica).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Whether the operation `id` is reflected in this vector.
    pub fn contains(&self, id: &OpId) -> bool {
        id.replica.is_genesis() || id.counter <= self.get(&id.replica)
    }

    /// True if every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .clocks
            .iter()
            .all(|(replica, counter)| self.get(replica) >= *counter)
    }

    /// Total number of operations summarized.
    pub fn total(&self) -> u64 {
        self.clocks.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clocks.iter()
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_never_decreases() {
        let r = ReplicaId::random();
        let mut sv = StateVector::new();
        sv.observe(r, 5);
        sv.observe(r, 3);
        assert_eq!(sv.get(&r), 5);
        sv.observe(r, 6);
        assert_eq!(sv.get(&r), 6);
    }

    #[test]
    fn test_contains() {
        let r = ReplicaId::random();
        let mut sv = StateVector::new();
        sv.observe(r, 2);
        assert!(sv.contains(&OpId::new(r, 1)));
        assert!(sv.contains(&OpId::new(r, 2)));
        assert!(!sv.contains(&OpId::new(r, 3)));
        assert!(!sv.contains(&OpId::new(ReplicaId::random(), 1)));
        assert!(sv.contains(&OpId::GENESIS));
    }

    #[test]
    fn test_dominates() {
        let a = ReplicaId::random();
        let b = ReplicaId::random();
        let mut big = StateVector::new();
        big.observe(a, 3);
        big.observe(b, 1);
        let mut small = StateVector::new();
        small.observe(a, 2);

        assert!(big.dominates(&small));
        assert!(!small.dominates(&big));
        assert!(big.dominates(&StateVector::new()));
        assert_eq!(big.total(), 4);
        assert_eq!(big.len(), 2);
    }
}
