//! Per-actor vector clocks for causal metadata.
//!
//! The server sequence number is the ordering authority; a vector clock only
//! answers "did A see B before acting". Merge is the component-wise maximum,
//! which is commutative, associative and idempotent, so replaying or
//! reordering deliveries is harmless.
//!
//! Reference: Lamport 1978; Fidge/Mattern 1988 - vector time

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::UserId;

/// Causal relationship between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Equal,
    Before,
    After,
    Concurrent,
}

/// Map of user id → monotonic counter. Missing keys read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<UserId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: &UserId) -> u64 {
        self.counters.get(user).copied().unwrap_or(0)
    }

    /// Bump `user`'s component by one and return the new value.
    pub fn increment(&mut self, user: UserId) -> u64 {
        let counter = self.counters.entry(user).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Component-wise max with `other`. Never decreases any component.
    pub fn merge(&mut self, other: &VectorClock) {
        for (user, &incoming) in &other.counters {
            let local = self.counters.entry(*user).or_insert(0);
            if incoming > *local {
                *local = incoming;
            }
        }
    }

    /// Merged copy, leaving both inputs untouched.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// `true` when every component of `self` is ≤ the matching one in `other`.
    pub fn dominated_by(&self, other: &VectorClock) -> bool {
        self.counters.iter().all(|(user, &c)| c <= other.get(user))
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        match (self.dominated_by(other), other.dominated_by(self)) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|&c| c == 0)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &u64)> {
        self.counters.iter()
    }
}

impl FromIterator<(UserId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (UserId, u64)>>(iter: I) -> Self {
        Self { counters: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn clock(entries: &[(UserId, u64)]) -> VectorClock {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_increment_and_get() {
        let a = Uuid::new_v4();
        let mut c = VectorClock::new();
        assert_eq!(c.get(&a), 0);
        assert_eq!(c.increment(a), 1);
        assert_eq!(c.increment(a), 2);
        assert_eq!(c.get(&a), 2);
    }

    #[test]
    fn test_merge_takes_component_max() {
        let (a, b, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut left = clock(&[(a, 3), (b, 1)]);
        let right = clock(&[(a, 1), (b, 4), (d, 2)]);
        left.merge(&right);
        assert_eq!(left, clock(&[(a, 3), (b, 4), (d, 2)]));
    }

    #[test]
    fn test_merge_is_commutative_associative_idempotent() {
        let (a, b, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let x = clock(&[(a, 2), (b, 0)]);
        let y = clock(&[(b, 5), (d, 1)]);
        let z = clock(&[(a, 7), (d, 3)]);

        assert_eq!(x.merged(&y), y.merged(&x));
        assert_eq!(x.merged(&y).merged(&z), x.merged(&y.merged(&z)));
        assert_eq!(x.merged(&x), x);
        assert_eq!(x.merged(&y).merged(&y), x.merged(&y));
    }

    #[test]
    fn test_two_peer_exchange_converges() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut at_a = clock(&[(a, 0)]);
        let mut at_b = VectorClock::new();

        at_a.increment(a);
        assert_eq!(at_a, clock(&[(a, 1)]));

        at_b.merge(&at_a);
        assert_eq!(at_b.get(&a), 1);

        at_b.increment(b);
        assert_eq!(at_b, clock(&[(a, 1), (b, 1)]));

        at_a.merge(&at_b);
        assert_eq!(at_a, at_b);
    }

    #[test]
    fn test_compare() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let early = clock(&[(a, 1)]);
        let late = clock(&[(a, 1), (b, 1)]);
        let other = clock(&[(a, 2)]);

        assert_eq!(early.compare(&late), CausalOrder::Before);
        assert_eq!(late.compare(&early), CausalOrder::After);
        assert!(late.is_concurrent_with(&other));
        assert_eq!(early.compare(&early.clone()), CausalOrder::Equal);
        assert!(early.happened_before(&late));
    }

    #[test]
    fn test_missing_key_equals_zero() {
        let a = Uuid::new_v4();
        assert_eq!(clock(&[(a, 0)]).compare(&VectorClock::new()), CausalOrder::Equal);
        assert!(clock(&[(a, 0)]).is_empty());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let a = Uuid::new_v4();
        let mut live = VectorClock::new();
        live.increment(a);
        let snapshot = live.clone();
        live.increment(a);
        assert_eq!(snapshot.get(&a), 1);
        assert_eq!(live.get(&a), 2);
    }

    #[test]
    fn test_json_shape_is_flat_map() {
        let a = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let json = serde_json::to_string(&clock(&[(a, 3)])).unwrap();
        assert_eq!(json, r#"{"550e8400-e29b-41d4-a716-446655440000":3}"#);
    }
}
