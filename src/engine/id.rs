//! Identifier allocation for requests and connections.

use std::{
    fmt,
    ops::RangeInclusive,
    sync::atomic::{AtomicU64, Ordering},
};

use rand::Rng;

/// Source of identifiers that are unique among those currently in use.
///
/// `in_use` reports whether a candidate is taken; allocators resolve
/// collisions by probing linearly from their first candidate.
pub trait IdAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, in_use: &dyn Fn(u64) -> bool) -> u64;
}

/// Range used for request ids.
pub const REQUEST_IDS: RangeInclusive<u64> = 1..=1_000_000_000;
/// Range used for connection and engine ids.
pub const CONNECTION_IDS: RangeInclusive<u64> = 1..=10_000_000;

/// Random start within a range, then linear probing with wrap-around.
#[derive(Clone, Debug)]
pub struct RandomIds {
    range: RangeInclusive<u64>,
}

impl RandomIds {
    #[must_use]
    pub fn new(range: RangeInclusive<u64>) -> Self { Self { range } }

    #[must_use]
    pub fn requests() -> Self { Self::new(REQUEST_IDS) }

    #[must_use]
    pub fn connections() -> Self { Self::new(CONNECTION_IDS) }
}

impl IdAllocator for RandomIds {
    fn allocate(&self, in_use: &dyn Fn(u64) -> bool) -> u64 {
        let start = rand::thread_rng().gen_range(self.range.clone());
        probe(start, &self.range, in_use)
    }
}

/// Deterministic ids counting up from 1.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl IdAllocator for SequentialIds {
    fn allocate(&self, in_use: &dyn Fn(u64) -> bool) -> u64 {
        let start = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        probe(start, &(1..=u64::MAX), in_use)
    }
}

fn probe(start: u64, range: &RangeInclusive<u64>, in_use: &dyn Fn(u64) -> bool) -> u64 {
    let mut id = start;
    while in_use(id) {
        id = if id >= *range.end() { *range.start() } else { id + 1 };
        if id == start {
            // Range exhausted.
            break;
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn random_ids_stay_in_range() {
        let ids = RandomIds::new(5..=9);
        for _ in 0..100 {
            let id = ids.allocate(&|_| false);
            assert!((5..=9).contains(&id));
        }
    }

    #[test]
    fn probing_skips_taken_ids_and_wraps() {
        let taken: HashSet<u64> = [8, 9].into_iter().collect();
        assert_eq!(probe(8, &(5..=9), &|id| taken.contains(&id)), 5);
    }

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialIds::default();
        assert_eq!(ids.allocate(&|_| false), 1);
        assert_eq!(ids.allocate(&|id| id == 2), 3);
    }
}
