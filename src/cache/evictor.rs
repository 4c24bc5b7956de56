//! Eviction policy: decides which cache entries to drop when over budget.
//!
//! Ordering, most evictable first:
//! - Entries fetched under a superseded epoch (dead weight)
//! - Least recently accessed
//! - Oldest fetch time, as the tie-break

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::cache::fingerprint::Fingerprint;

/// An eviction candidate with the facts its priority is computed from.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub fingerprint: Fingerprint,
    pub last_access: Instant,
    pub fetched_at: Instant,
    pub cells: u64,
    pub stale: bool,
}

// Greater = evicted first.
impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stale
            .cmp(&other.stale)
            .then_with(|| other.last_access.cmp(&self.last_access))
            .then_with(|| other.fetched_at.cmp(&self.fetched_at))
    }
}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

/// The eviction policy engine.
#[derive(Debug, Default)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Select victims, most evictable first, until at least `cells_to_free`
    /// cells are covered or candidates run out.
    pub fn select_victims(
        &self,
        candidates: impl IntoIterator<Item = EvictionCandidate>,
        cells_to_free: u64,
    ) -> Vec<EvictionCandidate> {
        let mut heap: BinaryHeap<EvictionCandidate> = candidates.into_iter().collect();

        let mut freed = 0;
        let mut victims = Vec::new();
        while freed < cells_to_free {
            let Some(candidate) = heap.pop() else {
                break;
            };
            freed += candidate.cells;
            victims.push(candidate);
        }

        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::key;
    use crate::cache::fingerprint::RenderOption;
    use std::time::Duration;

    fn candidate(range: &str, access_age: u64, fetch_age: u64, stale: bool) -> EvictionCandidate {
        candidate_at(Instant::now() + Duration::from_secs(1000), range, access_age, fetch_age, stale)
    }

    fn candidate_at(now: Instant, range: &str, access_age: u64, fetch_age: u64, stale: bool) -> EvictionCandidate {
        EvictionCandidate {
            fingerprint: key("book", range, RenderOption::default()).unwrap(),
            last_access: now - Duration::from_secs(access_age),
            fetched_at: now - Duration::from_secs(fetch_age),
            cells: 10,
            stale,
        }
    }

    #[test]
    fn test_least_recently_accessed_first() {
        let victims = Evictor::new().select_victims(
            vec![
                candidate("A1:A10", 5, 50, false),
                candidate("B1:B10", 90, 100, false),
                candidate("C1:C10", 30, 30, false),
            ],
            10,
        );
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].fingerprint.range().to_string(), "B1:B10");
    }

    #[test]
    fn test_fetch_time_breaks_ties() {
        let now = Instant::now() + Duration::from_secs(1000);
        let victims = Evictor::new().select_victims(
            vec![
                candidate_at(now, "A1:A10", 10, 20, false),
                candidate_at(now, "B1:B10", 10, 80, false),
            ],
            10,
        );
        assert_eq!(victims[0].fingerprint.range().to_string(), "B1:B10");
    }

    #[test]
    fn test_stale_entries_go_first() {
        let victims = Evictor::new().select_victims(
            vec![candidate("A1:A10", 500, 500, false), candidate("B1:B10", 0, 0, true)],
            15,
        );
        assert_eq!(victims.len(), 2);
        assert!(victims[0].stale);
    }
}
