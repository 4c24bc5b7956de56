//! Range cache with epoch-based invalidation.
//!
//! The cache is the coordinator for fetched data. It:
//! - Stores payloads keyed by epoch-free fingerprints
//! - Owns the per-resource write epochs
//! - Refuses to serve entries fetched under an older epoch or past their age
//! - Evicts toward the low watermark once the cell budget is exceeded
//!
//! Entries and epochs live in sharded maps, so lookups on unrelated resources
//! never contend on one lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::evictor::{EvictionCandidate, Evictor};
use crate::cache::fingerprint::Fingerprint;
use crate::config::CacheConfig;
use crate::metrics::MetricsSink;
use crate::upstream::RangeData;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Arc<RangeData>,
    pub fetched_at: Instant,
    pub last_access: Instant,
    pub cells: u64,
    pub epoch: u64,
}

/// Usage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub cells: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.cells as f64 / self.capacity as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

pub struct Cache {
    entries: DashMap<Fingerprint, CacheEntry>,
    epochs: DashMap<String, u64>,
    cells: AtomicU64,
    evictor: Evictor,
    evicting: Mutex<()>,
    counters: Counters,
    metrics: Arc<dyn MetricsSink>,
    config: CacheConfig,
}

impl Cache {
    pub fn new(config: CacheConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            entries: DashMap::new(),
            epochs: DashMap::new(),
            cells: AtomicU64::new(0),
            evictor: Evictor::new(),
            evicting: Mutex::new(()),
            counters: Counters::default(),
            metrics,
            config,
        }
    }

    /// Current write epoch of a resource. Resources never written are at 0.
    pub fn epoch(&self, resource_id: &str) -> u64 {
        self.epochs.get(resource_id).map(|e| *e).unwrap_or(0)
    }

    /// Look up a fingerprint. Any epoch on `fingerprint` is ignored; freshness
    /// is judged against the resource's current epoch.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let key = fingerprint.base();
        let current = self.epoch(fingerprint.resource_id());
        let now = Instant::now();

        let found = match self.entries.get_mut(&key) {
            Some(mut entry) if self.is_servable(&entry, current, now) => {
                entry.last_access = now;
                Some(entry.clone())
            }
            Some(_) => None,
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match found {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.remove_if_unservable(&key, current, now);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether `get` would hit, without touching counters or access times.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let current = self.epoch(fingerprint.resource_id());
        self.entries
            .get(&fingerprint.base())
            .is_some_and(|entry| self.is_servable(&entry, current, Instant::now()))
    }

    /// Store a payload fetched under `epoch`. Returns false when the payload
    /// was not stored: its epoch is already superseded, or it alone exceeds
    /// the budget.
    pub fn put(&self, fingerprint: &Fingerprint, payload: Arc<RangeData>, epoch: u64) -> bool {
        let current = self.epoch(fingerprint.resource_id());
        if epoch < current {
            debug!(fingerprint = %fingerprint, epoch, current, "Dropping payload from superseded epoch");
            return false;
        }

        let cells = payload.cell_count();
        if cells > self.config.max_cells {
            return false;
        }

        let now = Instant::now();
        let entry = CacheEntry {
            payload,
            fetched_at: now,
            last_access: now,
            cells,
            epoch,
        };
        if let Some(old) = self.entries.insert(fingerprint.base(), entry) {
            self.cells.fetch_sub(old.cells, Ordering::Relaxed);
        }
        let total = self.cells.fetch_add(cells, Ordering::Relaxed) + cells;

        if total > self.config.max_cells {
            self.evict_to_watermark();
        }
        true
    }

    /// Bump the resource's epoch, logically evicting every entry under it.
    /// Returns the new epoch.
    pub fn invalidate(&self, resource_id: &str) -> u64 {
        let mut epoch = self.epochs.entry(resource_id.to_string()).or_insert(0);
        *epoch += 1;
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(resource_id, epoch = *epoch, "Invalidated resource");
        *epoch
    }

    /// Physically remove stale and expired entries. Returns how many went.
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let keep = self.is_servable(entry, self.epoch(key.resource_id()), now);
            if !keep {
                self.cells.fetch_sub(entry.cells, Ordering::Relaxed);
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            cells: self.cells.load(Ordering::Relaxed),
            capacity: self.config.max_cells,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_servable(&self, entry: &CacheEntry, current_epoch: u64, now: Instant) -> bool {
        entry.epoch >= current_epoch && now.duration_since(entry.fetched_at) <= self.config.max_age()
    }

    fn remove_if_unservable(&self, key: &Fingerprint, current_epoch: u64, now: Instant) {
        let removed = self
            .entries
            .remove_if(key, |_, entry| !self.is_servable(entry, current_epoch, now));
        if let Some((_, entry)) = removed {
            self.cells.fetch_sub(entry.cells, Ordering::Relaxed);
        }
    }

    /// Run one eviction round down to the low watermark. Only one round runs
    /// at a time; concurrent callers skip.
    fn evict_to_watermark(&self) {
        let Some(_round) = self.evicting.try_lock() else {
            return;
        };

        let used = self.cells.load(Ordering::Relaxed);
        let target = (self.config.low_watermark * self.config.max_cells as f64) as u64;
        let excess = used.saturating_sub(target);
        if excess == 0 {
            return;
        }

        let now = Instant::now();
        let candidates: Vec<EvictionCandidate> = self
            .entries
            .iter()
            .map(|item| EvictionCandidate {
                fingerprint: item.key().clone(),
                last_access: item.last_access,
                fetched_at: item.fetched_at,
                cells: item.cells,
                stale: !self.is_servable(item.value(), self.epoch(item.key().resource_id()), now),
            })
            .collect();

        let victims = self.evictor.select_victims(candidates, excess);

        let mut evicted = 0u64;
        for victim in victims {
            if let Some((_, entry)) = self.entries.remove(&victim.fingerprint) {
                self.cells.fetch_sub(entry.cells, Ordering::Relaxed);
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            self.metrics.cache_evicted(evicted);
            info!(
                evicted,
                cells = self.cells.load(Ordering::Relaxed),
                capacity = self.config.max_cells,
                "Eviction round complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::{key, RenderOption};
    use crate::metrics::NoopMetrics;
    use serde_json::json;

    fn cache(max_cells: u64) -> Cache {
        Cache::new(
            CacheConfig {
                max_cells,
                low_watermark: 0.5,
                max_age_secs: 60,
            },
            Arc::new(NoopMetrics),
        )
    }

    fn payload(cells: usize) -> Arc<RangeData> {
        Arc::new(RangeData::new(vec![vec![json!("x"); cells]]))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_counts_hits() {
        let cache = cache(1000);
        let fp = key("book", "A1:C1", RenderOption::default()).unwrap();
        assert!(cache.get(&fp).is_none());

        assert!(cache.put(&fp, payload(3), 0));
        let entry = cache.get(&fp).unwrap();
        assert_eq!(entry.cells, 3);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.cells), (1, 1, 3));
    }

    #[tokio::test]
    async fn test_invalidate_hides_entries_without_enumeration() {
        let cache = cache(1000);
        let fp = key("book", "A1:C1", RenderOption::default()).unwrap();
        let other = key("other", "A1:C1", RenderOption::default()).unwrap();
        cache.put(&fp, payload(3), 0);
        cache.put(&other, payload(3), 0);

        assert_eq!(cache.invalidate("book"), 1);
        assert!(cache.get(&fp).is_none());
        assert!(cache.get(&other).is_some());
        // A fetch that started before the write cannot repopulate.
        assert!(!cache.put(&fp, payload(3), 0));
        assert!(cache.put(&fp, payload(3), 1));
        assert!(cache.get(&fp).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_by_age() {
        let cache = cache(1000);
        let fp = key("book", "A1", RenderOption::default()).unwrap();
        cache.put(&fp, payload(1), 0);

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        assert!(cache.get(&fp).is_none());
        assert_eq!(cache.stats().cells, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_budget_evicts_least_recently_accessed() {
        let cache = cache(100);
        let a = key("book", "A1:A40", RenderOption::default()).unwrap();
        let b = key("book", "B1:B40", RenderOption::default()).unwrap();
        let c = key("book", "C1:C40", RenderOption::default()).unwrap();

        cache.put(&a, payload(40), 0);
        tokio::time::advance(std::time::Duration::from_millis(10)).await;
        cache.put(&b, payload(40), 0);
        tokio::time::advance(std::time::Duration::from_millis(10)).await;
        assert!(cache.get(&a).is_some());

        // 120 cells > 100: evict down to 50, b is the least recently accessed.
        cache.put(&c, payload(40), 0);
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
        assert!(cache.stats().cells <= 100);
        assert!(cache.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn test_purge_removes_stale() {
        let cache = cache(1000);
        let fp = key("book", "A1:C1", RenderOption::default()).unwrap();
        cache.put(&fp, payload(3), 0);
        cache.invalidate("book");
        assert_eq!(cache.purge(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().cells, 0);
    }
}
