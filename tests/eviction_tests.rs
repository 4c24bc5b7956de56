//! Integration tests for the eviction policy.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{advance, Instant};

use tabular_relay::cache::evictor::{EvictionCandidate, Evictor};
use tabular_relay::cache::fingerprint::{key, Fingerprint, RenderOption};
use tabular_relay::cache::store::Cache;
use tabular_relay::config::CacheConfig;
use tabular_relay::metrics::NoopMetrics;
use tabular_relay::upstream::RangeData;

fn fp(resource: &str, range: &str) -> Fingerprint {
    key(resource, range, RenderOption::default()).unwrap()
}

/// Ten rows of two cells.
fn block() -> Arc<RangeData> {
    Arc::new(RangeData::new(vec![vec![json!(1), json!(2)]; 10]))
}

fn small_cache() -> Cache {
    Cache::new(
        CacheConfig {
            max_cells: 80,
            low_watermark: 0.75,
            max_age_secs: 3_600,
        },
        Arc::new(NoopMetrics),
    )
}

#[tokio::test(start_paused = true)]
async fn test_recently_read_entries_survive() {
    let cache = small_cache();
    for range in ["A1:B10", "C1:D10", "E1:F10", "G1:H10"] {
        cache.put(&fp("book", range), block(), 0);
        advance(Duration::from_secs(1)).await;
    }
    // Touch the oldest entry.
    assert!(cache.get(&fp("book", "A1:B10")).is_some());
    advance(Duration::from_secs(1)).await;

    cache.put(&fp("book", "I1:J10"), block(), 0);

    assert!(cache.contains(&fp("book", "A1:B10")));
    assert!(!cache.contains(&fp("book", "C1:D10")));
    assert!(!cache.contains(&fp("book", "E1:F10")));
    assert!(cache.contains(&fp("book", "G1:H10")));
    assert!(cache.contains(&fp("book", "I1:J10")));
    assert_eq!(cache.stats().cells, 60);
    assert_eq!(cache.stats().evictions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidated_entries_are_evicted_before_live_ones() {
    let cache = small_cache();
    cache.put(&fp("book", "A1:B10"), block(), 0);
    advance(Duration::from_secs(1)).await;
    cache.put(&fp("book", "C1:D10"), block(), 0);
    advance(Duration::from_secs(1)).await;
    cache.put(&fp("edited", "A1:B10"), block(), 0);
    cache.put(&fp("edited", "C1:D10"), block(), 0);
    cache.invalidate("edited");
    advance(Duration::from_secs(1)).await;

    cache.put(&fp("book", "E1:F10"), block(), 0);

    assert!(cache.contains(&fp("book", "A1:B10")));
    assert!(cache.contains(&fp("book", "C1:D10")));
    assert!(cache.contains(&fp("book", "E1:F10")));
    assert_eq!(cache.len(), 3);
}

#[test]
fn test_selection_stops_once_enough_cells_are_freed() {
    let now = Instant::now();
    let candidates: Vec<EvictionCandidate> = (0..10u64)
        .map(|i| EvictionCandidate {
            fingerprint: fp("book", &format!("A{}:A{}", i + 1, i + 1)),
            last_access: now + Duration::from_secs(i),
            fetched_at: now,
            cells: 25,
            stale: false,
        })
        .collect();

    let victims = Evictor::new().select_victims(candidates, 60);
    assert_eq!(victims.len(), 3);
    let order: Vec<String> = victims.iter().map(|v| v.fingerprint.range().to_string()).collect();
    assert_eq!(order, vec!["A1:A1", "A2:A2", "A3:A3"]);
}

#[test]
fn test_empty_candidate_set() {
    let victims = Evictor::new().select_victims(Vec::new(), 100);
    assert!(victims.is_empty());
}
