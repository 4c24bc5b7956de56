//! Quota governance through the engine, under virtual time.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use tabular_relay::config::Config;
use tabular_relay::dispatch::quota::{Cost, Priority, QuotaGovernor};
use tabular_relay::engine::operation::{CallContext, ReadRequest};
use tabular_relay::engine::Engine;
use tabular_relay::error::EngineError;
use tabular_relay::metrics::NoopMetrics;
use tabular_relay::upstream::memory::MemoryAccessor;
use tabular_relay::upstream::SharedAccessor;

fn tight_config() -> Config {
    let mut config = Config::default();
    config.quota.requests_per_minute = 60;
    config.quota.request_burst = 2;
    config.quota.queue_timeout_ms = 200;
    config.prefetch.enabled = false;
    config
}

fn engine(config: Config) -> (Engine, Arc<MemoryAccessor>) {
    let accessor = Arc::new(MemoryAccessor::new());
    accessor.add_generated_sheet("book", "Sheet1", 100, 10);
    accessor.add_generated_sheet("other", "Sheet1", 100, 10);
    let shared: SharedAccessor = accessor.clone();
    (Engine::new(Arc::new(config), shared, Arc::new(NoopMetrics)), accessor)
}

#[tokio::test(start_paused = true)]
async fn test_sustained_overload_fails_with_quota_exceeded() {
    let (engine, accessor) = engine(tight_config());
    let ctx = CallContext::new("s");

    engine.read(ReadRequest::new("book", "A1"), &ctx).await.unwrap();
    engine.read(ReadRequest::new("book", "B1"), &ctx).await.unwrap();

    let started = Instant::now();
    let err = engine.read(ReadRequest::new("book", "C1"), &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::QuotaExceeded { .. }), "got {err}");
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(accessor.read_calls(), 2);

    // The bucket refills at one request per second.
    tokio::time::sleep(Duration::from_secs(2)).await;
    engine.read(ReadRequest::new("book", "C1"), &ctx).await.unwrap();
    assert_eq!(accessor.read_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_batching_fits_many_reads_into_a_small_budget() {
    let (engine, accessor) = engine(tight_config());
    let ctx = CallContext::new("s");

    let ranges: Vec<String> = (1..=50).map(|row| format!("A{row}:J{row}")).collect();
    let results = join_all(ranges.iter().map(|r| engine.read(ReadRequest::new("book", r), &ctx))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(accessor.read_calls(), 1);
    assert_eq!(engine.batcher().upstream_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_serializes_upstream_calls() {
    let mut config = tight_config();
    config.quota.max_concurrent = 1;
    config.quota.queue_timeout_ms = 5_000;
    let (engine, accessor) = engine(config);
    accessor.set_latency(Duration::from_millis(100));
    let ctx = CallContext::new("s");

    let started = Instant::now();
    let (a, b) = tokio::join!(
        engine.read(ReadRequest::new("book", "A1:B2"), &ctx),
        engine.read(ReadRequest::new("other", "A1:B2"), &ctx),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(accessor.read_calls(), 2);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(engine.governor().queue_depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_admitted_volume_stays_within_burst_plus_refill() {
    let mut quota = Config::default().quota;
    quota.requests_per_minute = 60;
    quota.request_burst = 5;
    quota.max_concurrent = 100;
    quota.queue_timeout_ms = 10_000;
    let governor = QuotaGovernor::new(&quota, Arc::new(NoopMetrics));

    let window = Duration::from_secs(10);
    let started = Instant::now();
    let acquirers = (0..40).map(|_| {
        let governor = Arc::clone(&governor);
        tokio::spawn(async move {
            let permit = governor.acquire(Cost::call(1, 1), Priority::Foreground).await.ok()?;
            drop(permit);
            Some(started.elapsed())
        })
    });
    let admitted_at: Vec<Duration> = join_all(acquirers)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap())
        .collect();

    // Capacity plus one request per second of refill.
    let within_window = admitted_at.iter().filter(|at| **at <= window).count();
    assert!(within_window <= 5 + 10, "admitted {within_window}");
    assert!(within_window >= 10, "admitted {within_window}");
    assert!(admitted_at.len() < 40);
}
