//! Quota governor.
//!
//! One token bucket per limit dimension. Admission is all-or-nothing across
//! dimensions: either every bucket can cover its share of the cost and all are
//! debited together, or nothing is taken. Rate buckets refill continuously;
//! the concurrency bucket only refills when a [`QuotaPermit`] is dropped.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::QuotaConfig;
use crate::metrics::MetricsSink;

/// Re-check interval while the only shortfall is concurrency, which has no
/// refill schedule to estimate from.
const CONCURRENCY_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Requests,
    Cells,
    Bytes,
    Concurrency,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Requests,
        Dimension::Cells,
        Dimension::Bytes,
        Dimension::Concurrency,
    ];
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Requests => write!(f, "requests"),
            Dimension::Cells => write!(f, "cells"),
            Dimension::Bytes => write!(f, "bytes"),
            Dimension::Concurrency => write!(f, "concurrency"),
        }
    }
}

/// Cost vector of one upstream call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cost {
    pub requests: u64,
    pub cells: u64,
    pub bytes: u64,
    pub concurrent: u64,
}

impl Cost {
    /// A single upstream call moving `cells` cells and about `bytes` bytes.
    pub fn call(cells: u64, bytes: u64) -> Self {
        Self {
            requests: 1,
            cells,
            bytes,
            concurrent: 1,
        }
    }

    fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Requests => self.requests,
            Dimension::Cells => self.cells,
            Dimension::Bytes => self.bytes,
            Dimension::Concurrency => self.concurrent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// A caller is waiting on the result.
    Foreground,
    /// Speculative work; never queues and never competes with queued callers.
    Background,
}

pub enum Admission {
    Granted(QuotaPermit),
    Queued { estimated_wait: Duration },
    Denied { reason: String },
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Granted(_) => write!(f, "Granted"),
            Admission::Queued { estimated_wait } => write!(f, "Queued({estimated_wait:?})"),
            Admission::Denied { reason } => write!(f, "Denied({reason})"),
        }
    }
}

/// Why [`QuotaGovernor::acquire`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaRejection {
    Denied(String),
    TimedOut { waited: Duration },
}

impl fmt::Display for QuotaRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaRejection::Denied(reason) => write!(f, "denied: {reason}"),
            QuotaRejection::TimedOut { waited } => {
                write!(f, "queue wait exceeded {} ms", waited.as_millis())
            }
        }
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    /// Tokens per second. Zero for the concurrency bucket.
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u64, per_minute: u64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_rate: per_minute as f64 / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn covers(&self, amount: u64) -> bool {
        self.tokens >= amount as f64
    }

    /// Time until `amount` tokens are available. `None` when the bucket has
    /// no refill schedule.
    fn wait_for(&self, amount: u64) -> Option<Duration> {
        let missing = amount as f64 - self.tokens;
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(missing / self.refill_rate))
    }
}

#[derive(Debug)]
struct Buckets {
    requests: Bucket,
    cells: Bucket,
    bytes: Bucket,
    concurrency: Bucket,
}

impl Buckets {
    fn get(&self, dimension: Dimension) -> &Bucket {
        match dimension {
            Dimension::Requests => &self.requests,
            Dimension::Cells => &self.cells,
            Dimension::Bytes => &self.bytes,
            Dimension::Concurrency => &self.concurrency,
        }
    }

    fn get_mut(&mut self, dimension: Dimension) -> &mut Bucket {
        match dimension {
            Dimension::Requests => &mut self.requests,
            Dimension::Cells => &mut self.cells,
            Dimension::Bytes => &mut self.bytes,
            Dimension::Concurrency => &mut self.concurrency,
        }
    }

    fn refill(&mut self, now: Instant) {
        for dimension in Dimension::ALL {
            self.get_mut(dimension).refill(now);
        }
    }
}

pub struct QuotaGovernor {
    buckets: Mutex<Buckets>,
    released: Notify,
    queued: AtomicUsize,
    queue_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl QuotaGovernor {
    pub fn new(config: &QuotaConfig, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            buckets: Mutex::new(Buckets {
                requests: Bucket::new(config.request_burst, config.requests_per_minute, now),
                cells: Bucket::new(config.cells_per_minute, config.cells_per_minute, now),
                bytes: Bucket::new(config.bytes_per_minute, config.bytes_per_minute, now),
                concurrency: Bucket::new(config.max_concurrent, 0, now),
            }),
            released: Notify::new(),
            queued: AtomicUsize::new(0),
            queue_timeout: config.queue_timeout(),
            metrics,
        })
    }

    /// Single admission check. Never blocks.
    pub fn admit(self: &Arc<Self>, cost: Cost, priority: Priority) -> Admission {
        let mut buckets = self.buckets.lock();
        buckets.refill(Instant::now());

        for dimension in Dimension::ALL {
            let bucket = buckets.get(dimension);
            let amount = cost.get(dimension);
            if amount as f64 > bucket.capacity {
                return Admission::Denied {
                    reason: format!(
                        "{dimension} cost {amount} exceeds bucket capacity {}",
                        bucket.capacity
                    ),
                };
            }
        }

        if priority == Priority::Background && self.queue_depth() > 0 {
            return Admission::Denied {
                reason: "foreground calls are queued".to_string(),
            };
        }

        let covered = Dimension::ALL
            .iter()
            .all(|&d| buckets.get(d).covers(cost.get(d)));
        if covered {
            for dimension in Dimension::ALL {
                buckets.get_mut(dimension).tokens -= cost.get(dimension) as f64;
            }
            return Admission::Granted(QuotaPermit {
                governor: Arc::clone(self),
                concurrent: cost.concurrent,
            });
        }

        if priority == Priority::Background {
            return Admission::Denied {
                reason: "quota exhausted".to_string(),
            };
        }

        Admission::Queued {
            estimated_wait: Self::estimate(&buckets, cost),
        }
    }

    /// Wait for admission, up to the configured queue timeout.
    pub async fn acquire(self: &Arc<Self>, cost: Cost, priority: Priority) -> Result<QuotaPermit, QuotaRejection> {
        let started = Instant::now();
        let deadline = started + self.queue_timeout;
        let mut in_queue: Option<QueueSlot<'_>> = None;

        loop {
            // Register for release notifications before checking, so a permit
            // dropped between the check and the wait is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let estimated_wait = match self.admit(cost, priority) {
                Admission::Granted(permit) => return Ok(permit),
                Admission::Denied { reason } => {
                    debug!(?cost, %reason, "Quota denied");
                    return Err(QuotaRejection::Denied(reason));
                }
                Admission::Queued { estimated_wait } => estimated_wait,
            };

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                warn!(?cost, waited_ms = waited.as_millis() as u64, "Quota queue wait timed out");
                return Err(QuotaRejection::TimedOut { waited });
            }
            if in_queue.is_none() {
                in_queue = Some(QueueSlot::enter(self));
            }

            let wake = (now + estimated_wait.max(Duration::from_millis(1))).min(deadline);
            tokio::select! {
                _ = &mut released => {}
                _ = sleep_until(wake) => {}
            }
        }
    }

    /// Estimated wait until `cost` could be admitted, ignoring other waiters.
    pub fn estimate_wait(&self, cost: Cost) -> Duration {
        let mut buckets = self.buckets.lock();
        buckets.refill(Instant::now());
        Self::estimate(&buckets, cost)
    }

    /// Tokens currently available along one dimension.
    pub fn available(&self, dimension: Dimension) -> f64 {
        let mut buckets = self.buckets.lock();
        buckets.refill(Instant::now());
        buckets.get(dimension).tokens
    }

    /// Callers currently waiting in [`acquire`](Self::acquire).
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn estimate(buckets: &Buckets, cost: Cost) -> Duration {
        Dimension::ALL
            .iter()
            .map(|&d| {
                buckets
                    .get(d)
                    .wait_for(cost.get(d))
                    .unwrap_or(CONCURRENCY_POLL)
            })
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn release(&self, concurrent: u64) {
        if concurrent > 0 {
            let mut buckets = self.buckets.lock();
            let bucket = buckets.get_mut(Dimension::Concurrency);
            bucket.tokens = (bucket.tokens + concurrent as f64).min(bucket.capacity);
        }
        self.released.notify_waiters();
    }
}

/// Holds the concurrency share of an admitted cost until dropped.
pub struct QuotaPermit {
    governor: Arc<QuotaGovernor>,
    concurrent: u64,
}

impl fmt::Debug for QuotaPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaPermit")
            .field("concurrent", &self.concurrent)
            .finish()
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        self.governor.release(self.concurrent);
    }
}

/// Counts a caller in the queue for as long as it waits.
struct QueueSlot<'a> {
    governor: &'a QuotaGovernor,
}

impl<'a> QueueSlot<'a> {
    fn enter(governor: &'a QuotaGovernor) -> Self {
        let depth = governor.queued.fetch_add(1, Ordering::AcqRel) + 1;
        governor.metrics.quota_queue_depth(depth);
        Self { governor }
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let depth = self.governor.queued.fetch_sub(1, Ordering::AcqRel) - 1;
        self.governor.metrics.quota_queue_depth(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    fn governor(rpm: u64, burst: u64, concurrent: u64, queue_timeout_ms: u64) -> Arc<QuotaGovernor> {
        QuotaGovernor::new(
            &QuotaConfig {
                requests_per_minute: rpm,
                request_burst: burst,
                cells_per_minute: 1_000,
                bytes_per_minute: 1_000_000,
                max_concurrent: concurrent,
                queue_timeout_ms,
            },
            Arc::new(NoopMetrics),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_queue() {
        let gov = governor(60, 2, 10, 5_000);
        let _a = gov.acquire(Cost::call(1, 1), Priority::Foreground).await.unwrap();
        let _b = gov.acquire(Cost::call(1, 1), Priority::Foreground).await.unwrap();

        match gov.admit(Cost::call(1, 1), Priority::Foreground) {
            Admission::Queued { estimated_wait } => {
                assert!(estimated_wait <= Duration::from_secs(1));
                assert!(estimated_wait > Duration::from_millis(900));
            }
            other => panic!("expected queued, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_is_all_or_nothing() {
        let gov = governor(60, 10, 10, 5_000);
        // Cells bucket holds 1000; this call fits requests but not cells.
        let _big = gov.acquire(Cost::call(900, 1), Priority::Foreground).await.unwrap();
        let before = gov.available(Dimension::Requests);
        assert!(matches!(
            gov.admit(Cost::call(200, 1), Priority::Foreground),
            Admission::Queued { .. }
        ));
        assert_eq!(gov.available(Dimension::Requests), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_over_capacity_is_denied() {
        let gov = governor(60, 10, 10, 5_000);
        assert!(matches!(
            gov.admit(Cost::call(5_000, 1), Priority::Foreground),
            Admission::Denied { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_never_queues() {
        let gov = governor(60, 1, 10, 5_000);
        let _a = gov.acquire(Cost::call(1, 1), Priority::Foreground).await.unwrap();
        assert!(matches!(
            gov.admit(Cost::call(1, 1), Priority::Background),
            Admission::Denied { .. }
        ));
        assert!(matches!(
            gov.acquire(Cost::call(1, 1), Priority::Background).await,
            Err(QuotaRejection::Denied(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_times_out() {
        let gov = governor(1, 1, 10, 500);
        let _a = gov.acquire(Cost::call(1, 1), Priority::Foreground).await.unwrap();

        let err = gov.acquire(Cost::call(1, 1), Priority::Foreground).await.unwrap_err();
        match err {
            QuotaRejection::TimedOut { waited } => assert!(waited >= Duration::from_millis(500)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(gov.queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_drop_wakes_concurrency_waiter() {
        let gov = governor(600, 100, 1, 5_000);
        let held = gov.acquire(Cost::call(1, 1), Priority::Foreground).await.unwrap();

        let waiter = {
            let gov = gov.clone();
            tokio::spawn(async move { gov.acquire(Cost::call(1, 1), Priority::Foreground).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gov.queue_depth(), 1);

        drop(held);
        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
        assert_eq!(gov.available(Dimension::Concurrency), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_continuous() {
        let gov = governor(60, 5, 10, 5_000);
        for _ in 0..5 {
            drop(gov.acquire(Cost::call(1, 1), Priority::Foreground).await.unwrap());
        }
        assert!(gov.available(Dimension::Requests) < 1.0);

        tokio::time::advance(Duration::from_millis(2_500)).await;
        let available = gov.available(Dimension::Requests);
        assert!((2.4..=2.6).contains(&available), "available = {available}");
    }
}
