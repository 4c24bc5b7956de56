//! Metrics reported by the engine.
//!
//! The engine only talks to [`MetricsSink`]. [`PrometheusMetrics`] backs the
//! `/metrics` endpoint; [`NoopMetrics`] is for embedding without a registry.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::dispatch::OperationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    Issued,
    Completed,
    Dropped,
}

impl PrefetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefetchOutcome::Issued => "issued",
            PrefetchOutcome::Completed => "completed",
            PrefetchOutcome::Dropped => "dropped",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn cache_hit(&self);
    fn cache_miss(&self);
    fn cache_evicted(&self, entries: u64);
    fn batch_dispatched(&self, kind: OperationKind, size: usize);
    fn quota_queue_depth(&self, depth: usize);
    fn prefetch(&self, outcome: PrefetchOutcome);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn cache_hit(&self) {}
    fn cache_miss(&self) {}
    fn cache_evicted(&self, _entries: u64) {}
    fn batch_dispatched(&self, _kind: OperationKind, _size: usize) {}
    fn quota_queue_depth(&self, _depth: usize) {}
    fn prefetch(&self, _outcome: PrefetchOutcome) {}
}

#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_evictions: IntCounter,
    batch_size: HistogramVec,
    queue_depth: IntGauge,
    prefetches: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_hits = IntCounter::new("relay_cache_hits_total", "Reads served entirely from cache")?;
        let cache_misses = IntCounter::new("relay_cache_misses_total", "Reads that went upstream")?;
        let cache_evictions = IntCounter::new("relay_cache_evictions_total", "Cache entries evicted for budget")?;
        let batch_size = HistogramVec::new(
            HistogramOpts::new("relay_batch_size", "Sub-requests per dispatched upstream call")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
            &["kind"],
        )?;
        let queue_depth = IntGauge::new("relay_quota_queue_depth", "Calls waiting for quota")?;
        let prefetches = IntCounterVec::new(
            Opts::new("relay_prefetch_total", "Speculative fetches by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(prefetches.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            cache_evictions,
            batch_size,
            queue_depth,
            prefetches,
        })
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    pub fn hits(&self) -> u64 {
        self.cache_hits.get()
    }

    pub fn misses(&self) -> u64 {
        self.cache_misses.get()
    }

    pub fn prefetch_count(&self, outcome: PrefetchOutcome) -> u64 {
        self.prefetches.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn batches_dispatched(&self, kind: OperationKind) -> u64 {
        self.batch_size.with_label_values(&[kind.as_str()]).get_sample_count()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn cache_hit(&self) {
        self.cache_hits.inc();
    }

    fn cache_miss(&self) {
        self.cache_misses.inc();
    }

    fn cache_evicted(&self, entries: u64) {
        self.cache_evictions.inc_by(entries);
    }

    fn batch_dispatched(&self, kind: OperationKind, size: usize) {
        self.batch_size
            .with_label_values(&[kind.as_str()])
            .observe(size as f64);
    }

    fn quota_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    fn prefetch(&self, outcome: PrefetchOutcome) {
        self.prefetches.with_label_values(&[outcome.as_str()]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_reported_values() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.cache_hit();
        metrics.cache_miss();
        metrics.cache_miss();
        metrics.batch_dispatched(OperationKind::Read, 3);
        metrics.prefetch(PrefetchOutcome::Dropped);

        assert_eq!(metrics.hits(), 1);
        assert_eq!(metrics.misses(), 2);
        assert_eq!(metrics.batches_dispatched(OperationKind::Read), 1);
        assert_eq!(metrics.prefetch_count(PrefetchOutcome::Dropped), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("relay_cache_misses_total 2"));
        assert!(text.contains("relay_prefetch_total{outcome=\"dropped\"} 1"));
    }
}
