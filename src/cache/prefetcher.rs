//! Speculative prefetch of predicted reads.
//!
//! Predictions from the [`AccessTracker`](crate::cache::tracker::AccessTracker)
//! become background fetches through the normal pipeline at
//! [`Priority::Background`]. Each fetch holds a slot of a fixed in-flight
//! budget; when the budget is spent the prediction is dropped. Failures and
//! quota denials are dropped too. Nothing here is ever reported to a caller.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::cache::fingerprint::RenderOption;
use crate::cache::tracker::Prediction;
use crate::config::PrefetchConfig;
use crate::dispatch::quota::Priority;
use crate::engine::pipeline::Pipeline;
use crate::metrics::{MetricsSink, PrefetchOutcome};
use crate::paging::plan_chunks;

pub struct Prefetcher {
    budget: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    metrics: Arc<dyn MetricsSink>,
    config: PrefetchConfig,
}

impl Prefetcher {
    pub fn new(config: PrefetchConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            budget: Arc::new(Semaphore::new(config.max_in_flight)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            metrics,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled && !self.cancel.is_cancelled()
    }

    /// Issue background fetches for `predictions`. Never waits.
    pub fn schedule(
        &self,
        pipeline: &Arc<Pipeline>,
        resource_id: &str,
        render: RenderOption,
        predictions: Vec<Prediction>,
    ) -> usize {
        if !self.enabled() {
            return 0;
        }

        let mut issued = 0;
        for prediction in predictions {
            let limit = pipeline.config.upstream.provider_cell_limit;
            let Ok(chunks) = plan_chunks(&prediction.range, limit, prediction.range.rows()) else {
                continue;
            };
            if pipeline.is_cached(resource_id, render, &chunks) {
                continue;
            }

            let Ok(slot) = Arc::clone(&self.budget).try_acquire_owned() else {
                debug!(range = %prediction.range, "Prefetch budget exhausted");
                self.metrics.prefetch(PrefetchOutcome::Dropped);
                continue;
            };

            self.metrics.prefetch(PrefetchOutcome::Issued);
            issued += 1;
            debug!(
                resource_id,
                range = %prediction.range,
                confidence = prediction.confidence,
                "Prefetch issued"
            );

            let pipeline = Arc::clone(pipeline);
            let metrics = Arc::clone(&self.metrics);
            let cancel = self.cancel.child_token();
            let resource_id = resource_id.to_string();
            self.tasks.spawn(async move {
                let _slot = slot;
                let fetch = pipeline.fetch_chunks(&resource_id, render, &chunks, Priority::Background);
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => PrefetchOutcome::Dropped,
                    result = fetch => match result {
                        Ok(_) => PrefetchOutcome::Completed,
                        Err(err) => {
                            debug!(error = %err, "Prefetch dropped");
                            PrefetchOutcome::Dropped
                        }
                    },
                };
                metrics.prefetch(outcome);
            });
        }
        issued
    }

    /// Background fetches currently holding a budget slot.
    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight.saturating_sub(self.budget.available_permits())
    }

    /// Cancel outstanding fetches and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Wait for currently running fetches without cancelling them.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
