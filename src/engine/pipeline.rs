//! The shared fetch path used by foreground reads and background prefetch.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::time::timeout;
use tracing::debug;

use crate::cache::fingerprint::{Fingerprint, RenderOption};
use crate::cache::store::Cache;
use crate::config::Config;
use crate::dispatch::batcher::{BatchScheduler, ChunkOutput, SubRequest};
use crate::dispatch::quota::{Cost, Priority, QuotaGovernor};
use crate::dispatch::OperationKind;
use crate::error::EngineError;
use crate::range::CellRange;
use crate::upstream::{RangeData, ResourceMetadata, SharedAccessor, ESTIMATED_CELL_BYTES};

/// Data assembled from a range's chunks.
#[derive(Debug, Clone)]
pub struct FetchedRange {
    pub data: RangeData,
    /// Every chunk was served from cache.
    pub cache_hit: bool,
}

pub struct Pipeline {
    pub(crate) config: Arc<Config>,
    pub(crate) cache: Arc<Cache>,
    pub(crate) governor: Arc<QuotaGovernor>,
    pub(crate) batcher: Arc<BatchScheduler>,
    pub(crate) accessor: SharedAccessor,
}

impl Pipeline {
    /// Fetch `chunks` of one logical read, in order.
    ///
    /// The resource epoch is captured once, before any cache lookup, so every
    /// chunk is either a cache entry from that epoch or a read pinned to it.
    pub async fn fetch_chunks(
        &self,
        resource_id: &str,
        render: RenderOption,
        chunks: &[CellRange],
        priority: Priority,
    ) -> Result<FetchedRange, EngineError> {
        let epoch = self.cache.epoch(resource_id);

        let parts = try_join_all(chunks.iter().map(|chunk| async move {
            let fingerprint = Fingerprint::new(resource_id, chunk.clone(), render);
            if let Some(entry) = self.cache.get(&fingerprint) {
                return Ok((entry.payload, true));
            }
            match self.batcher.submit(SubRequest::read(&fingerprint, epoch, priority)).await? {
                ChunkOutput::Values(data) => Ok((data, false)),
                ChunkOutput::Written { .. } => Err(EngineError::UpstreamFailure {
                    op: OperationKind::Read,
                    fingerprint: fingerprint.to_string(),
                    message: "read resolved with a write outcome".to_string(),
                }),
            }
        }))
        .await?;

        let cache_hit = parts.iter().all(|(_, hit)| *hit);
        let data = RangeData::concat(parts.iter().map(|(data, _)| data.as_ref()));
        debug!(resource_id, chunks = chunks.len(), cache_hit, rows = data.row_count(), "Range assembled");
        Ok(FetchedRange { data, cache_hit })
    }

    /// Whether every chunk is currently servable from cache.
    pub fn is_cached(&self, resource_id: &str, render: RenderOption, chunks: &[CellRange]) -> bool {
        chunks
            .iter()
            .all(|chunk| self.cache.contains(&Fingerprint::new(resource_id, chunk.clone(), render)))
    }

    /// Fetch resource metadata through the governor.
    pub async fn metadata(&self, context: &Fingerprint) -> Result<ResourceMetadata, EngineError> {
        let op = OperationKind::Metadata;
        let _permit = self
            .governor
            .acquire(Cost::call(0, 0), Priority::Foreground)
            .await
            .map_err(|rejection| EngineError::QuotaExceeded {
                op,
                fingerprint: context.to_string(),
                reason: rejection.to_string(),
            })?;

        let call = self.accessor.metadata(context.resource_id());
        match timeout(self.config.upstream.timeout(), call).await {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(err)) => Err(EngineError::UpstreamFailure {
                op,
                fingerprint: context.to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(EngineError::UpstreamTimeout {
                op,
                fingerprint: context.to_string(),
                elapsed_ms: self.config.upstream.timeout_ms,
                retryable: true,
            }),
        }
    }

    /// Rough duration of an operation needing `chunks` upstream sub-requests
    /// over `cells` cells: quota wait, then one window plus one upstream round
    /// trip per batch wave.
    pub fn estimate(&self, resource_id: &str, kind: OperationKind, chunks: usize, cells: u64) -> Duration {
        if chunks == 0 {
            return Duration::ZERO;
        }
        let waves = chunks.div_ceil(self.config.upstream.max_batch_size.max(1)) as u32;
        let quota = self.governor.estimate_wait(Cost::call(cells, cells * ESTIMATED_CELL_BYTES));
        quota + self.batcher.expected_latency(resource_id, kind) * waves
    }
}
