//! The engine context.
//!
//! [`Engine`] owns every piece of shared state (cache and epochs, quota
//! buckets, batch lanes, access patterns) for one independent instance. The
//! tool-handler layer builds one per upstream account and calls
//! [`Engine::execute`] per tool call.
//!
//! - [`operation`]: request/response types and the [`Execute`](operation::Execute) trait
//! - [`pipeline`]: the chunk fetch path shared with prefetch
//! - [`heartbeat`]: keepalive progress for long calls

pub mod heartbeat;
pub mod operation;
pub mod pipeline;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::fingerprint::{Fingerprint, RenderOption};
use crate::cache::prefetcher::Prefetcher;
use crate::cache::store::{Cache, CacheStats};
use crate::cache::tracker::AccessTracker;
use crate::config::Config;
use crate::dispatch::batcher::{BatchScheduler, ChunkOutput, SubRequest};
use crate::dispatch::quota::{Priority, QuotaGovernor};
use crate::dispatch::OperationKind;
use crate::error::EngineError;
use crate::metrics::MetricsSink;
use crate::paging::{plan_chunks, rows_per_chunk, total_pages, Cursor, CursorBasis, CursorError};
use crate::range::{CellRange, RangeError};
use crate::upstream::{RangeData, SharedAccessor};

use self::heartbeat::Heartbeat;
use self::operation::{
    BatchReadRequest, BatchReadResponse, CallContext, Execute, Operation, OperationOutput, PageInfo, RangeOutcome,
    ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};
use self::pipeline::Pipeline;

/// Point-in-time view of engine state.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub quota_queue_depth: usize,
    pub upstream_calls: u64,
    pub reads_in_flight: usize,
    pub prefetch_in_flight: usize,
    pub sessions: usize,
}

pub struct Engine {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    tracker: Arc<AccessTracker>,
    prefetcher: Prefetcher,
    heartbeat: Heartbeat,
    metrics: Arc<dyn MetricsSink>,
    maintenance: CancellationToken,
}

impl Engine {
    pub fn new(config: Arc<Config>, accessor: SharedAccessor, metrics: Arc<dyn MetricsSink>) -> Self {
        let cache = Arc::new(Cache::new(config.cache.clone(), Arc::clone(&metrics)));
        let governor = QuotaGovernor::new(&config.quota, Arc::clone(&metrics));
        let batcher = BatchScheduler::new(
            config.batch.clone(),
            config.upstream.clone(),
            Arc::clone(&accessor),
            Arc::clone(&governor),
            Arc::clone(&cache),
            Arc::clone(&metrics),
        );

        let pipeline = Arc::new(Pipeline {
            config: Arc::clone(&config),
            cache,
            governor,
            batcher,
            accessor,
        });

        info!(
            provider_cell_limit = config.upstream.provider_cell_limit,
            max_batch_size = config.upstream.max_batch_size,
            cache_cells = config.cache.max_cells,
            requests_per_minute = config.quota.requests_per_minute,
            prefetch = config.prefetch.enabled,
            "Engine initialized"
        );

        Self {
            tracker: Arc::new(AccessTracker::new(config.prefetch.clone())),
            prefetcher: Prefetcher::new(config.prefetch.clone(), Arc::clone(&metrics)),
            heartbeat: Heartbeat::new(&config.heartbeat),
            pipeline,
            metrics,
            maintenance: CancellationToken::new(),
            config,
        }
    }

    /// Run any tool operation.
    pub async fn execute(&self, operation: Operation, ctx: &CallContext) -> Result<OperationOutput, EngineError> {
        operation.execute(self, ctx).await
    }

    pub async fn read(&self, req: ReadRequest, ctx: &CallContext) -> Result<ReadResponse, EngineError> {
        let op = OperationKind::Read;
        let range = CellRange::parse(&req.range)
            .map_err(|e| EngineError::invalid_range(op, &req.resource_id, &req.range, e))?;
        let fingerprint = Fingerprint::new(&req.resource_id, range, req.render_option);

        if req.page_size.is_none() && req.cursor.is_none() {
            return self.read_whole(&req, &fingerprint, ctx).await;
        }
        self.read_page(&req, &fingerprint, ctx).await
    }

    async fn read_whole(
        &self,
        req: &ReadRequest,
        fingerprint: &Fingerprint,
        ctx: &CallContext,
    ) -> Result<ReadResponse, EngineError> {
        let op = OperationKind::Read;
        let resource_id = fingerprint.resource_id();
        let range = fingerprint.range();
        let chunks = plan_chunks(range, self.config.upstream.provider_cell_limit, range.rows())
            .map_err(|e| EngineError::invalid_range(op, resource_id, &req.range, e))?;

        let expected = self.pipeline.estimate(resource_id, op, chunks.len(), range.cell_count());
        let fetched = self
            .with_heartbeat(
                expected,
                ctx,
                self.pipeline
                    .fetch_chunks(resource_id, fingerprint.render(), &chunks, Priority::Foreground),
            )
            .await?;

        self.after_read(ctx, fingerprint, range, fetched.cache_hit);
        Ok(ReadResponse {
            range: range.to_string(),
            data: fetched.data,
            pagination: None,
            from_cache: fetched.cache_hit,
        })
    }

    async fn read_page(
        &self,
        req: &ReadRequest,
        fingerprint: &Fingerprint,
        ctx: &CallContext,
    ) -> Result<ReadResponse, EngineError> {
        let op = OperationKind::Read;
        let resource_id = fingerprint.resource_id();
        let range = fingerprint.range();
        let invalid = |e: RangeError| EngineError::invalid_range(op, resource_id, &req.range, e);
        let cursor_invalid = |e: CursorError| EngineError::CursorInvalid {
            op,
            fingerprint: fingerprint.to_string(),
            reason: e.to_string(),
        };

        let (page_size, page_index) = match &req.cursor {
            Some(token) => {
                let cursor = Cursor::decode(token).map_err(cursor_invalid)?;
                let page_size = req.page_size.unwrap_or(cursor.page_size);
                let basis = CursorBasis::new(resource_id, range.clone(), page_size);
                (page_size, cursor.verify(&basis).map_err(cursor_invalid)?)
            }
            None => (req.page_size.unwrap_or_default(), 0),
        };
        let limit = self.config.upstream.provider_cell_limit;
        let chunk_rows = rows_per_chunk(range.columns(), limit, page_size).map_err(invalid)?;

        let page_rows = page_size.min(range.rows());
        let expected = self.pipeline.estimate(
            resource_id,
            op,
            page_rows.div_ceil(chunk_rows) as usize + 1,
            u64::from(page_rows) * u64::from(range.columns()),
        );

        let work = async {
            let metadata = self.pipeline.metadata(fingerprint).await?;
            let sheet = metadata.sheet(range.sheet.as_deref()).ok_or_else(|| {
                invalid(RangeError::UnknownSheet(range.sheet.clone().unwrap_or_default()))
            })?;

            let total_rows = range.rows_within(sheet.row_count);
            let total_pages = total_pages(total_rows, page_size);
            if total_pages == 0 && page_index == 0 {
                let info = PageInfo {
                    total_rows: 0,
                    current_page: 0,
                    total_pages: 0,
                    next_cursor: None,
                    prev_cursor: None,
                    has_more: false,
                };
                return Ok((range.clone(), RangeData::default(), info, true));
            }
            if page_index >= total_pages {
                return Err(EngineError::PageOutOfRange {
                    op,
                    fingerprint: fingerprint.to_string(),
                    page: page_index + 1,
                    total_pages,
                });
            }

            // page_index < total_pages, so the offset fits the range.
            let offset = (page_index * u64::from(page_size)) as u32;
            let page_range = range.row_slice(offset, page_size.min(total_rows - offset));
            let chunks = plan_chunks(&page_range, limit, page_size).map_err(invalid)?;
            let fetched = self
                .pipeline
                .fetch_chunks(resource_id, fingerprint.render(), &chunks, Priority::Foreground)
                .await?;

            let basis = CursorBasis::new(resource_id, range.clone(), page_size);
            let has_more = page_index + 1 < total_pages;
            let info = PageInfo {
                total_rows,
                current_page: page_index + 1,
                total_pages,
                next_cursor: has_more.then(|| crate::paging::encode_cursor(page_index + 1, &basis)),
                prev_cursor: (page_index > 0).then(|| crate::paging::encode_cursor(page_index - 1, &basis)),
                has_more,
            };
            Ok((page_range, fetched.data, info, fetched.cache_hit))
        };

        let (page_range, data, info, cache_hit) = self.with_heartbeat(expected, ctx, work).await?;
        debug!(
            fingerprint = %fingerprint,
            page = info.current_page,
            total_pages = info.total_pages,
            cache_hit,
            "Page served"
        );

        self.after_read(ctx, fingerprint, &page_range, cache_hit);
        Ok(ReadResponse {
            range: page_range.to_string(),
            data,
            pagination: Some(info),
            from_cache: cache_hit,
        })
    }

    /// Report the access, then look for something to prefetch after a miss.
    fn after_read(&self, ctx: &CallContext, fingerprint: &Fingerprint, served: &CellRange, cache_hit: bool) {
        let resource_id = fingerprint.resource_id();
        self.tracker.record(&ctx.session_id, resource_id, served);

        if cache_hit {
            self.metrics.cache_hit();
            return;
        }
        self.metrics.cache_miss();

        if self.prefetcher.enabled() {
            let predictions = self.tracker.predict(
                &ctx.session_id,
                resource_id,
                served,
                self.config.prefetch.top_k,
                self.config.prefetch.confidence_threshold,
            );
            if !predictions.is_empty() {
                self.prefetcher
                    .schedule(&self.pipeline, resource_id, fingerprint.render(), predictions);
            }
        }
    }

    pub async fn write(&self, req: WriteRequest, ctx: &CallContext) -> Result<WriteResponse, EngineError> {
        let op = OperationKind::Write;
        let invalid = |e: RangeError| EngineError::invalid_range(op, &req.resource_id, &req.range, e);
        let range = CellRange::parse(&req.range).map_err(invalid)?;

        let payload = RangeData::new(req.payload);
        if payload.row_count() != range.rows() as usize || payload.column_count() > range.columns() as usize {
            return Err(invalid(RangeError::PayloadShape {
                rows: payload.row_count(),
                columns: payload.column_count(),
                expected_rows: range.rows(),
                expected_columns: range.columns(),
            }));
        }

        let chunks = plan_chunks(&range, self.config.upstream.provider_cell_limit, range.rows()).map_err(invalid)?;
        let resource_id = req.resource_id.trim();
        let batcher = &self.pipeline.batcher;

        let submissions = chunks.iter().map(|chunk| {
            let offset = (chunk.start_row - range.start_row) as usize;
            let values = Arc::new(payload.slice_rows(offset, chunk.rows() as usize));
            let fingerprint = Fingerprint::new(resource_id, chunk.clone(), RenderOption::default());
            batcher.submit(SubRequest::write(fingerprint, values))
        });

        let expected = self.pipeline.estimate(resource_id, op, chunks.len(), range.cell_count());
        // Every chunk runs to its outcome; a failed chunk does not cancel the others.
        let outcomes = self.with_heartbeat(expected, ctx, join_all(submissions)).await;

        let mut updated_cells = 0;
        for outcome in outcomes {
            if let ChunkOutput::Written { cells } = outcome? {
                updated_cells += cells;
            }
        }

        info!(resource_id, range = %range, updated_cells, chunks = chunks.len(), "Write applied");
        Ok(WriteResponse {
            updated_range: range.to_string(),
            updated_cells,
            chunks: chunks.len(),
        })
    }

    pub async fn batch_read(&self, req: BatchReadRequest, ctx: &CallContext) -> Result<BatchReadResponse, EngineError> {
        let limit = self.config.upstream.provider_cell_limit;
        let (chunks, cells) = req
            .ranges
            .iter()
            .filter_map(|r| CellRange::parse(r).ok())
            .filter_map(|r| plan_chunks(&r, limit, r.rows()).ok().map(|c| (c.len(), r.cell_count())))
            .fold((0, 0), |(n, c), (dn, dc)| (n + dn, c + dc));
        let expected = self
            .pipeline
            .estimate(req.resource_id.trim(), OperationKind::Read, chunks, cells);

        let inner = ctx.silent();
        let reads = req.ranges.iter().map(|range| {
            let read = ReadRequest::new(&req.resource_id, range).render(req.render_option);
            let inner = &inner;
            async move {
                match self.read(read, inner).await {
                    Ok(resp) => RangeOutcome::Ok {
                        range: resp.range,
                        data: resp.data,
                        from_cache: resp.from_cache,
                    },
                    Err(err) => RangeOutcome::Error {
                        range: range.clone(),
                        error: (&err).into(),
                    },
                }
            }
        });

        let results = self.with_heartbeat(expected, ctx, join_all(reads)).await;
        Ok(BatchReadResponse { results })
    }

    async fn with_heartbeat<T>(&self, expected: Duration, ctx: &CallContext, work: impl Future<Output = T>) -> T {
        let handle = ctx
            .progress
            .as_ref()
            .and_then(|sink| self.heartbeat.start(expected, Arc::clone(sink)));
        let output = work.await;
        if let Some(handle) = handle {
            handle.stop().await;
        }
        output
    }

    /// Periodically purge dead cache entries and idle sessions.
    pub fn spawn_maintenance(&self, every: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(&self.pipeline.cache);
        let tracker = Arc::clone(&self.tracker);
        let token = self.maintenance.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge();
                        let expired = tracker.expire_idle();
                        if purged > 0 || expired > 0 {
                            debug!(purged, expired, "Maintenance pass");
                        }
                    }
                }
            }
        })
    }

    /// Fail waiting sub-requests, cancel prefetch and stop maintenance.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.maintenance.cancel();
        self.pipeline.batcher.shutdown();
        self.prefetcher.shutdown().await;
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.pipeline.cache.stats(),
            quota_queue_depth: self.pipeline.governor.queue_depth(),
            upstream_calls: self.pipeline.batcher.upstream_calls(),
            reads_in_flight: self.pipeline.batcher.in_flight(),
            prefetch_in_flight: self.prefetcher.in_flight(),
            sessions: self.tracker.session_count(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Cache {
        &self.pipeline.cache
    }

    pub fn governor(&self) -> &Arc<QuotaGovernor> {
        &self.pipeline.governor
    }

    pub fn batcher(&self) -> &Arc<BatchScheduler> {
        &self.pipeline.batcher
    }

    pub fn tracker(&self) -> &AccessTracker {
        &self.tracker
    }

    pub fn prefetcher(&self) -> &Prefetcher {
        &self.prefetcher
    }
}
