//! Batch scheduler.
//!
//! Sub-requests are grouped into lanes by (resource, operation kind). Each
//! lane has at most one open window at a time:
//!
//!   Idle → Accumulating → Sealed → Dispatching → Idle
//!
//! Only an accumulating window accepts joiners. A window seals when its timer
//! fires or when it fills up (max batch size or max batch cells); the sealed
//! batch is presented to the quota governor as one aggregated cost and sent
//! upstream as one call.
//!
//! Reads are single-flighted on their epoch-pinned fingerprint: a read whose
//! fingerprint is already pending or in flight attaches as a waiter to the
//! existing flight instead of joining a window.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::fingerprint::Fingerprint;
use crate::cache::store::Cache;
use crate::config::{BatchConfig, UpstreamConfig};
use crate::dispatch::quota::{Cost, Priority, QuotaGovernor};
use crate::dispatch::window::WindowController;
use crate::dispatch::OperationKind;
use crate::error::EngineError;
use crate::metrics::MetricsSink;
use crate::upstream::{ChunkRead, ChunkWrite, RangeData, SharedAccessor, UpstreamError, ESTIMATED_CELL_BYTES};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaneKey {
    pub resource_id: String,
    pub kind: OperationKind,
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.kind)
    }
}

#[derive(Debug, Clone)]
pub enum SubRequestBody {
    Read,
    Write(Arc<RangeData>),
}

/// One chunk-sized unit of upstream work.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub fingerprint: Fingerprint,
    pub priority: Priority,
    pub body: SubRequestBody,
}

impl SubRequest {
    /// A read pinned to the resource epoch observed by the caller.
    pub fn read(fingerprint: &Fingerprint, epoch: u64, priority: Priority) -> Self {
        Self {
            fingerprint: fingerprint.at_epoch(epoch),
            priority,
            body: SubRequestBody::Read,
        }
    }

    pub fn write(fingerprint: Fingerprint, values: Arc<RangeData>) -> Self {
        Self {
            fingerprint,
            priority: Priority::Foreground,
            body: SubRequestBody::Write(values),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self.body {
            SubRequestBody::Read => OperationKind::Read,
            SubRequestBody::Write(_) => OperationKind::Write,
        }
    }

    fn cells(&self) -> u64 {
        self.fingerprint.cell_count()
    }

    fn bytes(&self) -> u64 {
        match &self.body {
            SubRequestBody::Read => self.cells() * ESTIMATED_CELL_BYTES,
            SubRequestBody::Write(values) => values.estimated_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutput {
    Values(Arc<RangeData>),
    Written { cells: u64 },
}

pub type ChunkResult = Result<ChunkOutput, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Idle,
    Accumulating,
    Sealed,
    Dispatching,
}

/// Waiters sharing one pending sub-request.
struct Flight {
    lane: LaneKey,
    entry_id: u64,
    foreground: AtomicBool,
    /// `None` once delivered or abandoned; attaching then fails.
    waiters: Mutex<Option<Vec<oneshot::Sender<ChunkResult>>>>,
}

impl Flight {
    fn new(lane: LaneKey, entry_id: u64, priority: Priority, first: oneshot::Sender<ChunkResult>) -> Self {
        Self {
            lane,
            entry_id,
            foreground: AtomicBool::new(priority == Priority::Foreground),
            waiters: Mutex::new(Some(vec![first])),
        }
    }

    /// Hands the sender back when the flight is already retired.
    fn attach(
        &self,
        waiter: oneshot::Sender<ChunkResult>,
        priority: Priority,
    ) -> Result<(), oneshot::Sender<ChunkResult>> {
        let mut waiters = self.waiters.lock();
        match waiters.as_mut() {
            Some(list) => {
                list.push(waiter);
                if priority == Priority::Foreground {
                    self.foreground.store(true, Ordering::Release);
                }
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Retire the flight if every waiter has gone away.
    fn retire_if_abandoned(&self) -> bool {
        let mut waiters = self.waiters.lock();
        let abandoned = waiters
            .as_ref()
            .is_some_and(|list| list.iter().all(oneshot::Sender::is_closed));
        if abandoned {
            *waiters = None;
        }
        abandoned
    }

    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }

    fn deliver(&self, result: ChunkResult) {
        let Some(list) = self.waiters.lock().take() else {
            return;
        };
        for waiter in list {
            // A dropped receiver is a cancelled caller.
            let _ = waiter.send(result.clone());
        }
    }
}

enum Slot {
    /// Joined an existing flight; no window entry of our own.
    Attached(Arc<Flight>),
    Owner(Arc<Flight>),
}

struct PendingEntry {
    request: SubRequest,
    flight: Arc<Flight>,
}

struct PendingBatch {
    generation: u64,
    opened_at: Instant,
    deadline: Instant,
    entries: Vec<PendingEntry>,
    cells: u64,
    bytes: u64,
}

impl PendingBatch {
    fn is_full(&self, max_size: usize, max_cells: u64) -> bool {
        self.entries.len() >= max_size || self.cells >= max_cells
    }
}

struct LaneState {
    generation: u64,
    open: Option<PendingBatch>,
    sealed: usize,
    dispatching: usize,
    controller: WindowController,
}

struct Lane {
    state: Mutex<LaneState>,
}

struct Joined {
    /// Deadline of the window the entry joined, when that window is new and
    /// still open; the caller arms its timer.
    new_window: Option<(u64, Instant)>,
    sealed: Vec<PendingBatch>,
}

impl LaneState {
    fn join(&mut self, entry: PendingEntry, max_size: usize, max_cells: u64) -> Joined {
        let now = Instant::now();
        let mut sealed = Vec::new();

        let cells = entry.request.cells();
        let expired = self.open.as_ref().is_some_and(|b| now >= b.deadline);
        let overflows = self
            .open
            .as_ref()
            .is_some_and(|b| !b.entries.is_empty() && b.cells + cells > max_cells);
        if expired || overflows {
            sealed.extend(self.seal());
        }

        let mut new_window = None;
        if self.open.is_none() {
            self.generation += 1;
            let deadline = now + self.controller.current();
            self.open = Some(PendingBatch {
                generation: self.generation,
                opened_at: now,
                deadline,
                entries: Vec::new(),
                cells: 0,
                bytes: 0,
            });
            new_window = Some((self.generation, deadline));
        }

        let full = match self.open.as_mut() {
            Some(batch) => {
                batch.cells += cells;
                batch.bytes += entry.request.bytes();
                batch.entries.push(entry);
                batch.is_full(max_size, max_cells)
            }
            None => false,
        };
        if full {
            sealed.extend(self.seal());
            new_window = None;
        }

        Joined { new_window, sealed }
    }

    fn seal(&mut self) -> Option<PendingBatch> {
        let batch = self.open.take()?;
        self.sealed += 1;
        Some(batch)
    }

    fn phase(&self) -> BatchPhase {
        if self.open.is_some() {
            BatchPhase::Accumulating
        } else if self.dispatching > 0 {
            BatchPhase::Dispatching
        } else if self.sealed > 0 {
            BatchPhase::Sealed
        } else {
            BatchPhase::Idle
        }
    }
}

pub struct BatchScheduler {
    lanes: DashMap<LaneKey, Arc<Lane>>,
    flights: DashMap<Fingerprint, Arc<Flight>>,
    accessor: SharedAccessor,
    governor: Arc<QuotaGovernor>,
    cache: Arc<Cache>,
    metrics: Arc<dyn MetricsSink>,
    batch: BatchConfig,
    upstream: UpstreamConfig,
    next_entry: AtomicU64,
    upstream_calls: AtomicU64,
    /// Exponentially weighted upstream latency, microseconds. Zero until the
    /// first call completes.
    latency_ewma_us: AtomicU64,
    shutdown: CancellationToken,
}

impl BatchScheduler {
    pub fn new(
        batch: BatchConfig,
        upstream: UpstreamConfig,
        accessor: SharedAccessor,
        governor: Arc<QuotaGovernor>,
        cache: Arc<Cache>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            lanes: DashMap::new(),
            flights: DashMap::new(),
            accessor,
            governor,
            cache,
            metrics,
            batch,
            upstream,
            next_entry: AtomicU64::new(1),
            upstream_calls: AtomicU64::new(0),
            latency_ewma_us: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Submit one sub-request and wait for its outcome.
    ///
    /// Dropping the returned future before the window seals withdraws the
    /// sub-request, unless another caller is waiting on the same flight.
    pub async fn submit(self: &Arc<Self>, request: SubRequest) -> ChunkResult {
        let kind = request.kind();
        let fingerprint = request.fingerprint.clone();
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown {
                op: kind,
                fingerprint: fingerprint.to_string(),
            });
        }

        let lane_key = LaneKey {
            resource_id: fingerprint.resource_id().to_string(),
            kind,
        };
        let (tx, rx) = oneshot::channel();
        let entry_id = self.next_entry.fetch_add(1, Ordering::Relaxed);

        let slot = match request.body {
            SubRequestBody::Read => match self.flights.entry(fingerprint.clone()) {
                Entry::Occupied(mut occupied) => match occupied.get().attach(tx, request.priority) {
                    Ok(()) => Slot::Attached(Arc::clone(occupied.get())),
                    Err(tx) => {
                        let flight = Arc::new(Flight::new(lane_key.clone(), entry_id, request.priority, tx));
                        occupied.insert(Arc::clone(&flight));
                        Slot::Owner(flight)
                    }
                },
                Entry::Vacant(vacant) => {
                    let flight = Arc::new(Flight::new(lane_key.clone(), entry_id, request.priority, tx));
                    vacant.insert(Arc::clone(&flight));
                    Slot::Owner(flight)
                }
            },
            SubRequestBody::Write(_) => {
                Slot::Owner(Arc::new(Flight::new(lane_key.clone(), entry_id, request.priority, tx)))
            }
        };

        let flight = match slot {
            Slot::Attached(flight) => {
                debug!(fingerprint = %fingerprint, "Attached to in-flight read");
                let mut wait = PendingWait::new(self, flight, rx);
                return wait.finish(kind, &fingerprint).await;
            }
            Slot::Owner(flight) => flight,
        };

        let mut wait = PendingWait::new(self, Arc::clone(&flight), rx);
        self.enqueue(lane_key, PendingEntry { request, flight });
        wait.finish(kind, &fingerprint).await
    }

    fn lane(&self, key: &LaneKey) -> Arc<Lane> {
        self.lanes
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Lane {
                    state: Mutex::new(LaneState {
                        generation: 0,
                        open: None,
                        sealed: 0,
                        dispatching: 0,
                        controller: WindowController::new(&self.batch, self.upstream.max_batch_size),
                    }),
                })
            })
            .clone()
    }

    fn enqueue(self: &Arc<Self>, lane_key: LaneKey, entry: PendingEntry) {
        let lane = self.lane(&lane_key);
        let joined = lane.state.lock().join(
            entry,
            self.upstream.max_batch_size,
            self.upstream.max_batch_cells,
        );

        if let Some((generation, deadline)) = joined.new_window {
            let scheduler = Arc::clone(self);
            let key = lane_key.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep_until(deadline) => scheduler.close_window(&key, generation),
                    _ = scheduler.shutdown.cancelled() => {}
                }
            });
        }

        for batch in joined.sealed {
            self.spawn_dispatch(lane_key.clone(), Arc::clone(&lane), batch);
        }
    }

    fn close_window(self: &Arc<Self>, lane_key: &LaneKey, generation: u64) {
        let lane = self.lane(lane_key);
        let sealed = {
            let mut state = lane.state.lock();
            match state.open.as_ref() {
                Some(batch) if batch.generation == generation => state.seal(),
                _ => None,
            }
        };
        if let Some(batch) = sealed {
            self.spawn_dispatch(lane_key.clone(), lane, batch);
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, lane_key: LaneKey, lane: Arc<Lane>, batch: PendingBatch) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.dispatch(lane_key, lane, batch).await;
        });
    }

    /// Take a withdrawn sub-request out of its still-open window.
    fn withdraw(&self, flight: &Arc<Flight>) {
        let Some(lane) = self.lanes.get(&flight.lane).map(|l| Arc::clone(l.value())) else {
            return;
        };

        let removed = {
            let mut state = lane.state.lock();
            let Some(batch) = state.open.as_mut() else {
                return;
            };
            let Some(index) = batch.entries.iter().position(|e| e.flight.entry_id == flight.entry_id) else {
                return;
            };
            if !flight.retire_if_abandoned() {
                return;
            }
            let entry = batch.entries.remove(index);
            batch.cells -= entry.request.cells();
            batch.bytes -= entry.request.bytes();
            entry
        };

        self.flights
            .remove_if(&removed.request.fingerprint, |_, f| Arc::ptr_eq(f, flight));
        debug!(fingerprint = %removed.request.fingerprint, "Withdrew cancelled sub-request");
    }

    async fn dispatch(self: Arc<Self>, lane_key: LaneKey, lane: Arc<Lane>, batch: PendingBatch) {
        {
            let mut state = lane.state.lock();
            state.sealed -= 1;
            state.dispatching += 1;
        }

        let size = batch.entries.len();
        let outcome = if size == 0 {
            None
        } else {
            self.run_batch(&lane_key, batch).await
        };

        let mut state = lane.state.lock();
        state.dispatching -= 1;
        if let Some(latency) = outcome {
            let adjustment = state.controller.observe(size, latency);
            debug!(
                lane = %lane_key,
                size,
                latency_ms = latency.as_millis() as u64,
                window_ms = state.controller.current().as_millis() as u64,
                ?adjustment,
                "Batch dispatched"
            );
        }
    }

    /// Returns the upstream latency when an upstream call was made.
    async fn run_batch(&self, lane_key: &LaneKey, batch: PendingBatch) -> Option<Duration> {
        let kind = lane_key.kind;
        let waited = batch.opened_at.elapsed();
        if waited > self.batch.window_wait_timeout() {
            warn!(lane = %lane_key, waited_ms = waited.as_millis() as u64, "Batch window overran its wait budget");
            self.fail_all(&batch, |fingerprint| EngineError::BatchWindowTimeout {
                op: kind,
                fingerprint,
                waited_ms: waited.as_millis() as u64,
            });
            return None;
        }

        let priority = if batch.entries.iter().any(|e| e.flight.is_foreground()) {
            Priority::Foreground
        } else {
            Priority::Background
        };
        let cost = Cost::call(batch.cells, batch.bytes);
        let permit = match self.governor.acquire(cost, priority).await {
            Ok(permit) => permit,
            Err(rejection) => {
                debug!(lane = %lane_key, size = batch.entries.len(), %rejection, "Batch rejected by quota");
                let reason = rejection.to_string();
                self.fail_all(&batch, |fingerprint| EngineError::QuotaExceeded {
                    op: kind,
                    fingerprint,
                    reason: reason.clone(),
                });
                return None;
            }
        };

        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        self.metrics.batch_dispatched(kind, batch.entries.len());
        let started = Instant::now();
        match kind {
            OperationKind::Write => self.run_writes(lane_key, &batch).await,
            _ => self.run_reads(lane_key, &batch).await,
        }
        let latency = started.elapsed();
        drop(permit);

        self.record_latency(latency);
        Some(latency)
    }

    async fn run_reads(&self, lane_key: &LaneKey, batch: &PendingBatch) {
        let reads: Vec<ChunkRead> = batch
            .entries
            .iter()
            .map(|e| ChunkRead {
                range: e.request.fingerprint.range().clone(),
                render: e.request.fingerprint.render(),
            })
            .collect();

        let call = self.accessor.batch_read(&lane_key.resource_id, &reads);
        let outcomes = match timeout(self.upstream.timeout(), call).await {
            Ok(Ok(results)) => results,
            Ok(Err(err)) => {
                warn!(lane = %lane_key, error = %err, "Batched read failed");
                let message = err.to_string();
                self.fail_all(batch, |fingerprint| EngineError::UpstreamFailure {
                    op: OperationKind::Read,
                    fingerprint,
                    message: message.clone(),
                });
                return;
            }
            Err(_) => {
                let elapsed_ms = self.upstream.timeout_ms;
                self.fail_all(batch, |fingerprint| EngineError::UpstreamTimeout {
                    op: OperationKind::Read,
                    fingerprint,
                    elapsed_ms,
                    retryable: true,
                });
                return;
            }
        };

        let outcomes = pad_outcomes(outcomes, batch.entries.len());
        let any_ok = outcomes.iter().any(Result::is_ok);
        for (entry, outcome) in batch.entries.iter().zip(outcomes) {
            let fingerprint = &entry.request.fingerprint;
            let result = match outcome {
                Ok(data) => {
                    let data = Arc::new(data);
                    let epoch = fingerprint.epoch().unwrap_or_default();
                    self.cache.put(fingerprint, Arc::clone(&data), epoch);
                    Ok(ChunkOutput::Values(data))
                }
                Err(err) => Err(chunk_error(OperationKind::Read, fingerprint, &err, any_ok)),
            };
            entry.flight.deliver(result);
            self.flights
                .remove_if(fingerprint, |_, f| Arc::ptr_eq(f, &entry.flight));
        }
    }

    async fn run_writes(&self, lane_key: &LaneKey, batch: &PendingBatch) {
        let writes: Vec<ChunkWrite> = batch
            .entries
            .iter()
            .filter_map(|e| match &e.request.body {
                SubRequestBody::Write(values) => Some(ChunkWrite {
                    range: e.request.fingerprint.range().clone(),
                    values: Arc::clone(values),
                }),
                SubRequestBody::Read => None,
            })
            .collect();

        let call = self.accessor.batch_write(&lane_key.resource_id, &writes);
        let outcome = timeout(self.upstream.timeout(), call).await;

        // The call may have applied some or all chunks whatever the outcome,
        // so invalidate before any waiter is released.
        let epoch = self.cache.invalidate(&lane_key.resource_id);
        debug!(resource_id = %lane_key.resource_id, epoch, chunks = writes.len(), "Write batch completed");

        let outcomes = match outcome {
            Ok(Ok(results)) => results,
            Ok(Err(err)) => {
                warn!(lane = %lane_key, error = %err, "Batched write failed");
                let message = err.to_string();
                self.fail_all(batch, |fingerprint| EngineError::UpstreamFailure {
                    op: OperationKind::Write,
                    fingerprint,
                    message: message.clone(),
                });
                return;
            }
            Err(_) => {
                let elapsed_ms = self.upstream.timeout_ms;
                self.fail_all(batch, |fingerprint| EngineError::UpstreamTimeout {
                    op: OperationKind::Write,
                    fingerprint,
                    elapsed_ms,
                    retryable: false,
                });
                return;
            }
        };

        let outcomes = pad_outcomes(outcomes, batch.entries.len());
        let any_ok = outcomes.iter().any(Result::is_ok);
        for (entry, outcome) in batch.entries.iter().zip(outcomes) {
            let result = match outcome {
                Ok(cells) => Ok(ChunkOutput::Written { cells }),
                Err(err) => Err(chunk_error(OperationKind::Write, &entry.request.fingerprint, &err, any_ok)),
            };
            entry.flight.deliver(result);
        }
    }

    fn fail_all(&self, batch: &PendingBatch, error: impl Fn(String) -> EngineError) {
        for entry in &batch.entries {
            let fingerprint = &entry.request.fingerprint;
            entry.flight.deliver(Err(error(fingerprint.to_string())));
            self.flights
                .remove_if(fingerprint, |_, f| Arc::ptr_eq(f, &entry.flight));
        }
    }

    fn record_latency(&self, latency: Duration) {
        let sample = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        let _ = self
            .latency_ewma_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some(if old == 0 { sample.max(1) } else { (old * 7 + sample) / 8 })
            });
    }

    /// Expected time for one sub-request submitted now: the lane's current
    /// window plus the smoothed upstream latency. Until a call has completed
    /// the configured cold-start latency stands in for the average.
    pub fn expected_latency(&self, resource_id: &str, kind: OperationKind) -> Duration {
        let upstream = match self.latency_ewma_us.load(Ordering::Relaxed) {
            0 => self.upstream.cold_start_latency(),
            us => Duration::from_micros(us),
        };
        self.current_window(resource_id, kind) + upstream
    }

    pub fn current_window(&self, resource_id: &str, kind: OperationKind) -> Duration {
        let key = LaneKey {
            resource_id: resource_id.to_string(),
            kind,
        };
        match self.lanes.get(&key) {
            Some(lane) => lane.state.lock().controller.current(),
            None => WindowController::new(&self.batch, self.upstream.max_batch_size).current(),
        }
    }

    pub fn phase(&self, resource_id: &str, kind: OperationKind) -> BatchPhase {
        let key = LaneKey {
            resource_id: resource_id.to_string(),
            kind,
        };
        self.lanes
            .get(&key)
            .map(|lane| lane.state.lock().phase())
            .unwrap_or(BatchPhase::Idle)
    }

    /// Upstream batched calls issued so far.
    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }

    /// Reads currently pending or in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Stop accepting work and fail every sub-request still waiting in an
    /// open window. Batches already dispatched run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let lanes: Vec<Arc<Lane>> = self.lanes.iter().map(|l| Arc::clone(l.value())).collect();
        for lane in lanes {
            let open = lane.state.lock().open.take();
            if let Some(batch) = open {
                let kind = batch
                    .entries
                    .first()
                    .map(|e| e.request.kind())
                    .unwrap_or(OperationKind::Read);
                self.fail_all(&batch, |fingerprint| EngineError::Shutdown { op: kind, fingerprint });
            }
        }
    }
}

/// Accessors return one outcome per chunk; a short answer fails the rest.
fn pad_outcomes<T>(mut outcomes: Vec<Result<T, UpstreamError>>, expected: usize) -> Vec<Result<T, UpstreamError>> {
    if outcomes.len() != expected {
        warn!(expected, returned = outcomes.len(), "Accessor returned a mismatched outcome count");
    }
    outcomes.truncate(expected);
    while outcomes.len() < expected {
        outcomes.push(Err(UpstreamError::Transport("no outcome returned for chunk".to_string())));
    }
    outcomes
}

fn chunk_error(op: OperationKind, fingerprint: &Fingerprint, err: &UpstreamError, partial: bool) -> EngineError {
    if partial {
        EngineError::PartialBatchFailure {
            op,
            fingerprint: fingerprint.to_string(),
            message: err.to_string(),
        }
    } else {
        EngineError::UpstreamFailure {
            op,
            fingerprint: fingerprint.to_string(),
            message: err.to_string(),
        }
    }
}

/// Receiving half of a submitted sub-request. Dropping it before the result
/// arrives withdraws the sub-request from its window when nobody else waits.
struct PendingWait<'a> {
    scheduler: &'a BatchScheduler,
    flight: Option<Arc<Flight>>,
    rx: Option<oneshot::Receiver<ChunkResult>>,
}

impl<'a> PendingWait<'a> {
    fn new(scheduler: &'a BatchScheduler, flight: Arc<Flight>, rx: oneshot::Receiver<ChunkResult>) -> Self {
        Self {
            scheduler,
            flight: Some(flight),
            rx: Some(rx),
        }
    }

    async fn finish(&mut self, op: OperationKind, fingerprint: &Fingerprint) -> ChunkResult {
        let shutdown = || EngineError::Shutdown {
            op,
            fingerprint: fingerprint.to_string(),
        };
        let Some(rx) = self.rx.as_mut() else {
            return Err(shutdown());
        };
        let received = rx.await;
        self.rx = None;
        self.flight = None;
        received.unwrap_or_else(|_| Err(shutdown()))
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        // Close our receiver first so the flight sees this waiter as gone.
        drop(self.rx.take());
        if let Some(flight) = self.flight.take() {
            self.scheduler.withdraw(&flight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::{key, RenderOption};

    fn lane_state() -> LaneState {
        LaneState {
            generation: 0,
            open: None,
            sealed: 0,
            dispatching: 0,
            controller: WindowController::new(&BatchConfig::default(), 3),
        }
    }

    fn entry(range: &str, id: u64) -> (PendingEntry, oneshot::Receiver<ChunkResult>) {
        let fingerprint = key("book", range, RenderOption::default()).unwrap();
        let request = SubRequest::read(&fingerprint, 0, Priority::Foreground);
        let lane = LaneKey {
            resource_id: "book".into(),
            kind: OperationKind::Read,
        };
        let (tx, rx) = oneshot::channel();
        let flight = Arc::new(Flight::new(lane, id, Priority::Foreground, tx));
        (PendingEntry { request, flight }, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_joiner_opens_window() {
        let mut state = lane_state();
        let (e, _rx) = entry("A1:B2", 1);
        let joined = state.join(e, 3, 1_000);
        assert!(joined.sealed.is_empty());
        let (generation, deadline) = joined.new_window.unwrap();
        assert_eq!(generation, 1);
        assert_eq!(deadline, Instant::now() + Duration::from_millis(10));
        assert_eq!(state.phase(), BatchPhase::Accumulating);

        let (e, _rx2) = entry("C1:D2", 2);
        let joined = state.join(e, 3, 1_000);
        assert!(joined.new_window.is_none());
        assert_eq!(state.open.as_ref().unwrap().entries.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_seals_early() {
        let mut state = lane_state();
        let mut receivers = Vec::new();
        let mut sealed = Vec::new();
        for (i, range) in ["A1", "A2", "A3"].iter().enumerate() {
            let (e, rx) = entry(range, i as u64);
            receivers.push(rx);
            sealed.extend(state.join(e, 3, 1_000).sealed);
        }
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].entries.len(), 3);
        assert_eq!(state.phase(), BatchPhase::Sealed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cell_overflow_seals_before_joining() {
        let mut state = lane_state();
        let (a, _ra) = entry("A1:A600", 1);
        let (b, _rb) = entry("B1:B600", 2);
        assert!(state.join(a, 10, 1_000).sealed.is_empty());
        let joined = state.join(b, 10, 1_000);
        assert_eq!(joined.sealed.len(), 1);
        assert_eq!(joined.new_window.map(|(g, _)| g), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_window_is_not_joined() {
        let mut state = lane_state();
        let (a, _ra) = entry("A1", 1);
        state.join(a, 10, 1_000);
        tokio::time::advance(Duration::from_millis(11)).await;
        let (b, _rb) = entry("A2", 2);
        let joined = state.join(b, 10, 1_000);
        assert_eq!(joined.sealed.len(), 1);
        assert_eq!(joined.sealed[0].generation, 1);
        assert_eq!(state.open.as_ref().unwrap().generation, 2);
    }

    #[test]
    fn test_flight_retires_only_when_every_waiter_left() {
        let (e, rx) = entry("A1", 1);
        let (tx2, rx2) = oneshot::channel();
        e.flight.attach(tx2, Priority::Background).unwrap();

        drop(rx);
        assert!(!e.flight.retire_if_abandoned());
        drop(rx2);
        assert!(e.flight.retire_if_abandoned());

        let (tx3, _rx3) = oneshot::channel();
        assert!(e.flight.attach(tx3, Priority::Foreground).is_err());
    }

    #[test]
    fn test_background_flight_promoted_by_foreground_waiter() {
        let lane = LaneKey {
            resource_id: "book".into(),
            kind: OperationKind::Read,
        };
        let (tx, _rx) = oneshot::channel();
        let flight = Flight::new(lane, 1, Priority::Background, tx);
        assert!(!flight.is_foreground());
        let (tx2, _rx2) = oneshot::channel();
        flight.attach(tx2, Priority::Foreground).unwrap();
        assert!(flight.is_foreground());
    }
}
