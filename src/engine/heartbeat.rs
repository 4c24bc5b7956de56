//! Keepalive heartbeat.
//!
//! Long operations get a background ticker that reports a monotonically
//! increasing counter to the caller's [`ProgressSink`]. The ticker emits under
//! a gate that is also taken to cancel it, so once [`HeartbeatHandle::stop`]
//! returns (or the handle is dropped) no further tick can be observed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::HeartbeatConfig;

/// One liveness signal. Carries nothing but its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSignal {
    pub tick: u64,
}

/// Receives progress signals for one call.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, signal: ProgressSignal);
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    threshold: Duration,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            threshold: config.threshold(),
            interval: config.interval(),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start ticking if `expected` reaches the threshold.
    pub fn start(&self, expected: Duration, sink: Arc<dyn ProgressSink>) -> Option<HeartbeatHandle> {
        if expected < self.threshold {
            return None;
        }

        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));
        let period = self.interval;

        let task = {
            let token = token.clone();
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut tick = 0u64;
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let _gate = gate.lock();
                            if token.is_cancelled() {
                                break;
                            }
                            tick += 1;
                            trace!(tick, "Heartbeat");
                            sink.progress(ProgressSignal { tick });
                        }
                    }
                }
                tick
            })
        };

        Some(HeartbeatHandle {
            token,
            gate,
            task: Some(task),
        })
    }
}

pub struct HeartbeatHandle {
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
    task: Option<JoinHandle<u64>>,
}

impl HeartbeatHandle {
    fn cancel(&self) {
        let _gate = self.gate.lock();
        self.token.cancel();
    }

    /// Stop the ticker and wait for its task. Returns the ticks emitted.
    pub async fn stop(mut self) -> u64 {
        self.cancel();
        match self.task.take() {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Recorder {
        ticks: Mutex<Vec<u64>>,
    }

    impl ProgressSink for Recorder {
        fn progress(&self, signal: ProgressSignal) {
            self.ticks.lock().push(signal.tick);
        }
    }

    fn heartbeat() -> Heartbeat {
        Heartbeat::new(&HeartbeatConfig {
            threshold_ms: 2_000,
            interval_ms: 1_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_operations_get_no_heartbeat() {
        let sink = Arc::new(Recorder::default());
        assert!(heartbeat().start(Duration::from_millis(500), sink).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_sequential_and_stop_is_final() {
        let sink = Arc::new(Recorder::default());
        let handle = heartbeat().start(Duration::from_secs(5), sink.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let emitted = handle.stop().await;
        assert_eq!(emitted, 3);
        assert_eq!(*sink.ticks.lock(), vec![1, 2, 3]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.ticks.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_ticking() {
        struct Counter(AtomicU64);
        impl ProgressSink for Counter {
            fn progress(&self, _signal: ProgressSignal) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let sink = Arc::new(Counter(AtomicU64::new(0)));
        let handle = heartbeat().start(Duration::from_secs(5), sink.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        drop(handle);
        let seen = sink.0.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.0.load(Ordering::SeqCst), seen);
        assert_eq!(seen, 1);
    }
}
