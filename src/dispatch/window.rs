//! Adaptive batch window.
//!
//! Additive-increase / multiplicative-decrease over the window duration. A
//! window that coalesced a large batch, or saw fast upstream responses, shrinks
//! the next one; a window that produced a small batch, or saw slow responses,
//! grows it. Duration always stays within the configured bounds.

use std::time::Duration;

use crate::config::BatchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAdjustment {
    Shrunk,
    Grown,
    Held,
}

#[derive(Debug, Clone)]
pub struct WindowController {
    current: Duration,
    min: Duration,
    max: Duration,
    step: Duration,
    decrease_factor: f64,
    large_batch: usize,
    small_batch: usize,
    low_latency: Duration,
    high_latency: Duration,
}

impl WindowController {
    pub fn new(config: &BatchConfig, max_batch_size: usize) -> Self {
        let min = Duration::from_millis(config.min_window_ms);
        let max = Duration::from_millis(config.max_window_ms.max(config.min_window_ms));
        let large_batch = ((max_batch_size as f64) * config.large_batch_ratio).ceil() as usize;
        Self {
            current: Duration::from_millis(config.initial_window_ms).clamp(min, max),
            min,
            max,
            step: Duration::from_millis(config.increase_step_ms),
            decrease_factor: config.decrease_factor,
            large_batch: large_batch.max(1),
            small_batch: config.small_batch_size,
            low_latency: Duration::from_millis(config.low_latency_ms),
            high_latency: Duration::from_millis(config.high_latency_ms),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Feed back one dispatched batch.
    ///
    /// Batch size is checked before latency: a near-full batch already gets
    /// no benefit from waiting longer, whatever the latency.
    pub fn observe(&mut self, batch_size: usize, latency: Duration) -> WindowAdjustment {
        let previous = self.current;

        if batch_size >= self.large_batch {
            self.shrink();
        } else if latency >= self.high_latency || batch_size <= self.small_batch {
            self.current = (self.current + self.step).min(self.max);
        } else if latency <= self.low_latency {
            self.shrink();
        }

        match self.current.cmp(&previous) {
            std::cmp::Ordering::Less => WindowAdjustment::Shrunk,
            std::cmp::Ordering::Greater => WindowAdjustment::Grown,
            std::cmp::Ordering::Equal => WindowAdjustment::Held,
        }
    }

    fn shrink(&mut self) {
        self.current = self.current.mul_f64(self.decrease_factor).max(self.min);
    }
}
