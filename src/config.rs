//! Runtime configuration for tabular-relay.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All pipeline knobs (provider limits, cache budget, quota buckets, batch
//! window bounds, heartbeat cadence) live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tabular-relay", about = "Batching, caching and quota-governing relay for spreadsheet tool calls")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Workbook seed file for the in-process accessor (JSON).
    #[arg(short, long)]
    pub workbook: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Provider limits and upstream call budget.
    pub upstream: UpstreamConfig,

    /// Cache budget.
    pub cache: CacheConfig,

    /// Access-pattern tracking and prefetch.
    pub prefetch: PrefetchConfig,

    /// Quota buckets.
    pub quota: QuotaConfig,

    /// Batch window control loop.
    pub batch: BatchConfig,

    /// Keepalive heartbeat.
    pub heartbeat: HeartbeatConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Allow cross-origin requests.
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            permissive_cors: false,
        }
    }
}

/// Limits imposed by the remote API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Maximum cells the provider returns for one range.
    pub provider_cell_limit: u64,

    /// Maximum ranges in one batched call.
    pub max_batch_size: usize,

    /// Maximum cells across all ranges of one batched call.
    pub max_batch_cells: u64,

    /// Upstream call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Assumed round trip before the first upstream call completes.
    pub cold_start_latency_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            provider_cell_limit: 10_000,
            max_batch_size: 100,
            max_batch_cells: 200_000,
            timeout_ms: 30_000,
            cold_start_latency_ms: 2_000,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cold_start_latency(&self) -> Duration {
        Duration::from_millis(self.cold_start_latency_ms)
    }
}

/// Cache budget and freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total cells held across all entries.
    pub max_cells: u64,

    /// Eviction stops once usage drops below this fraction of `max_cells`.
    pub low_watermark: f64,

    /// Entries older than this are treated as misses.
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cells: 2_000_000,
            low_watermark: 0.8,
            max_age_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Access-pattern tracking and prefetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Issue speculative fetches at all.
    pub enabled: bool,

    /// Predictions considered per miss.
    pub top_k: usize,

    /// Minimum share of a shape's transitions a step needs to be prefetched.
    pub confidence_threshold: f64,

    /// Background fetches allowed in flight at once.
    pub max_in_flight: usize,

    /// Multiplier applied to transition weights every decay interval.
    pub decay_factor: f64,

    /// Seconds between decay steps.
    pub decay_interval_secs: u64,

    /// Transitions lighter than this are forgotten.
    pub min_weight: f64,

    /// Sessions idle longer than this are dropped.
    pub session_idle_secs: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 2,
            confidence_threshold: 0.3,
            max_in_flight: 4,
            decay_factor: 0.8,
            decay_interval_secs: 60,
            min_weight: 0.05,
            session_idle_secs: 1800,
        }
    }
}

impl PrefetchConfig {
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs.max(1))
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// Remote API quota, one token bucket per dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Sustained upstream calls per minute.
    pub requests_per_minute: u64,

    /// Calls allowed back to back after an idle period.
    pub request_burst: u64,

    /// Sustained cells per minute.
    pub cells_per_minute: u64,

    /// Sustained payload bytes per minute.
    pub bytes_per_minute: u64,

    /// Upstream calls in flight at once.
    pub max_concurrent: u64,

    /// How long a call may wait in the quota queue, in milliseconds.
    pub queue_timeout_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 300,
            request_burst: 60,
            cells_per_minute: 5_000_000,
            bytes_per_minute: 64 * 1024 * 1024,
            max_concurrent: 8,
            queue_timeout_ms: 10_000,
        }
    }
}

impl QuotaConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Bounds and gains of the adaptive batch window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub initial_window_ms: u64,
    pub min_window_ms: u64,
    pub max_window_ms: u64,

    /// Additive growth per small or slow batch.
    pub increase_step_ms: u64,

    /// Multiplicative shrink per large or fast batch.
    pub decrease_factor: f64,

    /// A batch at least this fraction of `max_batch_size` counts as large.
    pub large_batch_ratio: f64,

    /// A batch this size or smaller counts as small.
    pub small_batch_size: usize,

    /// Upstream latency at or under this counts as low.
    pub low_latency_ms: u64,

    /// Upstream latency at or over this counts as elevated.
    pub high_latency_ms: u64,

    /// Longest a sub-request may wait for its window to be sealed.
    pub window_wait_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial_window_ms: 10,
            min_window_ms: 2,
            max_window_ms: 50,
            increase_step_ms: 2,
            decrease_factor: 0.5,
            large_batch_ratio: 0.8,
            small_batch_size: 2,
            low_latency_ms: 100,
            high_latency_ms: 1_000,
            window_wait_timeout_ms: 5_000,
        }
    }
}

impl BatchConfig {
    pub fn window_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.window_wait_timeout_ms)
    }
}

/// Keepalive heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Operations expected to take at least this long get a heartbeat.
    pub threshold_ms: u64,

    /// Interval between progress signals.
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            threshold_ms: 2_000,
            interval_ms: 1_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.upstream.provider_cell_limit > 0, "upstream.provider_cell_limit must be positive");
        anyhow::ensure!(self.upstream.max_batch_size > 0, "upstream.max_batch_size must be positive");
        anyhow::ensure!(
            self.batch.min_window_ms <= self.batch.max_window_ms,
            "batch.min_window_ms ({}) exceeds batch.max_window_ms ({})",
            self.batch.min_window_ms,
            self.batch.max_window_ms
        );
        anyhow::ensure!(
            self.batch.decrease_factor > 0.0 && self.batch.decrease_factor < 1.0,
            "batch.decrease_factor must be in (0, 1)"
        );
        anyhow::ensure!(self.quota.requests_per_minute > 0, "quota.requests_per_minute must be positive");
        anyhow::ensure!(self.quota.request_burst > 0, "quota.request_burst must be positive");
        anyhow::ensure!(self.quota.max_concurrent > 0, "quota.max_concurrent must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.cache.low_watermark),
            "cache.low_watermark must be in [0, 1]"
        );
        anyhow::ensure!(
            self.prefetch.decay_factor > 0.0 && self.prefetch.decay_factor <= 1.0,
            "prefetch.decay_factor must be in (0, 1]"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.upstream.provider_cell_limit, 10_000);
        assert_eq!(cfg.batch.max_window_ms, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"quota": {{"requests_per_minute": 60}}, "server": {{"listen": "127.0.0.1:9000"}}}}"#).unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.quota.requests_per_minute, 60);
        assert_eq!(cfg.quota.max_concurrent, QuotaConfig::default().max_concurrent);
        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
        assert_eq!(cfg.cache.max_cells, CacheConfig::default().max_cells);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/relay.json")).unwrap();
        assert_eq!(cfg.heartbeat.interval_ms, 1_000);
    }

    #[test]
    fn test_cold_start_latency_reaches_heartbeat_threshold() {
        let cfg = Config::default();
        assert!(cfg.upstream.cold_start_latency() >= cfg.heartbeat.threshold());
    }

    #[test]
    fn test_inverted_window_bounds_rejected() {
        let mut cfg = Config::default();
        cfg.batch.min_window_ms = 100;
        cfg.batch.max_window_ms = 10;
        assert!(cfg.validate().is_err());
    }
}
