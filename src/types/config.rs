//! Configuration structures.
//!
//! Configuration is loaded from environment variables and config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Default session budgets (0 = unlimited, per spec's convention).
    #[serde(default)]
    pub defaults: DefaultBudgets,

    /// Worker process configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Pool manager configuration (HQ-side).
    #[serde(default)]
    pub pool: PoolConfig,

    /// Tool executor configuration.
    #[serde(default)]
    pub tools: ToolConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,

    /// OTLP exporter endpoint (optional).
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
        }
    }
}

/// Default session budgets, used when an objective does not set its own.
/// `0` means unlimited, matching §3's `Session` invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultBudgets {
    pub token_budget: u64,
    pub max_iterations: u32,
    #[serde(with = "humantime_serde")]
    pub max_runtime: Duration,
}

impl Default for DefaultBudgets {
    fn default() -> Self {
        Self {
            token_budget: 0,
            max_iterations: 0,
            max_runtime: Duration::from_secs(0),
        }
    }
}

/// Worker-local configuration (the per-process §4.3/§4.4 knobs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Root directory under which `<worker_id>/worker.db`,
    /// `<worker_id>/master.key`, and `<worker_id>/projects/` live.
    pub data_dir: String,

    /// How often the activity recorder's sync loop wakes and flushes.
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Ralph checkpoints every N iterations.
    pub checkpoint_interval: u32,

    /// How often the worker sends an unsolicited `heartbeat`.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            sync_interval: Duration::from_secs(30),
            checkpoint_interval: 5,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Pool manager configuration (§4.8, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Bound on the inbound dispatch queue.
    pub dispatch_queue_capacity: usize,

    /// Health loop tick interval.
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// A running worker with no heartbeat/activity in this long is stalled.
    #[serde(with = "humantime_serde")]
    pub stalled_threshold: Duration,

    /// Bound on each per-worker event forwarding channel.
    pub event_channel_capacity: usize,

    /// Grace period after `shutdown` before force-killing a worker.
    #[serde(with = "humantime_serde")]
    pub worker_stop_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dispatch_queue_capacity: 100,
            health_check_interval: Duration::from_secs(10),
            stalled_threshold: Duration::from_secs(60),
            event_channel_capacity: 100,
            worker_stop_grace: Duration::from_secs(10),
        }
    }
}

/// Tool executor configuration (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Hard cap on `bash` execution time, shared across the catalog's shell
    /// tools and split per-subcommand for the quality gate.
    #[serde(with = "humantime_serde")]
    pub bash_timeout: Duration,

    /// Large-output spill threshold in characters.
    pub spill_threshold_chars: usize,

    /// Preview length kept in-band when an output is spilled.
    pub spill_preview_chars: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            bash_timeout: Duration::from_secs(300),
            spill_threshold_chars: 200_000,
            spill_preview_chars: 1000,
        }
    }
}
