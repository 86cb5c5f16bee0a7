use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::CircuitBreakerConfig;
use crate::types::SchoolId;

/// Global knobs that tune the integration runtime.
///
/// All fields carry defaults so deployments can override a single section in
/// `hasivu.toml` without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker pool sizing and per-school fairness settings.
    pub queue: QueueConfig,
    /// Priority weights used by the scheduler when rotating buckets.
    pub priority_weights: PriorityWeights,
    /// Retry/backoff policy for queued jobs.
    pub retry: RetryConfig,
    /// Lease defaults (TTL, renewal thresholds, housekeeping cadence).
    pub lease: LeaseConfig,
    /// Defaults applied to pipeline definitions and the cron loop.
    pub pipeline: PipelineDefaults,
    /// Health monitoring and circuit breaker settings for integrations.
    pub integration: IntegrationConfig,
    /// Anomaly detection thresholds.
    pub monitoring: MonitoringConfig,
    /// Capacity of every in-process broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            priority_weights: PriorityWeights::default(),
            retry: RetryConfig::default(),
            lease: LeaseConfig::default(),
            pipeline: PipelineDefaults::default(),
            integration: IntegrationConfig::default(),
            monitoring: MonitoringConfig::default(),
            event_channel_capacity: 1_024,
        }
    }
}

impl OrchestratorConfig {
    pub fn event_capacity(&self) -> usize {
        self.event_channel_capacity.max(16)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Workers spawned per named queue unless the caller asks for a size.
    pub default_workers: usize,
    /// Default maximum in-flight leases allowed per school.
    pub default_school_cap: usize,
    /// Default scheduling weight assigned to schools without overrides.
    pub default_school_weight: u32,
    /// Idle sleep between polls when nothing is ready (ms).
    pub idle_poll_ms: u64,
    /// Longest delay an enqueue may ask for (ms).
    pub max_delay_ms: u64,
    /// Per-school overrides.
    pub school_overrides: HashMap<SchoolId, SchoolQueuePolicy>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_workers: 4,
            default_school_cap: 16,
            default_school_weight: 1,
            idle_poll_ms: 100,
            max_delay_ms: 7 * 24 * 60 * 60 * 1_000,
            school_overrides: HashMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// School-specific overrides for queue fairness.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SchoolQueuePolicy {
    /// Optional in-flight cap; falls back to `default_school_cap` when missing.
    pub max_inflight: Option<usize>,
    /// Optional scheduling weight; falls back to `default_school_weight`.
    pub weight: Option<u32>,
}

/// Lease/heartbeat tuning for worker tasks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Default TTL for job leases (seconds)
    pub lease_ttl_secs: i64,
    /// Renew when remaining TTL drops below this fraction of the original TTL (e.g. 0.5)
    pub renew_at_fraction: f32,
    /// Minimum margin before expiry to trigger a renewal regardless of fraction (ms)
    pub renew_min_margin_ms: u64,
    /// Housekeeping cadence for scanning expired leases (ms)
    pub housekeeper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            renew_at_fraction: 0.5,
            renew_min_margin_ms: 2_000,
            housekeeper_interval_ms: 15_000,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs.max(1))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub p0: u8,
    pub p1: u8,
    pub p2: u8,
    pub p3: u8,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            p0: 8,
            p1: 4,
            p2: 2,
            p3: 1,
        }
    }
}

/// Exponential backoff with deterministic jitter. Shared by queued jobs and
/// pipeline phase retries.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so tiny jobs still randomise a bit.
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Tighter policy used for pipeline phases, where the caller is waiting.
    pub fn pipeline_default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.2,
            jitter_min_ms: 50,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefaults {
    pub batch_size: usize,
    /// Persist a checkpoint after this many loaded batches.
    pub checkpoint_every: u32,
    /// Upper bound on pipeline runs executing at the same time.
    pub max_concurrent_runs: usize,
    /// How often the cron loop wakes up (ms).
    pub scheduler_tick_ms: u64,
    /// Finished runs kept in memory per pipeline.
    pub run_history_limit: usize,
    pub retry: RetryConfig,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            batch_size: 500,
            checkpoint_every: 1,
            max_concurrent_runs: 4,
            scheduler_tick_ms: 30_000,
            run_history_limit: 50,
            retry: RetryConfig::pipeline_default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub health_check_interval_ms: u64,
    /// Upper bound for a single connect/sync call (ms).
    pub operation_timeout_ms: u64,
    /// Reconnect components that report unhealthy during monitoring.
    pub auto_reconnect: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            operation_timeout_ms: 10_000,
            auto_reconnect: true,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl IntegrationConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(10))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Samples needed per (service, metric) before statistics are trusted.
    pub min_samples: usize,
    pub z_score_threshold: f64,
    pub iqr_multiplier: f64,
    /// Deviation from a registered baseline, in standard deviations.
    pub baseline_sigma: f64,
    /// Confidence a single detector needs to raise an alert on its own.
    pub single_method_confidence: f64,
    /// Alerts closer than this are grouped under one primary alert.
    pub correlation_window_secs: u64,
    /// Alerts scoring at or above this are dropped as likely false positives.
    pub false_positive_threshold: f64,
    /// Issued alerts remembered for feedback lookups.
    pub alert_history: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            z_score_threshold: 3.0,
            iqr_multiplier: 1.5,
            baseline_sigma: 2.5,
            single_method_confidence: 0.8,
            correlation_window_secs: 600,
            false_positive_threshold: 0.7,
            alert_history: 1_000,
        }
    }
}

impl MonitoringConfig {
    pub fn correlation_window(&self) -> Duration {
        Duration::from_secs(self.correlation_window_secs)
    }
}
