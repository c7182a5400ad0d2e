//! Configuration sections, one per hub component.
//!
//! Durations are stored as integer milliseconds/seconds so the TOML stays
//! flat; accessors convert to `Duration`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the log, snapshot and subscription checkpoints
    pub data_dir: PathBuf,
    /// Log partition name; one writer per partition
    pub partition: String,
    /// fsync every write batch before acknowledging it
    pub fsync: bool,
    /// Truncate a final partial record left by a crash instead of refusing to open
    pub repair_torn_tail: bool,
    /// Events younger than this are never compacted
    pub retention_secs: u64,
    /// Capacity of the in-process fan-out channel for live subscribers
    pub notify_capacity: usize,
    /// Directory receiving compacted ranges as JSON lines; disabled when unset
    pub archive_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            partition: "hub".to_string(),
            fsync: true,
            repair_torn_tail: false,
            retention_secs: 7 * 24 * 3600,
            notify_capacity: 1024,
            archive_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.wal", self.partition))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.snapshot.json", self.partition))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.checkpoints.json", self.partition))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued messages per priority level across all destinations
    pub capacity_per_level: usize,
    /// A waiting message gains one priority level per interval
    pub aging_interval_ms: u64,
    /// Messages this close to their deadline jump to the top level
    pub deadline_boost_window_ms: u64,
    /// Dequeues allowed per destination within `quota_window_ms`; unlimited when unset
    pub quota_max_dequeues: Option<u32>,
    pub quota_window_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity_per_level: 10_000,
            aging_interval_ms: 30_000,
            deadline_boost_window_ms: 2_000,
            quota_max_dequeues: None,
            quota_window_ms: 60_000,
        }
    }
}

impl QueueConfig {
    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }

    pub fn deadline_boost_window(&self) -> Duration {
        Duration::from_millis(self.deadline_boost_window_ms)
    }

    pub fn quota_window(&self) -> Duration {
        Duration::from_millis(self.quota_window_ms)
    }
}

/// Instance selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastConnections,
    Weighted,
    Random,
    #[default]
    HealthAware,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expected interval between heartbeats
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before an instance is unhealthy
    pub unhealthy_threshold: u32,
    /// Consecutive heartbeats needed to reinstate an unhealthy instance
    pub healthy_threshold: u32,
    /// Instances silent for this long are removed
    pub purge_after_ms: u64,
    pub default_strategy: SelectionStrategy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            unhealthy_threshold: 3,
            healthy_threshold: 3,
            purge_after_ms: 120_000,
            default_strategy: SelectionStrategy::HealthAware,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn purge_after(&self) -> Duration {
        Duration::from_millis(self.purge_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within `window_ms` that open the circuit
    pub failure_threshold: u32,
    pub window_ms: u64,
    /// Time spent open before a probe is admitted
    pub reset_timeout_ms: u64,
    /// Upper bound for the reset timeout after repeated failed probes
    pub max_reset_timeout_ms: u64,
    /// Growth factor applied to the reset timeout when a probe fails
    pub backoff_multiplier: f64,
    /// Delay handed back to callers while a probe is in flight
    pub probe_wait_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            reset_timeout_ms: 30_000,
            max_reset_timeout_ms: 300_000,
            backoff_multiplier: 2.0,
            probe_wait_ms: 1_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn max_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.max_reset_timeout_ms)
    }

    pub fn probe_wait(&self) -> Duration {
        Duration::from_millis(self.probe_wait_ms)
    }
}

/// Per-message-type overrides of the retry policy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Delays are scaled by a factor in `1 ± jitter_fraction`
    pub jitter_fraction: f64,
    /// Total delivery attempts, including the first
    pub max_attempts: u32,
    /// Keyed by message type
    pub per_type: HashMap<String, RetryOverride>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_fraction: 0.1,
            max_attempts: 5,
            per_type: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Concurrent dispatcher workers draining the priority queues
    pub dispatch_workers: usize,
    /// Upper bound on a single delivery attempt
    pub delivery_timeout_ms: u64,
    /// TTL applied to sends that do not carry one
    pub default_ttl_ms: Option<u64>,
    /// Terminal messages stay queryable for this long
    pub status_retention_secs: u64,
    /// Dispatcher wake-up interval when the queues are empty or quota-limited
    pub idle_poll_ms: u64,
    /// Maximum payload size accepted by send/publish
    pub max_payload_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 4,
            delivery_timeout_ms: 30_000,
            default_ttl_ms: None,
            status_retention_secs: 3600,
            idle_poll_ms: 250,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

impl RouterConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn status_retention(&self) -> Duration {
        Duration::from_secs(self.status_retention_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransactionConfig {
    /// Open transactions older than this are rolled back
    pub timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl TransactionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub snapshot_interval_secs: u64,
    pub compaction_interval_secs: u64,
    pub transaction_sweep_interval_ms: u64,
    pub health_report_interval_secs: u64,
    pub status_cleanup_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 300,
            compaction_interval_secs: 3600,
            transaction_sweep_interval_ms: 1_000,
            health_report_interval_secs: 60,
            status_cleanup_interval_secs: 300,
        }
    }
}

impl LifecycleConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }

    pub fn transaction_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.transaction_sweep_interval_ms)
    }

    pub fn health_report_interval(&self) -> Duration {
        Duration::from_secs(self.health_report_interval_secs)
    }

    pub fn status_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.status_cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".to_string() }
    }
}

/// Push subscription declared in configuration: matching published events are
/// delivered to instances of `service` through the routing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushSubscriptionConfig {
    pub service: String,
    pub patterns: Vec<String>,
}
