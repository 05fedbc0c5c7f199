//! Configuration management.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::queue::BatchFailurePolicy;
use crate::telemetry::TelemetryConfig;
use crate::work_items::WorkItemStatus;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration (queue backend)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging and metrics configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Task watcher configuration
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Leased status checker configuration
    #[serde(default)]
    pub image_status_checker: ImageStatusCheckerConfig,

    /// Named queues keyed by queue identifier
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,

    /// Long-poll ingress queue configuration
    #[serde(default)]
    pub long_poll: LongPollConfig,

    /// Named queue the task watcher dispatches next tasks to
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    /// Minimum minutes between two attempts of the same next task
    #[serde(default = "default_retry_interval_min")]
    pub retry_interval_min: i32,

    /// Attempts after which a next task is no longer picked up
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Idle sleep when no task is eligible
    #[serde(default = "default_delay_when_no_tasks_ms")]
    pub delay_when_no_tasks_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            retry_interval_min: default_retry_interval_min(),
            max_retries: default_max_retries(),
            delay_when_no_tasks_ms: default_delay_when_no_tasks_ms(),
        }
    }
}

impl TasksConfig {
    pub fn delay_when_no_tasks(&self) -> Duration {
        Duration::from_millis(self.delay_when_no_tasks_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageStatusCheckerConfig {
    /// Period between two runs
    #[serde(default = "default_run_every_minutes")]
    pub run_every_minutes: u64,

    /// Lease window held by the instance that wins a run
    #[serde(default = "default_db_lock_minutes")]
    pub db_lock_minutes: u64,

    /// Lease row identifier
    #[serde(default = "default_lease_id")]
    pub lease_id: String,

    /// Statuses reported as gauges
    #[serde(default = "default_tracked_statuses")]
    pub tracked_statuses: Vec<WorkItemStatus>,
}

impl Default for ImageStatusCheckerConfig {
    fn default() -> Self {
        Self {
            run_every_minutes: default_run_every_minutes(),
            db_lock_minutes: default_db_lock_minutes(),
            lease_id: default_lease_id(),
            tracked_statuses: default_tracked_statuses(),
        }
    }
}

impl ImageStatusCheckerConfig {
    pub fn run_every(&self) -> Duration {
        Duration::from_secs(self.run_every_minutes * 60)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.db_lock_minutes * 60)
    }
}

/// A named queue. Both fields are checked when the endpoint is resolved,
/// so a partially configured queue only fails the calls that use it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfig {
    pub name: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LongPollConfig {
    /// Prefix for the generated long-poll queue and its dead-letter queue
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Consecutive receive failures tolerated when poll retries are enabled
    #[serde(default = "default_max_failed_poll_retries")]
    pub max_failed_poll_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How long a receive waits for messages before returning empty
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Receives after which a message is redriven to the dead-letter queue
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub batch_failure_policy: BatchFailurePolicy,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            region: default_region(),
            max_failed_poll_retries: default_max_failed_poll_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            wait_time_secs: default_wait_time_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            batch_size: default_batch_size(),
            batch_failure_policy: BatchFailurePolicy::default(),
        }
    }
}

impl LongPollConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn queue_name(&self) -> String {
        format!("{}-long-poll", self.name_prefix)
    }

    pub fn dead_letter_queue_name(&self) -> String {
        format!("{}-long-poll-dlq", self.name_prefix)
    }
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_retry_interval_min() -> i32 { 10 }
fn default_max_retries() -> i32 { 5 }
fn default_delay_when_no_tasks_ms() -> u64 { 5000 }
fn default_run_every_minutes() -> u64 { 5 }
fn default_db_lock_minutes() -> u64 { 4 }
fn default_lease_id() -> String { "image_status_checker".to_string() }
fn default_tracked_statuses() -> Vec<WorkItemStatus> { WorkItemStatus::ALL.to_vec() }
fn default_name_prefix() -> String { "docflow".to_string() }
fn default_region() -> String { "local".to_string() }
fn default_max_failed_poll_retries() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_wait_time_secs() -> u64 { 20 }
fn default_visibility_timeout_secs() -> u64 { 30 }
fn default_max_receive_count() -> u32 { 5 }
fn default_batch_size() -> usize { 10 }
fn default_dispatch_queue() -> String { "workflow".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("DOCFLOW").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("DOCFLOW").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
