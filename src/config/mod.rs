//! Configuration parsing and validation.
//!
//! Loaded from a YAML file given on the command line. Every duration is a
//! plain `*_secs` integer. Validation failures are configuration errors
//! and exit the process with code 2 before any queue subscription is
//! opened.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, EmptyQueueSnafu, ReadFileSnafu, YamlParseSnafu};
use crate::storage::StorageFolder;

/// AWS regions the loader can be pointed at.
const KNOWN_REGIONS: [&str; 17] = [
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "af-south-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-south-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ca-central-1",
    "eu-central-1",
    "eu-north-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "sa-east-1",
];

/// Main configuration structure for the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// AWS region of the queue and the batch bucket.
    pub region: String,

    /// Folder holding jsonpaths files for legacy JSON shredded types.
    #[serde(default)]
    pub jsonpaths: Option<StorageFolder>,

    /// Queue the shredder announces finished batches on.
    pub message_queue: String,

    pub storage: StorageConfig,

    #[serde(default)]
    pub schedules: SchedulesConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub retry_queue: Option<RetryQueueConfig>,

    #[serde(default)]
    pub retries: RetriesConfig,

    #[serde(default)]
    pub ready_check: ReadyCheckConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub feature_flags: FeatureFlags,
}

/// Warehouse connection and dialect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Redshift(RedshiftConfig),
    Snowflake(SnowflakeConfig),
    Databricks(DatabricksConfig),
}

impl StorageConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Redshift(_) => "redshift",
            StorageConfig::Snowflake(_) => "snowflake",
            StorageConfig::Databricks(_) => "databricks",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedshiftConfig {
    pub host: String,
    #[serde(default = "default_redshift_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// IAM role ARN the COPY statements assume.
    pub iam_role: String,
    #[serde(default = "default_max_error")]
    pub max_error: u32,
    /// Load through a sibling transit table and ALTER TABLE APPEND.
    #[serde(default)]
    pub transit_copy: bool,
}

fn default_redshift_port() -> u16 {
    5439
}

fn default_schema() -> String {
    "atomic".to_string()
}

fn default_max_error() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowflakeConfig {
    pub account: String,
    pub warehouse: String,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Storage integration granting the COPY access to the bucket.
    pub storage_integration: String,
    /// SQL gateway the bundled pool connects through.
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabricksConfig {
    #[serde(default = "default_catalog")]
    pub catalog: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// SQL gateway the bundled pool connects through.
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
}

/// Generic SQL-gateway connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

fn default_gateway_port() -> u16 {
    5432
}

fn default_catalog() -> String {
    "hive_metastore".to_string()
}

/// Scheduled behaviors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulesConfig {
    /// Daily windows during which the loader pauses discovery.
    #[serde(default)]
    pub no_operation: Vec<NoOpWindow>,
}

/// One daily pause window, UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoOpWindow {
    pub name: String,
    /// Window start as `HH:MM`.
    pub start: String,
    pub duration_secs: u64,
}

impl NoOpWindow {
    pub fn start_time(&self) -> Option<chrono::NaiveTime> {
        chrono::NaiveTime::parse_from_str(&self.start, "%H:%M").ok()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Outbound monitoring settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Folder-reconciliation monitor; absent disables it.
    #[serde(default)]
    pub folders: Option<FoldersConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub endpoint: String,
    #[serde(default)]
    pub tags: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus endpoint is served (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
    /// Also print per-load KV metrics to stdout.
    #[serde(default)]
    pub stdout: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
            stdout: false,
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Folder monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldersConfig {
    #[serde(default = "default_folders_period")]
    pub period_secs: u64,
    /// Folder the monitor stages its key list under before the COPY.
    pub staging: StorageFolder,
    /// Relative lookback window; prefixes older than this are skipped.
    #[serde(default)]
    pub since_secs: Option<u64>,
    /// Root the shredder writes run folders under.
    pub shredder_output: StorageFolder,
}

fn default_folders_period() -> u64 {
    1800
}

impl FoldersConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn since(&self) -> Option<Duration> {
        self.since_secs.map(Duration::from_secs)
    }
}

/// In-memory retry queue for failed batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueConfig {
    #[serde(default = "default_retry_queue_period")]
    pub period_secs: u64,
    #[serde(default = "default_retry_queue_size")]
    pub size: usize,
    /// Delay between re-injected batches within one flush.
    #[serde(default = "default_retry_queue_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_retry_queue_attempts")]
    pub max_attempts: usize,
}

fn default_retry_queue_period() -> u64 {
    1800
}

fn default_retry_queue_size() -> usize {
    64
}

fn default_retry_queue_interval() -> u64 {
    30
}

fn default_retry_queue_attempts() -> usize {
    3
}

/// Backoff strategy for the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Jitter,
    Fibonacci,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetriesConfig {
    #[serde(default)]
    pub strategy: RetryStrategy,
    #[serde(default = "default_retry_attempts")]
    pub attempts: usize,
    #[serde(default = "default_retry_backoff")]
    pub backoff_secs: u64,
    /// Cap on a single backoff sleep.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Upper bound on total time spent sleeping between attempts.
    #[serde(default)]
    pub cumulative_bound_secs: Option<u64>,
}

impl Default for RetriesConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Jitter,
            attempts: default_retry_attempts(),
            backoff_secs: default_retry_backoff(),
            max_backoff_secs: default_max_backoff(),
            cumulative_bound_secs: None,
        }
    }
}

fn default_max_backoff() -> u64 {
    300
}

fn default_retry_attempts() -> usize {
    5
}

fn default_retry_backoff() -> u64 {
    30
}

/// Warehouse readiness probe run before each load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyCheckConfig {
    #[serde(default = "default_ready_attempts")]
    pub attempts: usize,
    #[serde(default = "default_ready_backoff")]
    pub backoff_secs: u64,
}

impl Default for ReadyCheckConfig {
    fn default() -> Self {
        Self {
            attempts: default_ready_attempts(),
            backoff_secs: default_ready_backoff(),
        }
    }
}

fn default_ready_attempts() -> usize {
    8
}

fn default_ready_backoff() -> u64 {
    15
}

/// Per-operation timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Budget for statements of the load path (COPY can be slow).
    #[serde(default = "default_loading_timeout")]
    pub loading_secs: u64,
    /// Budget for everything else (catalog reads, manifest lookups).
    #[serde(default = "default_non_loading_timeout")]
    pub non_loading_secs: u64,
    /// Queue visibility timeout; the extender must beat this period.
    #[serde(default = "default_visibility_timeout")]
    pub queue_visibility_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            loading_secs: default_loading_timeout(),
            non_loading_secs: default_non_loading_timeout(),
            queue_visibility_secs: default_visibility_timeout(),
        }
    }
}

fn default_loading_timeout() -> u64 {
    3600
}

fn default_non_loading_timeout() -> u64 {
    600
}

fn default_visibility_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Add `load_tstamp` to the events table at startup when missing.
    #[serde(default)]
    pub add_load_tstamp_column: bool,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_str(&content)
    }

    /// Parse and validate configuration from YAML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !KNOWN_REGIONS.contains(&self.region.as_str()) {
            return Err(ConfigError::UnknownRegion {
                region: self.region.clone(),
            });
        }
        ensure!(!self.message_queue.is_empty(), EmptyQueueSnafu);

        for window in &self.schedules.no_operation {
            if window.start_time().is_none() {
                return Err(ConfigError::InvalidWindow {
                    name: window.name.clone(),
                    reason: format!("start {:?} is not HH:MM", window.start),
                });
            }
            if window.duration_secs == 0 {
                return Err(ConfigError::InvalidWindow {
                    name: window.name.clone(),
                    reason: "duration must be positive".to_string(),
                });
            }
        }

        if self.retries.attempts == 0 {
            return Err(ConfigError::InvalidRetries {
                reason: "attempts must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn loading_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.loading_secs)
    }

    pub fn non_loading_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.non_loading_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.queue_visibility_secs)
    }
}
