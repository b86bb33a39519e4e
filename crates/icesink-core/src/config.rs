//! Configuration structures for icesink.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Catalog property holding the S3 region.
pub const PROP_S3_REGION: &str = "s3.region";
/// Catalog property holding the S3 access key id.
pub const PROP_S3_ACCESS_KEY_ID: &str = "s3.access-key-id";
/// Catalog property holding the S3 secret access key.
pub const PROP_S3_SECRET_ACCESS_KEY: &str = "s3.secret-access-key";
/// Catalog property holding a custom S3 endpoint.
pub const PROP_S3_ENDPOINT: &str = "s3.endpoint";
/// Catalog property holding a bearer token for the REST catalog.
pub const PROP_TOKEN: &str = "token";
/// Catalog property naming the warehouse.
pub const PROP_WAREHOUSE: &str = "warehouse";
/// Catalog property holding the Glue catalog id.
pub const PROP_GLUE_CATALOG_ID: &str = "glue.id";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Destination table configuration
    pub destination: DestinationConfig,

    /// Identity of this writer process
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Backoff settings for writes and commits
    #[serde(default)]
    pub retry: RetryConfig,

    /// Shared state store configuration
    #[serde(default)]
    pub state: StateConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Destination catalog and storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DestinationConfig {
    /// Catalog type
    pub catalog_type: CatalogType,

    /// Catalog endpoint URI (required for REST)
    #[serde(default)]
    pub catalog_uri: Option<String>,

    /// Free-form catalog properties
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Namespace used when an event does not name one
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    /// Commit scheduler interval in seconds
    #[serde(default = "default_commit_interval_seconds")]
    pub commit_interval_seconds: u64,

    /// Storage path prefix for data files (S3 URL or local directory)
    pub prefix: String,

    /// Properties attached to every committed snapshot
    #[serde(default)]
    pub snapshot_props: HashMap<String, String>,

    /// Sink mode
    #[serde(default)]
    pub mode: SinkMode,

    /// Parquet compression
    #[serde(default)]
    pub compression: ParquetCompression,
}

impl DestinationConfig {
    /// Commit interval as a duration.
    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_seconds)
    }

    /// Look up a catalog property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }
}

/// Identity of this writer within a transfer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Worker index (0-based)
    #[serde(default)]
    pub index: u32,

    /// Total number of workers
    #[serde(default = "default_worker_count")]
    pub count: u32,

    /// Whether this process holds the main role
    #[serde(default)]
    pub is_main: bool,

    /// Transfer id, used as the state store scope
    #[serde(default = "default_transfer_id")]
    pub transfer_id: String,
}

impl WorkerConfig {
    /// Whether this writer runs the commit scheduler.
    pub fn is_leader(&self) -> bool {
        self.is_main || self.index == 0
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            index: 0,
            count: default_worker_count(),
            is_main: false,
            transfer_id: default_transfer_id(),
        }
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Upper bound on a single delay in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Growth factor between delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Attempt limit (unlimited when absent)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Deadline for one blocking call including its retries, in seconds
    #[serde(default = "default_per_call_timeout_seconds")]
    pub per_call_timeout_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
            per_call_timeout_seconds: default_per_call_timeout_seconds(),
        }
    }
}

/// Shared state store configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StateConfig {
    /// Store implementation
    #[serde(default)]
    pub kind: StateStoreKind,

    /// Location for object-store backed state (defaults to `<prefix>/_icesink_state`)
    #[serde(default)]
    pub path: Option<String>,
}

/// Shared state store implementation.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StateStoreKind {
    /// Process-local map, for single-process runs and tests
    #[default]
    Memory,
    /// JSON objects in object storage, shared across processes
    ObjectStore,
}

/// Catalog type.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CatalogType {
    /// Iceberg REST catalog
    Rest,
    /// AWS Glue catalog
    Glue,
    /// In-process catalog
    Memory,
}

/// Sink mode.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    /// Continuous replication with periodic commits
    #[default]
    Streaming,
    /// One-off table load committed on shard completion
    Snapshot,
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Snappy compression (default, good balance)
    #[default]
    Snappy,
    /// Zstd compression (better ratio)
    Zstd,
    /// LZ4 compression (faster)
    Lz4,
    /// Gzip compression
    Gzip,
    /// No compression
    None,
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive string for an env filter.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_namespace() -> String {
    "default".to_string()
}
fn default_commit_interval_seconds() -> u64 {
    60
}
fn default_worker_count() -> u32 {
    1
}
fn default_transfer_id() -> String {
    "default".to_string()
}
fn default_initial_interval_ms() -> u64 {
    100
}
fn default_max_interval_ms() -> u64 {
    60_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_per_call_timeout_seconds() -> u64 {
    300 // 5 minutes
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a single local writer backed by the in-process catalog.
    pub fn local(prefix: impl Into<String>) -> Self {
        Self {
            destination: DestinationConfig {
                catalog_type: CatalogType::Memory,
                catalog_uri: None,
                properties: HashMap::new(),
                default_namespace: default_namespace(),
                commit_interval_seconds: default_commit_interval_seconds(),
                prefix: prefix.into(),
                snapshot_props: HashMap::new(),
                mode: SinkMode::Streaming,
                compression: ParquetCompression::Snappy,
            },
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            state: StateConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let dest = &self.destination;

        if dest.prefix.is_empty() {
            return Err(crate::Error::Config("Storage prefix is required".into()));
        }

        if dest.commit_interval_seconds == 0 {
            return Err(crate::Error::Config(
                "commit_interval_seconds must be greater than zero".into(),
            ));
        }

        match dest.catalog_type {
            CatalogType::Rest => {
                if dest.catalog_uri.as_deref().map_or(true, str::is_empty) {
                    return Err(crate::Error::Config(
                        "REST catalog requires catalog_uri to be set".into(),
                    ));
                }
            }
            CatalogType::Glue => {
                if dest.property(PROP_S3_REGION).is_none() {
                    return Err(crate::Error::Config(format!(
                        "Glue catalog requires the {} property",
                        PROP_S3_REGION
                    )));
                }
            }
            CatalogType::Memory => {}
        }

        if self.worker.count == 0 || self.worker.index >= self.worker.count {
            return Err(crate::Error::Config(format!(
                "worker index {} is outside worker count {}",
                self.worker.index, self.worker.count
            )));
        }

        if self.retry.multiplier < 1.0 {
            return Err(crate::Error::Config(
                "retry multiplier must be at least 1.0".into(),
            ));
        }

        if self.worker.transfer_id.is_empty() {
            return Err(crate::Error::Config("transfer_id is required".into()));
        }

        if dest.mode == SinkMode::Snapshot && dest.catalog_type == CatalogType::Memory {
            tracing::warn!("Snapshot mode with the memory catalog only commits within this process");
        }

        Ok(())
    }
}
