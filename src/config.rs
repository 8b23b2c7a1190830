//! Configuration for the journey analytics service.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the analytics service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Relational source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Snapshot file configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Cache expiry configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Background refresh configuration
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Journey stitching configuration
    #[serde(default)]
    pub journey: JourneyConfig,

    /// HTTP adapter configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Relational source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Postgres connection string (postgres://...).
    /// Driver suffixes such as `postgresql+asyncpg://` are accepted and stripped.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Table holding one row per customer transaction
    #[serde(default = "default_table")]
    pub table: String,

    /// Maximum rows per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            table: default_table(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl SourceConfig {
    /// Connection string with any `+driver` suffix removed from the scheme.
    pub fn connection_string(&self) -> Option<String> {
        self.database_url.as_deref().map(strip_driver_suffix)
    }

    /// Connection string, required before any query is issued.
    pub fn require_connection_string(&self) -> Result<String, ConfigError> {
        self.connection_string()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)
    }
}

/// Snapshot file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Path of the merged parquet snapshot
    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
        }
    }
}

/// Cache expiry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for published aggregates in seconds (0 = never expire)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// TTL for the last-product-by-email index in seconds
    #[serde(default = "default_last_product_ttl_secs")]
    pub last_product_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            last_product_ttl_secs: default_last_product_ttl_secs(),
        }
    }
}

impl CacheConfig {
    /// Aggregate TTL, `None` when expiry is disabled.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    /// TTL for the cross-run last-product index.
    pub fn last_product_ttl(&self) -> Option<Duration> {
        (self.last_product_ttl_secs > 0).then(|| Duration::from_secs(self.last_product_ttl_secs))
    }
}

/// Background refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Minutes between the end of one run and the start of the next
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Upper bound of a random delay added to each sleep (0 = none)
    #[serde(default)]
    pub jitter_secs: u64,

    /// Double the sleep after each consecutive failed run
    #[serde(default)]
    pub failure_backoff: bool,

    /// Cap for the backed-off sleep
    #[serde(default = "default_max_backoff_minutes")]
    pub max_backoff_minutes: u64,

    /// Run the pipeline immediately when the scheduler starts
    #[serde(default = "default_true")]
    pub run_on_startup: bool,

    /// Threads of the dedicated refresh runtime
    #[serde(default = "default_refresh_threads")]
    pub worker_threads: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            jitter_secs: 0,
            failure_backoff: false,
            max_backoff_minutes: default_max_backoff_minutes(),
            run_on_startup: true,
            worker_threads: default_refresh_threads(),
        }
    }
}

/// Journey stitching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyConfig {
    /// Seed each run with the previous run's last product per customer.
    /// A full reprocessing run then counts one extra transition for customers
    /// whose last purchase did not change; set to false to start every run clean.
    #[serde(default = "default_true")]
    pub carry_last_product_across_runs: bool,
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            carry_last_product_across_runs: true,
        }
    }
}

/// HTTP adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to (host:port)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Largest page size accepted by the raw-row endpoint
    #[serde(default = "default_max_rows_limit")]
    pub max_rows_limit: usize,

    /// Worker threads serving requests (None = one per core)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_rows_limit: default_max_rows_limit(),
            worker_threads: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.source.database_url = Some(url);
        }
        if let Some(table) = lookup("CUSTOMER_TABLE") {
            self.source.table = table;
        }
        if let Some(size) = lookup("CHUNKSIZE") {
            self.source.chunk_size = parse_var("CHUNKSIZE", &size)?;
        }
        if let Some(path) = lookup("PARQUET_PATH") {
            self.snapshot.path = PathBuf::from(path);
        }
        if let Some(ttl) = lookup("CACHE_TTL_SECONDS") {
            self.cache.ttl_secs = parse_var("CACHE_TTL_SECONDS", &ttl)?;
        }
        if let Some(minutes) = lookup("REFRESH_INTERVAL_MINUTES") {
            self.refresh.interval_minutes = parse_var("REFRESH_INTERVAL_MINUTES", &minutes)?;
        }
        if let Some(bind) = lookup("BIND_ADDR") {
            self.server.bind = bind;
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// A missing database URL is not rejected here: it surfaces as a
    /// configuration error from the run that needs it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.table.trim().is_empty() {
            return Err(ConfigError::Invalid("source table name must not be empty".into()));
        }
        if self.source.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk size must be > 0".into()));
        }
        if self.refresh.interval_minutes == 0 {
            return Err(ConfigError::Invalid("refresh interval must be > 0".into()));
        }
        if self.refresh.worker_threads == 0 {
            return Err(ConfigError::Invalid("refresh worker threads must be > 0".into()));
        }
        if self.server.max_rows_limit == 0 {
            return Err(ConfigError::Invalid("max rows limit must be > 0".into()));
        }
        if self.snapshot.path.file_name().is_none() {
            return Err(ConfigError::Invalid(format!(
                "snapshot path {} does not name a file",
                self.snapshot.path.display()
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", name, value))
}

/// Remove a SQLAlchemy-style `+driver` part from the URL scheme.
fn strip_driver_suffix(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match scheme.split_once('+') {
            Some((base, _driver)) => format!("{}://{}", base, rest),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

// Default value functions for serde
fn default_table() -> String { "customer_journey".to_string() }
fn default_chunk_size() -> usize { 20_000 }
fn default_snapshot_path() -> PathBuf { PathBuf::from("data/customer_journey.parquet") }
fn default_ttl_secs() -> u64 { 300 }
fn default_last_product_ttl_secs() -> u64 { 86_400 }
fn default_interval_minutes() -> u64 { 60 }
fn default_max_backoff_minutes() -> u64 { 240 }
fn default_refresh_threads() -> usize { 2 }
fn default_true() -> bool { true }
fn default_bind() -> String { "127.0.0.1:8000".to_string() }
fn default_max_rows_limit() -> usize { 1000 }
