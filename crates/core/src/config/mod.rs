//! Engine configuration with layered loading.
//!
//! This module provides configuration management using figment for
//! layered configuration loading from multiple sources:
//!
//! 1. Environment variables (WARCHIVE_*)
//! 2. TOML config file (if WARCHIVE_CONFIG_FILE set)
//! 3. Built-in defaults
//!
//! Nested sections use `__` in environment variables, e.g.
//! `WARCHIVE_RATE__REQUESTS_PER_SECOND=4`.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Engine configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (WARCHIVE_*)
/// 2. TOML config file (if WARCHIVE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub blob: BlobConfig,

    #[serde(default)]
    pub rate: RateConfig,

    /// User-Agent string for outbound HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Cache tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory for the disk tier.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Memory tier capacity in bytes.
    #[serde(default = "default_memory_max_bytes")]
    pub memory_max_bytes: u64,

    /// Disk tier capacity in bytes.
    #[serde(default = "default_disk_max_bytes")]
    pub disk_max_bytes: u64,

    /// Default entry TTL in seconds.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Interval between background TTL sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Base URL of the optional shared remote tier. The engine runs
    /// memory+disk-only when unset or unreachable at startup.
    #[serde(default)]
    pub remote_url: Option<String>,

    /// TTL for entries written to the remote tier, in seconds.
    #[serde(default = "default_remote_ttl_seconds")]
    pub remote_ttl_seconds: u64,
}

/// Index service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Index service base URL.
    #[serde(default = "default_index_base_url")]
    pub base_url: String,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_index_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum results per index query page.
    #[serde(default = "default_max_results")]
    pub max_results: u32,

    /// How long a fetched snapshot listing stays fresh, in seconds.
    #[serde(default = "default_snapshot_ttl_seconds")]
    pub snapshot_ttl_seconds: u64,
}

/// Blob store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Primary byte-range endpoint for container files.
    #[serde(default = "default_blob_base_url")]
    pub base_url: String,

    /// Optional plain-HTTP mirror, tried once on a transient primary failure.
    #[serde(default)]
    pub mirror_url: Option<String>,

    /// Per-fetch timeout in milliseconds, covering the full body read.
    #[serde(default = "default_blob_timeout_ms")]
    pub timeout_ms: u64,

    /// Upper bound on a single ranged fetch, in bytes.
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: u64,
}

/// Rate limiting, retry, and circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Token bucket refill rate.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Token bucket capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// How long `acquire` waits for a token before failing, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Maximum attempts for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff delay ceiling in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Consecutive transient failures before the circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// Cool-down before the open circuit admits a trial call, in milliseconds.
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    /// Rolling accounting window length, in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./warchive-cache")
}

fn default_memory_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_disk_max_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_ttl_seconds() -> u64 {
    86_400
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_remote_ttl_seconds() -> u64 {
    3_600
}

fn default_index_base_url() -> String {
    "https://index.commoncrawl.org".into()
}

fn default_index_timeout_ms() -> u64 {
    30_000
}

fn default_max_results() -> u32 {
    1_000
}

fn default_snapshot_ttl_seconds() -> u64 {
    86_400
}

fn default_blob_base_url() -> String {
    "https://data.commoncrawl.org".into()
}

fn default_blob_timeout_ms() -> u64 {
    60_000
}

fn default_max_fetch_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    10_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_window_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    "warchive/0.1".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            blob: BlobConfig::default(),
            rate: RateConfig::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            memory_max_bytes: default_memory_max_bytes(),
            disk_max_bytes: default_disk_max_bytes(),
            ttl_seconds: default_ttl_seconds(),
            sweep_interval_secs: default_sweep_interval_secs(),
            remote_url: None,
            remote_ttl_seconds: default_remote_ttl_seconds(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            base_url: default_index_base_url(),
            timeout_ms: default_index_timeout_ms(),
            max_results: default_max_results(),
            snapshot_ttl_seconds: default_snapshot_ttl_seconds(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            base_url: default_blob_base_url(),
            mirror_url: None,
            timeout_ms: default_blob_timeout_ms(),
            max_fetch_bytes: default_max_fetch_bytes(),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            window_secs: default_window_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn remote_ttl(&self) -> Duration {
        Duration::from_secs(self.remote_ttl_seconds)
    }
}

impl IndexConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_seconds)
    }
}

impl BlobConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RateConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl AppConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `WARCHIVE_`
    /// 2. TOML file from `WARCHIVE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("WARCHIVE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("WARCHIVE_")
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
