//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - any tier capacity or TTL is zero
    /// - the governor rate or burst is zero
    /// - an endpoint URL is not http(s)
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.memory_max_bytes == 0 {
            return Err(invalid("cache.memory_max_bytes", "must be greater than 0"));
        }
        if self.cache.disk_max_bytes == 0 {
            return Err(invalid("cache.disk_max_bytes", "must be greater than 0"));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(invalid("cache.ttl_seconds", "must be at least 1 second"));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(invalid("cache.sweep_interval_secs", "must be at least 1 second"));
        }

        if !self.rate.requests_per_second.is_finite() || self.rate.requests_per_second <= 0.0 {
            return Err(invalid("rate.requests_per_second", "must be greater than 0"));
        }
        if self.rate.burst == 0 {
            return Err(invalid("rate.burst", "must be at least 1"));
        }
        if self.rate.max_retries == 0 {
            return Err(invalid("rate.max_retries", "must be at least 1"));
        }
        if self.rate.breaker_threshold == 0 {
            return Err(invalid("rate.breaker_threshold", "must be at least 1"));
        }
        if self.rate.backoff_base_ms == 0 {
            return Err(invalid("rate.backoff_base_ms", "must be greater than 0"));
        }
        if self.rate.backoff_cap_ms < self.rate.backoff_base_ms {
            return Err(invalid("rate.backoff_cap_ms", "must be at least backoff_base_ms"));
        }

        if self.index.timeout_ms < 100 {
            return Err(invalid("index.timeout_ms", "must be at least 100ms"));
        }
        if self.blob.timeout_ms < 100 {
            return Err(invalid("blob.timeout_ms", "must be at least 100ms"));
        }
        if self.blob.max_fetch_bytes == 0 {
            return Err(invalid("blob.max_fetch_bytes", "must be greater than 0"));
        }
        if self.index.max_results == 0 {
            return Err(invalid("index.max_results", "must be at least 1"));
        }

        check_http_url("index.base_url", &self.index.base_url)?;
        check_http_url("blob.base_url", &self.blob.base_url)?;
        if let Some(mirror) = &self.blob.mirror_url {
            check_http_url("blob.mirror_url", mirror)?;
        }
        if let Some(remote) = &self.cache.remote_url {
            check_http_url("cache.remote_url", remote)?;
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        if self.cache.memory_max_bytes > self.cache.disk_max_bytes {
            tracing::warn!(
                memory = self.cache.memory_max_bytes,
                disk = self.cache.disk_max_bytes,
                "memory tier is larger than the disk tier; disk hits will rarely fit in memory"
            );
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

fn check_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(invalid(field, "must be an http(s) URL"))
    }
}
