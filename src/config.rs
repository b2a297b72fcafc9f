//! Engine configuration.
//!
//! This module provides configuration for the job engine: the store
//! connection, status record lifetime, retry backoff, default worker pool
//! sizing and shutdown behaviour.

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::job::RetryPolicy;
use crate::scheduler::status::DEFAULT_STATUS_TTL;

/// Default Redis connection URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default number of poll loops per queue.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default sleep between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Per-queue worker pool options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Number of independent poll loops.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty or the store errored.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WorkerOptions {
    /// Creates options with the given concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validates the options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the job engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Lifetime of status records.
    pub status_ttl: Duration,
    /// Backoff between attempts.
    pub retry_policy: RetryPolicy,
    /// Worker options used when a queue is started without explicit ones.
    pub worker_options: WorkerOptions,
    /// Upper bound on how long stopping a queue waits for in-flight
    /// handlers. `None` waits indefinitely.
    pub shutdown_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            status_ttl: DEFAULT_STATUS_TTL,
            retry_policy: RetryPolicy::default(),
            worker_options: WorkerOptions::default(),
            shutdown_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBQUEUE_REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `JOBQUEUE_STATUS_TTL_SECS`: Status record lifetime (default: 86400)
    /// - `JOBQUEUE_BACKOFF_BASE_MS`: Retry backoff base (default: 1000)
    /// - `JOBQUEUE_CONCURRENCY`: Default poll loops per queue (default: 1)
    /// - `JOBQUEUE_POLL_INTERVAL_MS`: Default idle poll interval (default: 1000)
    /// - `JOBQUEUE_SHUTDOWN_TIMEOUT_SECS`: Shutdown wait bound (default: unbounded)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("JOBQUEUE_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("JOBQUEUE_STATUS_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBQUEUE_STATUS_TTL_SECS")?;
            config.status_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("JOBQUEUE_BACKOFF_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "JOBQUEUE_BACKOFF_BASE_MS")?;
            config.retry_policy = RetryPolicy::new(Duration::from_millis(ms));
        }

        if let Ok(val) = std::env::var("JOBQUEUE_CONCURRENCY") {
            config.worker_options.concurrency = parse_env_value(&val, "JOBQUEUE_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("JOBQUEUE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "JOBQUEUE_POLL_INTERVAL_MS")?;
            config.worker_options.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("JOBQUEUE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBQUEUE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.status_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "status_ttl must be at least one second".to_string(),
            ));
        }

        if self.retry_policy.base.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "retry backoff base must be greater than 0".to_string(),
            ));
        }

        self.worker_options.validate()?;

        if self.shutdown_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "shutdown_timeout must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the status record lifetime.
    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    /// Builder method to set the retry backoff base.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.retry_policy = RetryPolicy::new(base);
        self
    }

    /// Builder method to set the default worker options.
    pub fn with_worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }

    /// Builder method to bound shutdown waits.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::DEFAULT_BACKOFF_BASE;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.status_ttl, Duration::from_secs(86_400));
        assert_eq!(config.retry_policy.base, DEFAULT_BACKOFF_BASE);
        assert_eq!(config.worker_options.concurrency, 1);
        assert_eq!(config.worker_options.poll_interval, Duration::from_secs(1));
        assert!(config.shutdown_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::new()
            .with_redis_url("redis://cache:6380")
            .with_status_ttl(Duration::from_secs(60))
            .with_backoff_base(Duration::from_millis(10))
            .with_worker_options(WorkerOptions::new(4).with_poll_interval(Duration::from_millis(50)))
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.status_ttl, Duration::from_secs(60));
        assert_eq!(config.retry_policy.base, Duration::from_millis(10));
        assert_eq!(config.worker_options.concurrency, 4);
        assert_eq!(config.worker_options.poll_interval, Duration::from_millis(50));
        assert_eq!(config.shutdown_timeout, Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        assert!(EngineConfig::new().with_redis_url("").validate().is_err());
        assert!(EngineConfig::new()
            .with_status_ttl(Duration::from_millis(500))
            .validate()
            .is_err());
        assert!(EngineConfig::new()
            .with_backoff_base(Duration::ZERO)
            .validate()
            .is_err());
        assert!(EngineConfig::new()
            .with_worker_options(WorkerOptions::new(0))
            .validate()
            .is_err());
        assert!(EngineConfig::new()
            .with_shutdown_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: u64 = parse_env_value("42", "KEY").unwrap();
        assert_eq!(parsed, 42);

        let err = parse_env_value::<u64>("forty", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
    }
}
