//! Pipeline configuration.
//!
//! Covers the retry policy, queue and worker settings, storage locations and
//! the stage executor endpoint.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

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

/// Retry and backoff policy for transient stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of transient failures after which a stage is failed permanently.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `base * 2^n`.
    pub backoff_base: Duration,
    /// Upper bound on any single delay.
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-running a stage that has failed `attempt_count` times.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Whether another attempt is allowed after `attempt_count` failures.
    pub fn allows_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_retries
    }
}

/// Configuration for the orchestrator, queue and workers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Retry settings
    pub retry: RetryPolicy,
    /// How many times a conflicting read-modify-write is retried.
    pub max_conflict_retries: u32,
    /// How many times an enqueue is retried while the queue is unavailable.
    pub max_enqueue_retries: u32,

    // Queue settings
    /// Redis connection URL; `None` selects the in-process queue.
    pub redis_url: Option<String>,
    pub queue_name: String,
    /// How long a dequeued task stays invisible before redelivery.
    pub visibility_timeout: Duration,

    // Worker settings
    pub num_workers: usize,
    pub poll_interval: Duration,

    // Storage settings
    /// SQLite connection URL for the episode state store.
    pub database_url: String,
    /// Directory for blob artifacts.
    pub blob_path: PathBuf,
    /// Inline payloads larger than this are moved to the blob store.
    pub inline_limit_bytes: usize,

    // Executor settings
    /// Base URL of the stage services; each stage posts to `{url}/{stage}`.
    pub executor_url: String,
    /// Per-call timeout applied by the HTTP executors.
    pub executor_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_conflict_retries: 8,
            max_enqueue_retries: 5,

            redis_url: None,
            queue_name: "podcast_jobs".to_string(),
            visibility_timeout: Duration::from_secs(300),

            num_workers: 2,
            poll_interval: Duration::from_secs(1),

            database_url: "sqlite:podcast_forge.db".to_string(),
            blob_path: PathBuf::from("./podcast_outputs"),
            inline_limit_bytes: 64 * 1024,

            executor_url: "http://localhost:8090/stages".to_string(),
            executor_timeout: Duration::from_secs(600),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: SQLite URL for the episode store (default: sqlite:podcast_forge.db)
    /// - `REDIS_URL`: Redis URL; unset uses the in-process queue
    /// - `PODCAST_QUEUE_NAME`: Queue key prefix (default: podcast_jobs)
    /// - `PODCAST_MAX_RETRIES`: Transient failures before a stage fails (default: 3)
    /// - `PODCAST_BACKOFF_BASE_MS`: Backoff base in milliseconds (default: 2000)
    /// - `PODCAST_BACKOFF_MAX_MS`: Backoff ceiling in milliseconds (default: 300000)
    /// - `PODCAST_VISIBILITY_TIMEOUT_SECS`: Task visibility timeout (default: 300)
    /// - `PODCAST_NUM_WORKERS`: Worker count (default: 2)
    /// - `PODCAST_BLOB_PATH`: Blob directory (default: ./podcast_outputs)
    /// - `PODCAST_EXECUTOR_URL`: Stage service base URL
    /// - `PODCAST_EXECUTOR_TIMEOUT_SECS`: Stage call timeout (default: 600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = val;
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            if !val.trim().is_empty() {
                config.redis_url = Some(val);
            }
        }

        if let Ok(val) = std::env::var("PODCAST_QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Ok(val) = std::env::var("PODCAST_MAX_RETRIES") {
            config.retry.max_retries = parse_env_value(&val, "PODCAST_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("PODCAST_BACKOFF_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "PODCAST_BACKOFF_BASE_MS")?;
            config.retry.backoff_base = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("PODCAST_BACKOFF_MAX_MS") {
            let ms: u64 = parse_env_value(&val, "PODCAST_BACKOFF_MAX_MS")?;
            config.retry.backoff_max = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("PODCAST_VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PODCAST_VISIBILITY_TIMEOUT_SECS")?;
            config.visibility_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PODCAST_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "PODCAST_NUM_WORKERS")?;
        }

        if let Ok(val) = std::env::var("PODCAST_BLOB_PATH") {
            config.blob_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("PODCAST_EXECUTOR_URL") {
            config.executor_url = val;
        }

        if let Ok(val) = std::env::var("PODCAST_EXECUTOR_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PODCAST_EXECUTOR_TIMEOUT_SECS")?;
            config.executor_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if self.retry.backoff_base > self.retry.backoff_max {
            return Err(ConfigError::ValidationFailed(
                "backoff_base cannot exceed backoff_max".to_string(),
            ));
        }

        if self.max_conflict_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_conflict_retries must be greater than 0".to_string(),
            ));
        }

        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.executor_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "executor_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder method to set the maximum number of transient retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Builder method to set how often an unavailable queue is retried.
    pub fn with_max_enqueue_retries(mut self, retries: u32) -> Self {
        self.max_enqueue_retries = retries;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Builder method to set the worker count.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the blob directory.
    pub fn with_blob_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.blob_path = path.into();
        self
    }

    /// Builder method to set the executor base URL.
    pub fn with_executor_url(mut self, url: impl Into<String>) -> Self {
        self.executor_url = url.into();
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}
