use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment prefix for every configuration variable.
const ENV_PREFIX: &str = "IMGRESIZER_";

/// Process configuration, built once at startup and handed to each component.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8080"). Ignored by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string; credentials and database index go in the URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis list holding pending resize jobs
    #[serde(default = "default_queue_key")]
    pub queue_key: String,

    /// Pub/sub channel carrying completed job keys
    #[serde(default = "default_done_channel")]
    pub done_channel: String,

    /// Number of resize workers to run in this process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Directory holding originals and resized variants
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// How long a request waits for its resize before giving up
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Lifetime of an entry in the completion waiter table
    #[serde(default = "default_waiter_ttl_ms")]
    pub waiter_ttl_ms: u64,

    /// Worker sleep when the queue is empty or after a failed job
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Interval between cache directory counts for the image gauge
    #[serde(default = "default_count_interval_ms")]
    pub count_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_queue_key() -> String {
    "queue:images".to_string()
}

fn default_done_channel() -> String {
    "processed".to_string()
}

fn default_workers() -> usize {
    3
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("images")
}

fn default_wait_timeout_ms() -> u64 {
    2000
}

fn default_waiter_ttl_ms() -> u64 {
    10_000
}

fn default_idle_backoff_ms() -> u64 {
    10
}

fn default_count_interval_ms() -> u64 {
    1000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            redis_url: default_redis_url(),
            queue_key: default_queue_key(),
            done_channel: default_done_channel(),
            workers: default_workers(),
            cache_dir: default_cache_dir(),
            wait_timeout_ms: default_wait_timeout_ms(),
            waiter_ttl_ms: default_waiter_ttl_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
            count_interval_ms: default_count_interval_ms(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::prefixed(ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make waits or the waiter table meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid("wait_timeout_ms must be positive"));
        }
        if self.waiter_ttl_ms == 0 {
            return Err(ConfigError::Invalid("waiter_ttl_ms must be positive"));
        }
        if self.waiter_ttl_ms < self.wait_timeout_ms {
            return Err(ConfigError::Invalid(
                "waiter_ttl_ms must not be shorter than wait_timeout_ms",
            ));
        }
        if self.idle_backoff_ms == 0 {
            return Err(ConfigError::Invalid("idle_backoff_ms must be positive"));
        }
        if self.count_interval_ms == 0 {
            return Err(ConfigError::Invalid("count_interval_ms must be positive"));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn waiter_ttl(&self) -> Duration {
        Duration::from_millis(self.waiter_ttl_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn count_interval(&self) -> Duration {
        Duration::from_millis(self.count_interval_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
