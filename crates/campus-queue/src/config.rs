//! Queue configuration loaded from the environment

use std::str::FromStr;
use std::time::Duration;

use crate::job::RetentionPolicy;
use crate::maintenance::MaintenanceConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::worker::WorkerConfig;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Every tunable of the queue subsystem, with defaults matching the
/// campus email queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Queue store connection (env: CAMPUS_QUEUE_DATABASE_URL)
    pub database_url: String,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub concurrency: usize,
    /// `None` disables rate limiting
    pub rate_limit: Option<RateLimitConfig>,
    pub retention: RetentionPolicy,
    pub stale_after: Duration,
    pub heartbeat_interval: Duration,
    pub maintenance_interval: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:campus-queue.db?mode=rwc".to_string(),
            max_attempts: 3,
            backoff_base: Duration::from_millis(2000),
            backoff_max: Duration::from_secs(300),
            concurrency: 5,
            rate_limit: Some(RateLimitConfig::default()),
            retention: RetentionPolicy::default(),
            stale_after: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl QueueSettings {
    /// Load configuration from `CAMPUS_QUEUE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(&format!("CAMPUS_QUEUE_{name}"));

        let millis = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(Duration::from_millis(parse(
                name,
                get(name),
                default.as_millis() as u64,
            )?))
        };
        let secs = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(Duration::from_secs(parse(name, get(name), default.as_secs())?))
        };

        let rate_limit_enabled = parse("RATE_LIMIT_ENABLED", get("RATE_LIMIT_ENABLED"), true)?;
        let rate_limit = if rate_limit_enabled {
            let base = RateLimitConfig::default();
            Some(RateLimitConfig {
                max: parse("RATE_LIMIT_MAX", get("RATE_LIMIT_MAX"), base.max)?,
                window: millis("RATE_LIMIT_WINDOW_MS", base.window)?,
            })
        } else {
            None
        };

        let settings = Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            max_attempts: parse("MAX_ATTEMPTS", get("MAX_ATTEMPTS"), defaults.max_attempts)?,
            backoff_base: millis("BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: millis("BACKOFF_MAX_MS", defaults.backoff_max)?,
            concurrency: parse("CONCURRENCY", get("CONCURRENCY"), defaults.concurrency)?,
            rate_limit,
            retention: RetentionPolicy {
                completed_age: secs("COMPLETED_AGE_SECS", defaults.retention.completed_age)?,
                completed_max_count: parse(
                    "COMPLETED_MAX_COUNT",
                    get("COMPLETED_MAX_COUNT"),
                    defaults.retention.completed_max_count,
                )?,
                failed_age: secs("FAILED_AGE_SECS", defaults.retention.failed_age)?,
            },
            stale_after: millis("STALE_AFTER_MS", defaults.stale_after)?,
            heartbeat_interval: millis("HEARTBEAT_MS", defaults.heartbeat_interval)?,
            maintenance_interval: millis("MAINTENANCE_INTERVAL_MS", defaults.maintenance_interval)?,
            poll_interval: millis("POLL_INTERVAL_MS", defaults.poll_interval)?,
            shutdown_grace: millis("SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.max == 0 || limit.window.is_zero() {
                return Err(ConfigError::Invalid(
                    "rate limit needs a positive max and window".into(),
                ));
            }
        }
        if self.heartbeat_interval.is_zero() || self.stale_after <= self.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "stale threshold ({:?}) must exceed the heartbeat interval ({:?})",
                self.stale_after, self.heartbeat_interval
            )));
        }
        if self.backoff_max < self.backoff_base {
            return Err(ConfigError::Invalid(
                "backoff cap is smaller than the base delay".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.backoff_base, self.backoff_max)
            .with_max_attempts(self.max_attempts)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            shutdown_grace: self.shutdown_grace,
            ..Default::default()
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: self.maintenance_interval,
            stale_after: self.stale_after,
            retention: self.retention,
        }
    }
}

fn parse<T: FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::Invalid(format!("CAMPUS_QUEUE_{name} has invalid value {raw:?}"))
        }),
    }
}
