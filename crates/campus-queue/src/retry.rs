//! Retry and backoff policy, consulted by the store on every failed attempt

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed { delay_ms: u64 },
    /// `base * 2^(attempts-1)`
    Exponential { base_ms: u64 },
}

impl BackoffStrategy {
    fn raw_delay(&self, attempts: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { base_ms } => {
                let shift = attempts.saturating_sub(1).min(63);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub max_delay: Duration,
    /// Used for jobs enqueued without an explicit `max_attempts`
    pub default_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential { base_ms: 2000 },
            max_delay: Duration::from_secs(300),
            default_max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                base_ms: base.as_millis() as u64,
            },
            max_delay,
            ..Default::default()
        }
    }

    /// No wait between attempts
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed { delay_ms: 0 },
            max_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Delay after the `attempts`-th failed attempt
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        self.strategy.raw_delay(attempts).min(self.max_delay)
    }

    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if attempts >= max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: self.backoff_delay(attempts),
            }
        }
    }
}
