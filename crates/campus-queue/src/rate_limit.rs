//! Pool-wide rate limiting of job starts

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum job starts per window
    pub max: u32,
    /// Rolling time window
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: 10,
            window: Duration::from_millis(1000),
        }
    }
}

/// Rate limit error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limited, retry after {retry_after:?}")]
    Limited { retry_after: Duration },
}

/// Rate limit statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStats {
    pub starts_in_window: u32,
    pub limit: u32,
    pub window: Duration,
}

/// Sliding-log limiter: at most `max` acquisitions inside any rolling
/// `window`. One instance is shared by every worker slot.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            starts: Mutex::new(VecDeque::with_capacity(config.max as usize)),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to acquire a start slot (non-blocking)
    pub async fn try_acquire(&self) -> bool {
        self.check().await.is_ok()
    }

    /// Acquire a start slot, or report how long until one frees up
    pub async fn check(&self) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut starts = self.starts.lock().await;
        Self::evict(&mut starts, now, self.config.window);

        if starts.len() >= self.config.max as usize {
            // Oldest start leaves the window first
            let retry_after = starts
                .front()
                .map(|oldest| (*oldest + self.config.window).saturating_duration_since(now))
                .unwrap_or(self.config.window);
            return Err(RateLimitError::Limited {
                retry_after: retry_after.max(Duration::from_millis(1)),
            });
        }

        starts.push_back(now);
        Ok(())
    }

    /// Wait until a slot is available, then take it
    pub async fn acquire(&self) {
        while let Err(RateLimitError::Limited { retry_after }) = self.check().await {
            tokio::time::sleep(retry_after).await;
        }
    }

    pub async fn stats(&self) -> RateLimitStats {
        let mut starts = self.starts.lock().await;
        Self::evict(&mut starts, Instant::now(), self.config.window);
        RateLimitStats {
            starts_in_window: starts.len() as u32,
            limit: self.config.max,
            window: self.config.window,
        }
    }

    fn evict(starts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = starts.front() {
            if now.saturating_duration_since(*oldest) >= window {
                starts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max: 3,
            window: Duration::from_millis(100),
        });

        // Should allow first 3 starts
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);

        // 4th should be limited
        assert!(matches!(
            limiter.check().await,
            Err(RateLimitError::Limited { retry_after }) if retry_after <= Duration::from_millis(100)
        ));

        // Wait for window to roll
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_rolling() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max: 2,
            window: Duration::from_millis(1000),
        });

        assert!(limiter.try_acquire().await);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        // First start leaves the window at t=1000, second one is still inside
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        let stats = limiter.stats().await;
        assert_eq!(stats.starts_in_window, 2);
        assert_eq!(stats.limit, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_defers_instead_of_dropping() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max: 1,
            window: Duration::from_millis(500),
        });
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
