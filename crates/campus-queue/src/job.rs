//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Job Identifier
pub type JobId = Uuid;

/// Priority given to jobs enqueued without one. Lower values are served first.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Priority used for urgent jobs.
pub const URGENT_PRIORITY: i32 = 1;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible once `available_at` has passed
    Waiting,
    /// Enqueued with a delay, not yet eligible
    Delayed,
    /// Leased by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Permanently failed
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "delayed" => Some(Self::Delayed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Completed and failed jobs never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job enqueue options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: i32,
    pub delay: Duration,
    /// Falls back to the store's retry policy when `None`
    pub max_attempts: Option<u32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay: Duration::ZERO,
            max_attempts: None,
        }
    }
}

impl JobOptions {
    pub fn urgent() -> Self {
        Self {
            priority: URGENT_PRIORITY,
            ..Default::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Job handler trait, registered with the worker pool per job kind.
///
/// Handlers may run more than once for the same job (retries and stalled
/// reclaims do not resume partial work), so the external effect must be
/// at-least-once tolerant.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &JobEntry) -> JobResult;
}

/// Result of job execution
#[derive(Debug)]
pub enum JobResult {
    /// Job succeeded, with the value stored as its result
    Success(serde_json::Value),
    /// Job failed but may be retried
    Retry(String),
    /// Job failed and must not be retried
    Fatal(String),
}

/// A persisted job entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub leased_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub stalled_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobEntry {
    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// What the store did with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `waiting`, eligible again at `available_at`
    Retrying {
        attempts: u32,
        available_at: DateTime<Utc>,
    },
    /// Permanently `failed`
    Failed { attempts: u32 },
}

impl FailureOutcome {
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::Retrying { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Retrying { attempts, .. } | Self::Failed { attempts } => *attempts,
        }
    }
}

/// A job whose lease was reclaimed by `reclaim_stalled`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub id: JobId,
    pub kind: String,
    pub previous_worker: Option<String>,
    pub attempts: u32,
    /// New state: `waiting`, or `failed` when no attempts were left
    pub state: JobState,
}

/// Number of jobs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Delayed => self.delayed += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

/// How long terminal jobs are kept before the maintenance pass deletes them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_age: Duration,
    pub completed_max_count: usize,
    pub failed_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(3600),
            completed_max_count: 100,
            failed_age: Duration::from_secs(24 * 3600),
        }
    }
}
