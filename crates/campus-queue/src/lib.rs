//! # Campus Queue
//!
//! Async background job queue for the campus events platform.
//!
//! Features:
//! - Pluggable store (`QueueBackend`) with atomic lease acquisition
//! - Priority and delayed jobs, FIFO within a priority band
//! - Worker pool with concurrency control and graceful shutdown
//! - Retry with exponential backoff, stalled-job recovery
//! - Pool-wide rate limiting and lifecycle events

pub mod backend;
pub mod clock;
pub mod config;
pub mod events;
pub mod job;
pub mod maintenance;
pub mod memory;
pub mod producer;
pub mod rate_limit;
pub mod retry;
pub mod worker;

pub use backend::{QueueBackend, QueueError};
pub use config::{ConfigError, QueueSettings};
pub use events::{JobEvent, LifecycleNotifier};
pub use job::{
    FailureOutcome, JobEntry, JobHandler, JobId, JobOptions, JobResult, JobState, QueueCounts,
    RetentionPolicy, StalledJob,
};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceReport};
pub use memory::MemoryQueue;
pub use producer::Producer;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use worker::{WorkerConfig, WorkerPool};
