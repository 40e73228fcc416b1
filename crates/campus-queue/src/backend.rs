//! Queue Backend Trait

use crate::job::{
    FailureOutcome, JobEntry, JobId, JobOptions, QueueCounts, RetentionPolicy, StalledJob,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found")]
    NotFound,
    #[error("Lease on job {0} is not held by this worker")]
    LeaseLost(JobId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Shared job store.
///
/// Lease acquisition must be atomic: two concurrent `lease_next` calls never
/// return the same job.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert a new job, `waiting` or `delayed` when `options.delay` is non-zero
    async fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError>;

    /// Lease the next eligible job for `worker_id`, incrementing its attempts
    async fn lease_next(&self, worker_id: &str) -> Result<Option<JobEntry>, QueueError>;

    /// Renew the lease so the job is not considered stalled
    async fn heartbeat(&self, id: JobId, worker_id: &str) -> Result<(), QueueError>;

    /// `active -> completed`
    async fn report_success(
        &self,
        id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), QueueError>;

    /// `active -> waiting` (with backoff) while attempts remain and the
    /// failure is retryable, otherwise `active -> failed`
    async fn report_failure(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError>;

    /// Hand back a lease whose job never started: `active -> waiting` with
    /// the attempt taken by `lease_next` undone
    async fn release(&self, id: JobId, worker_id: &str) -> Result<(), QueueError>;

    /// Return active jobs whose last heartbeat precedes `stale_before` to the queue
    async fn reclaim_stalled(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<StalledJob>, QueueError>;

    /// Delete terminal jobs outside the retention window, returning how many went
    async fn clean(&self, retention: &RetentionPolicy, now: DateTime<Utc>)
        -> Result<usize, QueueError>;

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
