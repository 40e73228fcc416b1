//! Producer handle used by request handlers to submit work

use serde::Serialize;
use std::sync::Arc;

use crate::backend::{QueueBackend, QueueError};
use crate::job::{JobId, JobOptions};

/// Thin enqueue-only view of a queue store. Enqueueing never waits for the
/// job to run; the returned id can be used to inspect it later.
pub struct Producer<B: QueueBackend + ?Sized> {
    backend: Arc<B>,
}

impl<B: QueueBackend + ?Sized> Clone for Producer<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<B: QueueBackend + ?Sized> Producer<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub async fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let id = self.backend.enqueue(kind, payload, options).await?;
        tracing::info!(
            job_id = %id,
            kind,
            priority = options.priority,
            delay_ms = options.delay.as_millis() as u64,
            "Job added to queue"
        );
        Ok(id)
    }

    /// Serialize `payload` and enqueue it
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        payload: &T,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let value = serde_json::to_value(payload)?;
        self.enqueue(kind, value, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::memory::MemoryQueue;
    use std::time::Duration;

    #[derive(Serialize)]
    struct Reminder<'a> {
        to: &'a str,
    }

    #[tokio::test]
    async fn test_enqueue_json_and_options() {
        let producer = Producer::new(Arc::new(MemoryQueue::new()));
        let id = producer
            .enqueue_json(
                "send-email",
                &Reminder { to: "dean@campus.edu" },
                JobOptions::delayed(Duration::from_secs(60)).with_max_attempts(5),
            )
            .await
            .unwrap();

        let job = producer.backend().get_job(id).await.unwrap();
        assert_eq!(job.payload["to"], "dean@campus.edu");
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.max_attempts, 5);
    }
}
