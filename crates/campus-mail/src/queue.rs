//! Producer helpers for email jobs

use campus_queue::{JobId, JobOptions, Producer, QueueBackend, QueueError};
use std::sync::Arc;
use std::time::Duration;

use crate::payload::EmailPayload;
use crate::SEND_EMAIL;

/// Enqueues `send-email` jobs on a shared queue store
pub struct EmailQueue<B: QueueBackend + ?Sized> {
    producer: Producer<B>,
}

impl<B: QueueBackend + ?Sized> Clone for EmailQueue<B> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<B: QueueBackend + ?Sized> EmailQueue<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            producer: Producer::new(backend),
        }
    }

    pub fn producer(&self) -> &Producer<B> {
        &self.producer
    }

    pub async fn add_email_job(
        &self,
        email: &EmailPayload,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.producer.enqueue_json(SEND_EMAIL, email, options).await
    }

    /// Served ahead of everything at the default priority
    pub async fn add_urgent_email_job(&self, email: &EmailPayload) -> Result<JobId, QueueError> {
        self.add_email_job(email, JobOptions::urgent()).await
    }

    pub async fn add_scheduled_email_job(
        &self,
        email: &EmailPayload,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        self.add_email_job(email, JobOptions::delayed(delay)).await
    }
}
