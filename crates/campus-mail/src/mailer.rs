//! Mail transport abstraction

use async_trait::async_trait;
use std::time::Duration;

use crate::payload::EmailPayload;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MailError {
    /// Transient transport failure, worth retrying
    #[error("Mail transport unavailable: {0}")]
    Unavailable(String),
    /// The message will never be accepted
    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl MailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Outbound mail transport
#[async_trait]
pub trait Mailer: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn send(&self, email: &EmailPayload) -> Result<(), MailError>;
}

/// Simulated transport that only logs. Each send takes `latency`.
#[derive(Debug, Clone)]
pub struct LogMailer {
    latency: Duration,
}

impl Default for LogMailer {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(1),
        }
    }
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, email: &EmailPayload) -> Result<(), MailError> {
        tracing::info!(to = %email.to, subject = %email.subject, template = ?email.template, "Sending email");
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        tracing::info!(to = %email.to, "Email sent successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_log_mailer_waits_for_latency() {
        let mailer = LogMailer::new();
        let email = EmailPayload::new("a@campus.edu", "Hi");

        let started = tokio::time::Instant::now();
        mailer.send(&email).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(MailError::Unavailable("smtp down".into()).is_transient());
        assert!(!MailError::Rejected("no such mailbox".into()).is_transient());
    }
}
