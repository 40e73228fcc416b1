//! `send-email` job handler

use async_trait::async_trait;
use campus_queue::{JobEntry, JobHandler, JobResult};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::mailer::{MailError, Mailer};
use crate::payload::{EmailPayload, EmailReceipt};

#[derive(Debug, Clone)]
pub struct SendEmailHandler {
    mailer: Arc<dyn Mailer>,
}

impl SendEmailHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    pub fn mailer(&self) -> &Arc<dyn Mailer> {
        &self.mailer
    }
}

#[async_trait]
impl JobHandler for SendEmailHandler {
    async fn execute(&self, job: &JobEntry) -> JobResult {
        info!(job_id = %job.id, kind = %job.kind, attempt = job.attempts, "Processing job");

        let email: EmailPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(email) => email,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Malformed email payload");
                return JobResult::Fatal(format!("Invalid email payload: {}", e));
            }
        };

        if email.to.trim().is_empty() {
            return JobResult::Fatal("Email has no recipient".to_string());
        }

        match self.mailer.send(&email).await {
            Ok(()) => {
                let receipt = EmailReceipt {
                    success: true,
                    sent_at: Utc::now(),
                    to: email.to,
                    subject: email.subject,
                };
                match serde_json::to_value(&receipt) {
                    Ok(value) => JobResult::Success(value),
                    Err(e) => JobResult::Fatal(e.to_string()),
                }
            }
            Err(e @ MailError::Unavailable(_)) => {
                warn!(job_id = %job.id, mailer = self.mailer.name(), error = %e, "Send failed, will retry");
                JobResult::Retry(e.to_string())
            }
            Err(e @ MailError::Rejected(_)) => {
                error!(job_id = %job.id, mailer = self.mailer.name(), error = %e, "Send rejected");
                JobResult::Fatal(e.to_string())
            }
        }
    }
}
