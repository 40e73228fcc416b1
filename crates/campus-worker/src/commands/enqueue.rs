//! Enqueue command - add a `send-email` job

use anyhow::Result;
use campus_mail::{EmailPayload, EmailQueue};
use campus_queue::{JobOptions, QueueSettings};
use clap::Args;
use colored::Colorize;
use std::time::Duration;

#[derive(Args)]
pub struct EnqueueArgs {
    /// Recipient address
    #[arg(long)]
    pub to: String,

    #[arg(long)]
    pub subject: String,

    #[arg(long, default_value = "")]
    pub body: String,

    /// Template name passed to the mail service
    #[arg(long)]
    pub template: Option<String>,

    /// Serve ahead of normal-priority jobs
    #[arg(long, conflicts_with = "delay_ms")]
    pub urgent: bool,

    /// Hold the job back for this long
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Override the configured attempt limit for this job
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

impl EnqueueArgs {
    fn options(&self) -> JobOptions {
        let mut options = if self.urgent {
            JobOptions::urgent()
        } else {
            JobOptions::default()
        };
        if let Some(ms) = self.delay_ms {
            options = options.with_delay(Duration::from_millis(ms));
        }
        if let Some(max) = self.max_attempts {
            options = options.with_max_attempts(max);
        }
        options
    }

    fn payload(&self) -> EmailPayload {
        let email = EmailPayload::new(&self.to, &self.subject).with_body(&self.body);
        match &self.template {
            Some(template) => email.with_template(template),
            None => email,
        }
    }
}

pub async fn run(args: EnqueueArgs, settings: QueueSettings) -> Result<()> {
    let backend = crate::open_backend(&settings).await?;
    let queue = EmailQueue::new(backend);

    let id = queue.add_email_job(&args.payload(), args.options()).await?;

    println!("{} Queued email job {}", "✓".green().bold(), id.to_string().cyan());
    Ok(())
}
