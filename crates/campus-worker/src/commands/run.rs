//! Run command - process jobs until a shutdown signal arrives

use anyhow::Result;
use campus_mail::{LogMailer, SendEmailHandler, SEND_EMAIL};
use campus_queue::events::log_events;
use campus_queue::{LifecycleNotifier, Maintenance, QueueSettings, RateLimiter, WorkerPool};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

#[derive(Args)]
pub struct RunArgs {
    /// Fixed worker id, useful to tell processes apart in logs
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Simulated delivery time of the log mailer
    #[arg(long, default_value_t = 1000)]
    pub mail_latency_ms: u64,
}

pub async fn run(args: RunArgs, settings: QueueSettings) -> Result<()> {
    let backend = crate::open_backend(&settings).await?;

    let notifier = LifecycleNotifier::default();
    tokio::spawn(log_events(notifier.subscribe()));

    let mut pool = WorkerPool::new_with_arc(backend.clone(), settings.worker_config())
        .with_notifier(notifier.clone());
    if let Some(limit) = settings.rate_limit {
        pool = pool.with_rate_limiter(Arc::new(RateLimiter::new(limit)));
    }
    if let Some(worker_id) = args.worker_id {
        pool = pool.with_worker_id(worker_id);
    }
    let mailer = LogMailer::with_latency(Duration::from_millis(args.mail_latency_ms));
    pool.register_handler(SEND_EMAIL, SendEmailHandler::new(Arc::new(mailer)));
    let pool = Arc::new(pool);

    let maintenance = Maintenance::new(backend, notifier, settings.maintenance_config());
    let (stop_maintenance, maintenance_rx) = watch::channel(false);
    let maintenance = tokio::spawn(async move { maintenance.run(maintenance_rx).await });

    let runner = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.start().await })
    };

    shutdown_signal().await;
    pool.stop();
    stop_maintenance.send_replace(true);

    runner.await?;
    maintenance.await?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
