//! Periodic stalled-job recovery and retention cleanup

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::backend::{QueueBackend, QueueError};
use crate::clock::{sub_duration, Clock, SystemClock};
use crate::events::{JobEvent, LifecycleNotifier};
use crate::job::{JobState, RetentionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    /// Active jobs without a heartbeat for this long are reclaimed.
    /// Must be comfortably longer than the worker heartbeat interval.
    pub stale_after: Duration,
    pub retention: RetentionPolicy,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
            retention: RetentionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub requeued: usize,
    pub failed_stalled: usize,
    pub removed: usize,
}

pub struct Maintenance<B: QueueBackend + ?Sized> {
    backend: Arc<B>,
    notifier: LifecycleNotifier,
    config: MaintenanceConfig,
    clock: Arc<dyn Clock>,
}

impl<B: QueueBackend + ?Sized> Maintenance<B> {
    pub fn new(backend: Arc<B>, notifier: LifecycleNotifier, config: MaintenanceConfig) -> Self {
        Self {
            backend,
            notifier,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run_once(&self) -> Result<MaintenanceReport, QueueError> {
        let now = self.clock.now();
        let mut report = MaintenanceReport::default();

        let stalled = self
            .backend
            .reclaim_stalled(sub_duration(now, self.config.stale_after))
            .await?;
        for job in stalled {
            match job.state {
                JobState::Failed => report.failed_stalled += 1,
                _ => report.requeued += 1,
            }
            self.notifier.emit(JobEvent::Stalled {
                job_id: job.id,
                kind: job.kind,
                state: job.state,
            });
        }

        report.removed = self.backend.clean(&self.config.retention, now).await?;

        if report != MaintenanceReport::default() {
            info!(
                requeued = report.requeued,
                failed_stalled = report.failed_stalled,
                removed = report.removed,
                "Queue maintenance pass"
            );
        } else {
            debug!("Queue maintenance pass, nothing to do");
        }
        Ok(report)
    }

    /// Repeat [`Maintenance::run_once`] every interval until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Queue maintenance failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::JobOptions;
    use crate::memory::MemoryQueue;
    use crate::retry::RetryPolicy;
    use serde_json::json;

    #[tokio::test]
    async fn test_reclaims_and_emits_stalled() {
        let clock = ManualClock::default();
        let queue = Arc::new(MemoryQueue::with_clock(
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        ));
        let notifier = LifecycleNotifier::default();
        let mut events = notifier.subscribe();
        let maintenance = Maintenance::new(queue.clone(), notifier, MaintenanceConfig::default())
            .with_clock(Arc::new(clock.clone()));

        let id = queue
            .enqueue("send-email", json!({}), JobOptions::default())
            .await
            .unwrap();
        queue.lease_next("gone").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(maintenance.run_once().await.unwrap(), MaintenanceReport::default());

        clock.advance(Duration::from_secs(21));
        let report = maintenance.run_once().await.unwrap();
        assert_eq!(report.requeued, 1);

        match events.recv().await.unwrap() {
            JobEvent::Stalled { job_id, state, .. } => {
                assert_eq!(job_id, id);
                assert_eq!(state, JobState::Waiting);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(queue.get_job(id).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(MemoryQueue::new());
        let maintenance = Maintenance::new(
            queue,
            LifecycleNotifier::default(),
            MaintenanceConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { maintenance.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("maintenance loop should exit")
            .unwrap();
    }
}
