//! Lifecycle events for observability
//!
//! Events are a side channel: emitting never blocks and never fails the
//! job, whether or not anyone is listening.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::job::{JobId, JobState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job_id: JobId,
        kind: String,
        attempt: u32,
        worker_id: String,
    },
    Completed {
        job_id: JobId,
        kind: String,
        result: serde_json::Value,
    },
    Failed {
        job_id: JobId,
        kind: String,
        error: String,
        attempts: u32,
        will_retry: bool,
    },
    Stalled {
        job_id: JobId,
        kind: String,
        /// `waiting` when requeued, `failed` when no attempts were left
        state: JobState,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Started { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stalled { job_id, .. } => *job_id,
        }
    }
}

/// Broadcast fan-out of [`JobEvent`]s
#[derive(Debug, Clone)]
pub struct LifecycleNotifier {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for LifecycleNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LifecycleNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: JobEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Render events through `tracing` until the notifier is dropped
pub async fn log_events(mut rx: broadcast::Receiver<JobEvent>) {
    loop {
        match rx.recv().await {
            Ok(JobEvent::Started {
                job_id,
                kind,
                attempt,
                worker_id,
            }) => info!(%job_id, %kind, attempt, %worker_id, "Job started"),
            Ok(JobEvent::Completed { job_id, kind, result }) => {
                info!(%job_id, %kind, %result, "Job completed")
            }
            Ok(JobEvent::Failed {
                job_id,
                kind,
                error,
                attempts,
                will_retry,
            }) => {
                if will_retry {
                    warn!(%job_id, %kind, attempts, %error, "Job failed, will retry");
                } else {
                    error!(%job_id, %kind, attempts, %error, "Job failed permanently");
                }
            }
            Ok(JobEvent::Stalled { job_id, kind, state }) => {
                warn!(%job_id, %kind, %state, "Job stalled (worker lost its lease)")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event logger lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let notifier = LifecycleNotifier::default();
        notifier.emit(JobEvent::Stalled {
            job_id: Uuid::new_v4(),
            kind: "send-email".into(),
            state: JobState::Waiting,
        });
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let notifier = LifecycleNotifier::new(8);
        let mut rx = notifier.subscribe();
        let id = Uuid::new_v4();

        notifier.emit(JobEvent::Started {
            job_id: id,
            kind: "send-email".into(),
            attempt: 1,
            worker_id: "w".into(),
        });
        notifier.emit(JobEvent::Completed {
            job_id: id,
            kind: "send-email".into(),
            result: serde_json::json!({ "success": true }),
        });

        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Started { attempt: 1, .. }));
        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.job_id(), id);
        assert!(matches!(completed, JobEvent::Completed { .. }));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let value = serde_json::to_value(JobEvent::Failed {
            job_id: Uuid::nil(),
            kind: "send-email".into(),
            error: "timeout".into(),
            attempts: 2,
            will_retry: true,
        })
        .unwrap();
        assert_eq!(value["event"], "failed");
        assert_eq!(value["will_retry"], true);
    }
}
