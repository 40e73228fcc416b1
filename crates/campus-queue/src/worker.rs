//! Worker Pool for processing jobs

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{QueueBackend, QueueError};
use crate::events::{JobEvent, LifecycleNotifier};
use crate::job::{JobEntry, JobHandler, JobId, JobResult};
use crate::rate_limit::{RateLimitError, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    /// Sleep between lease attempts when the queue is empty
    pub poll_interval: Duration,
    /// Sleep after the store itself returned an error
    pub error_backoff: Duration,
    /// Slot pause after reporting a failed attempt
    pub failure_pause: Duration,
    /// Lease renewal period while a job executes
    pub heartbeat_interval: Duration,
    /// How long `start` waits for in-flight jobs after `stop`
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            failure_pause: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct JobRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobRegistry {
    fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
    }

    fn insert(&self, kind: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.to_string(), handler);
    }
}

pub struct WorkerPool<B: QueueBackend + ?Sized> {
    backend: Arc<B>,
    config: WorkerConfig,
    registry: Arc<JobRegistry>,
    limiter: Option<Arc<RateLimiter>>,
    notifier: LifecycleNotifier,
    worker_id: String,
    shutdown: watch::Sender<bool>,
}

impl<B: QueueBackend + 'static> WorkerPool<B> {
    pub fn new(backend: B, config: WorkerConfig) -> Self {
        Self::new_with_arc(Arc::new(backend), config)
    }
}

impl<B: QueueBackend + ?Sized + 'static> WorkerPool<B> {
    /// Create new worker pool from existing Arc backend (supports dyn dispatch)
    pub fn new_with_arc(backend: Arc<B>, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            config,
            registry: Arc::new(JobRegistry::default()),
            limiter: None,
            notifier: LifecycleNotifier::default(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            shutdown,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_notifier(mut self, notifier: LifecycleNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn notifier(&self) -> &LifecycleNotifier {
        &self.notifier
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Register the handler for a job kind
    pub fn register_handler<H: JobHandler + 'static>(&self, kind: &str, handler: H) {
        self.registry.insert(kind, Arc::new(handler));
    }

    pub fn register_handler_arc(&self, kind: &str, handler: Arc<dyn JobHandler>) {
        self.registry.insert(kind, handler);
    }

    /// Signal graceful shutdown. `start` stops leasing and returns once
    /// in-flight jobs finish or the grace period runs out.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Lease and execute jobs until [`WorkerPool::stop`] is called
    pub async fn start(&self) {
        let concurrency = self.config.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut shutdown = self.shutdown.subscribe();
        let executor = Arc::new(Executor {
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            limiter: self.limiter.clone(),
            notifier: self.notifier.clone(),
            worker_id: self.worker_id.clone(),
            config: self.config,
            shutdown: self.shutdown.subscribe(),
        });

        info!(
            worker_id = %self.worker_id,
            concurrency,
            rate_limited = self.limiter.is_some(),
            "Worker pool started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Take a slot before leasing so a leased job never queues behind the pool
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            // Every lease gets its own holder id, so a slot whose job was
            // reclaimed can never report on a later attempt of the same job
            let holder = format!("{}/{}", self.worker_id, Uuid::new_v4());
            match self.backend.lease_next(&holder).await {
                Ok(Some(job)) => {
                    let executor = executor.clone();
                    tokio::spawn(async move {
                        executor.process(job, holder).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    idle(&mut shutdown, self.config.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Queue error while leasing");
                    idle(&mut shutdown, self.config.error_backoff).await;
                }
            }
        }

        info!(worker_id = %self.worker_id, "Worker pool stopping, waiting for in-flight jobs");
        let drained = tokio::time::timeout(
            self.config.shutdown_grace,
            semaphore.acquire_many(concurrency as u32),
        )
        .await;
        match drained {
            Ok(Ok(_)) => info!(worker_id = %self.worker_id, "Worker pool stopped"),
            _ => warn!(
                worker_id = %self.worker_id,
                in_flight = concurrency - semaphore.available_permits(),
                "Shutdown grace period elapsed with jobs still running"
            ),
        }
    }
}

async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(period) => {}
        _ = shutdown.changed() => {}
    }
}

/// Per-pool state shared by every spawned execution
struct Executor<B: QueueBackend + ?Sized> {
    backend: Arc<B>,
    registry: Arc<JobRegistry>,
    limiter: Option<Arc<RateLimiter>>,
    notifier: LifecycleNotifier,
    worker_id: String,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<B: QueueBackend + ?Sized + 'static> Executor<B> {
    async fn process(&self, job: JobEntry, holder: String) {
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.backend.clone(),
            job.id,
            holder.clone(),
            self.config.heartbeat_interval,
        ));

        // Denial is backpressure: keep the lease and wait for a slot
        if !self.wait_for_rate_limit(&job).await {
            heartbeat.abort();
            self.hand_back(&job, &holder).await;
            return;
        }

        self.notifier.emit(JobEvent::Started {
            job_id: job.id,
            kind: job.kind.clone(),
            attempt: job.attempts,
            worker_id: self.worker_id.clone(),
        });
        info!(job_id = %job.id, kind = %job.kind, attempt = job.attempts, "Processing job");

        let result = self.execute(&job).await;
        heartbeat.abort();

        let failed = match result {
            JobResult::Success(value) => {
                self.succeed(&job, &holder, value).await;
                false
            }
            JobResult::Retry(e) => {
                self.fail(&job, &holder, e, true).await;
                true
            }
            JobResult::Fatal(e) => {
                self.fail(&job, &holder, e, false).await;
                true
            }
        };

        if failed && !self.config.failure_pause.is_zero() {
            tokio::time::sleep(self.config.failure_pause).await;
        }
    }

    /// Wait until the limiter admits this job. Returns `false` when the
    /// pool is stopping first.
    async fn wait_for_rate_limit(&self, job: &JobEntry) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return false;
            }
            match limiter.check().await {
                Ok(()) => return true,
                Err(RateLimitError::Limited { retry_after }) => {
                    debug!(job_id = %job.id, ?retry_after, "Rate limited, holding lease");
                    tokio::select! {
                        _ = tokio::time::sleep(retry_after) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Return a job that never started to the queue, attempt not counted
    async fn hand_back(&self, job: &JobEntry, holder: &str) {
        match self.backend.release(job.id, holder).await {
            Ok(()) => info!(job_id = %job.id, "Pool stopping, returned rate-limited job to the queue"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to return job to the queue"),
        }
    }

    async fn execute(&self, job: &JobEntry) -> JobResult {
        let Some(handler) = self.registry.get(&job.kind) else {
            warn!(job_id = %job.id, kind = %job.kind, "No handler registered for job kind");
            return JobResult::Fatal(format!("No handler for {}", job.kind));
        };

        match AssertUnwindSafe(handler.execute(job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job.id, panic = %message, "Job handler panicked");
                JobResult::Retry(format!("handler panicked: {message}"))
            }
        }
    }

    async fn succeed(&self, job: &JobEntry, holder: &str, value: serde_json::Value) {
        match self
            .backend
            .report_success(job.id, holder, value.clone())
            .await
        {
            Ok(()) => {
                info!(job_id = %job.id, "Job completed");
                self.notifier.emit(JobEvent::Completed {
                    job_id: job.id,
                    kind: job.kind.clone(),
                    result: value,
                });
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job completion");
            }
        }
    }

    async fn fail(&self, job: &JobEntry, holder: &str, error: String, retryable: bool) {
        match self
            .backend
            .report_failure(job.id, holder, &error, retryable)
            .await
        {
            Ok(outcome) => {
                warn!(
                    job_id = %job.id,
                    attempts = outcome.attempts(),
                    will_retry = outcome.will_retry(),
                    error = %error,
                    "Job attempt failed"
                );
                self.notifier.emit(JobEvent::Failed {
                    job_id: job.id,
                    kind: job.kind.clone(),
                    error,
                    attempts: outcome.attempts(),
                    will_retry: outcome.will_retry(),
                });
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
            }
        }
    }
}

async fn heartbeat_loop<B: QueueBackend + ?Sized>(
    backend: Arc<B>,
    id: JobId,
    worker_id: String,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
    // First tick fires immediately; the lease was just taken
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match backend.heartbeat(id, &worker_id).await {
            Ok(()) => {}
            Err(e @ (QueueError::LeaseLost(_) | QueueError::NotFound)) => {
                warn!(job_id = %id, error = %e, "Lease lost while job was running");
                break;
            }
            Err(e) => warn!(job_id = %id, error = %e, "Heartbeat failed"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
