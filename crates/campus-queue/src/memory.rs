//! In-memory queue implementation with priority scheduling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{QueueBackend, QueueError};
use crate::clock::{add_duration, sub_duration, Clock, SystemClock};
use crate::job::{
    FailureOutcome, JobEntry, JobId, JobOptions, JobState, QueueCounts, RetentionPolicy,
    StalledJob,
};
use crate::retry::{RetryDecision, RetryPolicy};

/// Delayed heap entry - orders by available_at (earliest first)
#[derive(Debug, Clone, Eq, PartialEq)]
struct DelayedEntry {
    available_at: DateTime<Utc>,
    id: Uuid,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: earlier available_at = higher priority
        other
            .available_at
            .cmp(&self.available_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ready set key. Field order is the lease order: priority, then age, then
/// insertion sequence for jobs created within the same clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

#[derive(Debug)]
struct Slot {
    entry: JobEntry,
    seq: u64,
}

impl Slot {
    fn ready_key(&self) -> ReadyKey {
        ReadyKey {
            priority: self.entry.priority,
            created_at: self.entry.created_at,
            seq: self.seq,
            id: self.entry.id,
        }
    }

    fn check_lease(&self, worker_id: &str) -> Result<(), QueueError> {
        if self.entry.state == JobState::Active
            && self.entry.leased_by.as_deref() == Some(worker_id)
        {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(self.entry.id))
        }
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.entry.leased_by = None;
        self.entry.heartbeat_at = None;
        self.entry.updated_at = now;
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, Slot>,
    delayed: BinaryHeap<DelayedEntry>,
    ready: BTreeSet<ReadyKey>,
    next_seq: u64,
}

impl QueueState {
    /// Move delayed entries whose time has come into the ready set
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(head) = self.delayed.peek() {
            if head.available_at > now {
                break;
            }
            let Some(head) = self.delayed.pop() else {
                break;
            };
            if let Some(slot) = self.jobs.get_mut(&head.id) {
                if slot.entry.state == JobState::Delayed {
                    slot.entry.state = JobState::Waiting;
                }
                if slot.entry.state == JobState::Waiting {
                    self.ready.insert(slot.ready_key());
                }
            }
        }
    }

    fn schedule(&mut self, id: Uuid, now: DateTime<Utc>) {
        let Some(slot) = self.jobs.get(&id) else {
            return;
        };
        if slot.entry.available_at <= now {
            self.ready.insert(slot.ready_key());
        } else {
            self.delayed.push(DelayedEntry {
                available_at: slot.entry.available_at,
                id,
            });
        }
    }
}

/// In-process [`QueueBackend`]. All state sits behind one lock, so every
/// operation, lease acquisition included, is atomic.
#[derive(Debug)]
pub struct MemoryQueue {
    state: RwLock<QueueState>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let id = Uuid::new_v4();
        let now = self.clock.now();
        let delayed = !options.delay.is_zero();

        let entry = JobEntry {
            id,
            kind: kind.to_string(),
            payload,
            state: if delayed {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            priority: options.priority,
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.policy.default_max_attempts)
                .max(1),
            available_at: add_duration(now, options.delay),
            result: None,
            last_error: None,
            leased_by: None,
            heartbeat_at: None,
            stalled_count: 0,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.write().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(id, Slot { entry, seq });
        state.schedule(id, now);

        tracing::debug!(job_id = %id, kind = kind, priority = options.priority, delayed, "Job enqueued");
        Ok(id)
    }

    async fn lease_next(&self, worker_id: &str) -> Result<Option<JobEntry>, QueueError> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state.promote_due(now);

        while let Some(key) = state.ready.pop_first() {
            let Some(slot) = state.jobs.get_mut(&key.id) else {
                continue;
            };
            let job = &mut slot.entry;
            // Only lease jobs that are still queued and due
            if !matches!(job.state, JobState::Waiting | JobState::Delayed) || job.available_at > now
            {
                continue;
            }
            job.state = JobState::Active;
            job.attempts += 1;
            job.leased_by = Some(worker_id.to_string());
            job.heartbeat_at = Some(now);
            job.updated_at = now;
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn heartbeat(&self, id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let slot = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        slot.check_lease(worker_id)?;
        slot.entry.heartbeat_at = Some(now);
        Ok(())
    }

    async fn report_success(
        &self,
        id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let slot = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        slot.check_lease(worker_id)?;
        slot.entry.state = JobState::Completed;
        slot.entry.result = Some(result);
        slot.release(now);
        Ok(())
    }

    async fn report_failure(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let slot = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        slot.check_lease(worker_id)?;

        let attempts = slot.entry.attempts;
        let decision = if retryable {
            self.policy.decide(attempts, slot.entry.max_attempts)
        } else {
            RetryDecision::GiveUp
        };
        slot.entry.last_error = Some(error.to_string());
        slot.release(now);

        match decision {
            RetryDecision::Retry { delay } => {
                let available_at = add_duration(now, delay);
                slot.entry.state = JobState::Waiting;
                slot.entry.available_at = available_at;
                state.schedule(id, now);

                tracing::debug!(
                    job_id = %id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Re-queuing job with backoff"
                );
                Ok(FailureOutcome::Retrying {
                    attempts,
                    available_at,
                })
            }
            RetryDecision::GiveUp => {
                slot.entry.state = JobState::Failed;
                Ok(FailureOutcome::Failed { attempts })
            }
        }
    }

    async fn release(&self, id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let slot = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        slot.check_lease(worker_id)?;

        slot.entry.attempts = slot.entry.attempts.saturating_sub(1);
        slot.entry.state = JobState::Waiting;
        slot.release(now);
        state.schedule(id, now);
        Ok(())
    }

    async fn reclaim_stalled(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<StalledJob>, QueueError> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let stale: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|slot| {
                slot.entry.state == JobState::Active
                    && slot.entry.heartbeat_at.unwrap_or(slot.entry.updated_at) < stale_before
            })
            .map(|slot| slot.entry.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(slot) = state.jobs.get_mut(&id) else {
                continue;
            };
            let previous_worker = slot.entry.leased_by.clone();
            slot.entry.stalled_count += 1;
            slot.release(now);

            if slot.entry.attempts >= slot.entry.max_attempts {
                slot.entry.state = JobState::Failed;
                slot.entry.last_error = Some("job stalled on its final attempt".to_string());
            } else {
                slot.entry.state = JobState::Waiting;
                slot.entry.available_at = now;
            }

            reclaimed.push(StalledJob {
                id,
                kind: slot.entry.kind.clone(),
                previous_worker,
                attempts: slot.entry.attempts,
                state: slot.entry.state,
            });
            if slot.entry.state == JobState::Waiting {
                state.schedule(id, now);
            }
        }

        Ok(reclaimed)
    }

    async fn clean(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let completed_cutoff = sub_duration(now, retention.completed_age);
        let failed_cutoff = sub_duration(now, retention.failed_age);

        let mut state = self.state.write().await;
        let before = state.jobs.len();

        state.jobs.retain(|_, slot| match slot.entry.state {
            JobState::Completed => slot.entry.updated_at >= completed_cutoff,
            JobState::Failed => slot.entry.updated_at >= failed_cutoff,
            _ => true,
        });

        // Keep only the newest `completed_max_count` completed jobs
        let mut completed: Vec<(DateTime<Utc>, u64, Uuid)> = state
            .jobs
            .values()
            .filter(|slot| slot.entry.state == JobState::Completed)
            .map(|slot| (slot.entry.updated_at, slot.seq, slot.entry.id))
            .collect();
        if completed.len() > retention.completed_max_count {
            completed.sort_unstable_by(|a, b| b.cmp(a));
            for (_, _, id) in completed.into_iter().skip(retention.completed_max_count) {
                state.jobs.remove(&id);
            }
        }

        Ok(before - state.jobs.len())
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let state = self.state.read().await;
        state
            .jobs
            .get(&id)
            .map(|slot| slot.entry.clone())
            .ok_or(QueueError::NotFound)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.read().await;
        let mut counts = QueueCounts::default();
        for slot in state.jobs.values() {
            counts.add(slot.entry.state, 1);
        }
        Ok(counts)
    }
}
