use campus_persist::{connect, SqliteConfig, SqliteQueueBackend};
use campus_queue::clock::ManualClock;
use campus_queue::{
    FailureOutcome, JobOptions, JobState, QueueBackend, QueueError, RetentionPolicy, RetryPolicy,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn start() -> DateTime<Utc> {
    // Whole milliseconds, matching the column precision
    DateTime::<Utc>::from_timestamp_millis(1_760_000_000_000).unwrap()
}

async fn backend(policy: RetryPolicy) -> (SqliteQueueBackend, ManualClock) {
    let pool = connect(&SqliteConfig::memory()).await.unwrap();
    let clock = ManualClock::new(start());
    let backend = SqliteQueueBackend::with_clock(pool, policy, Arc::new(clock.clone()));
    (backend, clock)
}

#[tokio::test]
async fn test_lease_orders_by_priority_then_age() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, clock) = backend(RetryPolicy::default()).await;

    let first = queue.enqueue("send-email", json!({"n": 1}), JobOptions::default()).await?;
    clock.advance(Duration::from_millis(5));
    let second = queue.enqueue("send-email", json!({"n": 2}), JobOptions::default()).await?;
    let urgent = queue.enqueue("send-email", json!({"n": 3}), JobOptions::urgent()).await?;

    let order: Vec<_> = [
        queue.lease_next("w1").await?,
        queue.lease_next("w1").await?,
        queue.lease_next("w1").await?,
    ]
    .into_iter()
    .map(|job| job.unwrap().id)
    .collect();

    assert_eq!(order, vec![urgent, first, second]);
    assert!(queue.lease_next("w1").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_same_tick_is_fifo() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _clock) = backend(RetryPolicy::default()).await;

    let ids = [
        queue.enqueue("k", json!(1), JobOptions::default()).await?,
        queue.enqueue("k", json!(2), JobOptions::default()).await?,
        queue.enqueue("k", json!(3), JobOptions::default()).await?,
    ];
    for id in ids {
        assert_eq!(queue.lease_next("w").await?.unwrap().id, id);
    }
    Ok(())
}

#[tokio::test]
async fn test_lease_marks_active_and_counts_attempt() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _clock) = backend(RetryPolicy::default()).await;
    let id = queue
        .enqueue("send-email", json!({"to": "a@campus.edu"}), JobOptions::default())
        .await?;

    let job = queue.lease_next("worker-a").await?.unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.state, JobState::Active);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.leased_by.as_deref(), Some("worker-a"));
    assert_eq!(job.payload, json!({"to": "a@campus.edu"}));

    let counts = queue.counts().await?;
    assert_eq!(counts.active, 1);
    assert_eq!(counts.total(), 1);
    Ok(())
}

#[tokio::test]
async fn test_delayed_job_waits_for_its_time() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, clock) = backend(RetryPolicy::default()).await;
    let id = queue
        .enqueue("k", json!({}), JobOptions::delayed(Duration::from_secs(30)))
        .await?;

    assert_eq!(queue.get_job(id).await?.state, JobState::Delayed);
    assert_eq!(queue.counts().await?.delayed, 1);
    assert!(queue.lease_next("w").await?.is_none());

    clock.advance(Duration::from_secs(30));
    let job = queue.lease_next("w").await?.unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn test_success_stores_result() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _clock) = backend(RetryPolicy::default()).await;
    let id = queue.enqueue("k", json!({}), JobOptions::default()).await?;
    queue.lease_next("w").await?;

    queue.report_success(id, "w", json!({"success": true})).await?;

    let job = queue.get_job(id).await?;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!({"success": true})));
    assert_eq!(job.leased_by, None);
    Ok(())
}

#[tokio::test]
async fn test_retry_backoff_then_failed() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, clock) = backend(RetryPolicy::default()).await;
    let id = queue.enqueue("k", json!({}), JobOptions::default()).await?;

    queue.lease_next("w").await?;
    let outcome = queue.report_failure(id, "w", "smtp timeout", true).await?;
    assert_eq!(
        outcome,
        FailureOutcome::Retrying {
            attempts: 1,
            available_at: start() + chrono::Duration::milliseconds(2000),
        }
    );
    assert!(queue.lease_next("w").await?.is_none());

    clock.advance(Duration::from_millis(2000));
    queue.lease_next("w").await?.unwrap();
    let outcome = queue.report_failure(id, "w", "smtp timeout", true).await?;
    assert_eq!(
        outcome,
        FailureOutcome::Retrying {
            attempts: 2,
            available_at: start() + chrono::Duration::milliseconds(6000),
        }
    );

    clock.advance(Duration::from_millis(4000));
    queue.lease_next("w").await?.unwrap();
    let outcome = queue.report_failure(id, "w", "smtp timeout", true).await?;
    assert_eq!(outcome, FailureOutcome::Failed { attempts: 3 });

    let job = queue.get_job(id).await?;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("smtp timeout"));
    Ok(())
}

#[tokio::test]
async fn test_non_retryable_fails_immediately() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _clock) = backend(RetryPolicy::default()).await;
    let id = queue.enqueue("k", json!({}), JobOptions::default()).await?;
    queue.lease_next("w").await?;

    let outcome = queue.report_failure(id, "w", "bad address", false).await?;
    assert_eq!(outcome, FailureOutcome::Failed { attempts: 1 });
    assert_eq!(queue.counts().await?.failed, 1);
    Ok(())
}

#[tokio::test]
async fn test_reports_from_other_worker_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _clock) = backend(RetryPolicy::default()).await;
    let id = queue.enqueue("k", json!({}), JobOptions::default()).await?;
    queue.lease_next("owner").await?;

    let err = queue.report_success(id, "intruder", json!(null)).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(lost) if lost == id));
    let err = queue.heartbeat(id, "intruder").await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));
    let err = queue.report_failure(id, "intruder", "x", true).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));

    let err = queue
        .report_success(uuid::Uuid::new_v4(), "owner", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotFound));

    queue.report_success(id, "owner", json!(null)).await?;
    let err = queue.report_success(id, "owner", json!(null)).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));
    Ok(())
}

#[tokio::test]
async fn test_reclaim_stalled_requeues_without_extra_attempt(
) -> Result<(), Box<dyn std::error::Error>> {
    let (queue, clock) = backend(RetryPolicy::default()).await;
    let stalled = queue.enqueue("k", json!({}), JobOptions::default()).await?;
    let live = queue.enqueue("k", json!({}), JobOptions::default()).await?;
    queue.lease_next("crashed").await?;
    queue.lease_next("alive").await?;

    clock.advance(Duration::from_secs(20));
    queue.heartbeat(live, "alive").await?;
    clock.advance(Duration::from_secs(15));

    let cutoff = start() + chrono::Duration::seconds(5);
    let reclaimed = queue.reclaim_stalled(cutoff).await?;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, stalled);
    assert_eq!(reclaimed[0].previous_worker.as_deref(), Some("crashed"));
    assert_eq!(reclaimed[0].state, JobState::Waiting);

    let job = queue.lease_next("rescuer").await?.unwrap();
    assert_eq!(job.id, stalled);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.stalled_count, 1);

    let err = queue.report_success(stalled, "crashed", json!(null)).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));
    Ok(())
}

#[tokio::test]
async fn test_stall_on_final_attempt_fails_job() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, clock) = backend(RetryPolicy::default()).await;
    let id = queue
        .enqueue("k", json!({}), JobOptions::default().with_max_attempts(1))
        .await?;
    queue.lease_next("crashed").await?;
    clock.advance(Duration::from_secs(60));

    let reclaimed = queue.reclaim_stalled(clock_now(&clock)).await?;
    assert_eq!(reclaimed[0].state, JobState::Failed);

    let job = queue.get_job(id).await?;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn test_release_hands_lease_back_uncounted() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, clock) = backend(RetryPolicy::default()).await;
    let first = queue.enqueue("k", json!({}), JobOptions::default()).await?;
    clock.advance(Duration::from_millis(5));
    let second = queue.enqueue("k", json!({}), JobOptions::default()).await?;
    queue.lease_next("pool/lease-1").await?;

    let err = queue.release(first, "pool/lease-2").await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));

    queue.release(first, "pool/lease-1").await?;
    let job = queue.get_job(first).await?;
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.leased_by, None);
    assert_eq!(job.heartbeat_at, None);

    let err = queue.release(first, "pool/lease-1").await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));
    let err = queue.release(uuid::Uuid::new_v4(), "pool/lease-1").await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound));

    let again = queue.lease_next("pool/lease-3").await?.unwrap();
    assert_eq!(again.id, first);
    assert_eq!(again.attempts, 1);
    assert_eq!(queue.get_job(second).await?.state, JobState::Waiting);
    Ok(())
}

fn clock_now(clock: &ManualClock) -> DateTime<Utc> {
    use campus_queue::clock::Clock;
    clock.now()
}

#[tokio::test]
async fn test_clean_applies_age_and_count() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, clock) = backend(RetryPolicy::default().with_max_attempts(1)).await;

    for _ in 0..4 {
        let id = queue.enqueue("k", json!({}), JobOptions::default()).await?;
        queue.lease_next("w").await?;
        queue.report_success(id, "w", json!(null)).await?;
        clock.advance(Duration::from_millis(10));
    }
    let failed = queue.enqueue("k", json!({}), JobOptions::default()).await?;
    queue.lease_next("w").await?;
    queue.report_failure(failed, "w", "boom", true).await?;
    let pending = queue.enqueue("k", json!({}), JobOptions::default()).await?;

    let retention = RetentionPolicy {
        completed_age: Duration::from_secs(3600),
        completed_max_count: 2,
        failed_age: Duration::from_secs(86400),
    };
    assert_eq!(queue.clean(&retention, clock_now(&clock)).await?, 2);

    let counts = queue.counts().await?;
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.waiting, 1);

    // A day later, everything terminal has aged out
    clock.advance(Duration::from_secs(86401));
    assert_eq!(queue.clean(&retention, clock_now(&clock)).await?, 3);
    assert_eq!(queue.get_job(pending).await?.state, JobState::Waiting);
    assert!(matches!(queue.get_job(failed).await, Err(QueueError::NotFound)));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_leases_are_exclusive() -> Result<(), Box<dyn std::error::Error>> {
    let dir = std::env::temp_dir().join(format!("campus-queue-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite:{}?mode=rwc", dir.display());
    let pool = connect(&SqliteConfig::new(&url)).await?;
    let queue = Arc::new(SqliteQueueBackend::new(pool, RetryPolicy::default()));

    for n in 0..20 {
        queue.enqueue("k", json!({ "n": n }), JobOptions::default()).await?;
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("w{}", w);
            let mut got = Vec::new();
            while let Some(job) = queue.lease_next(&worker).await.unwrap() {
                got.push(job.id);
            }
            got
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await?);
    }
    all.sort();
    let before = all.len();
    all.dedup();
    assert_eq!(before, 20);
    assert_eq!(all.len(), 20);

    let _ = std::fs::remove_file(&dir);
    Ok(())
}
