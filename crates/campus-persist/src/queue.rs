use async_trait::async_trait;
use campus_queue::{
    backend::QueueError,
    clock::{add_duration, sub_duration, Clock, SystemClock},
    job::{
        FailureOutcome, JobEntry, JobId, JobOptions, JobState, QueueCounts, RetentionPolicy,
        StalledJob,
    },
    retry::{RetryDecision, RetryPolicy},
    QueueBackend,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, kind, payload, state, priority, attempts, max_attempts, \
     available_at, result, last_error, leased_by, heartbeat_at, stalled_count, created_at, updated_at";

fn db(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Backend(format!("Invalid timestamp {}", ms)))
}

fn row_to_entry(row: &SqliteRow) -> Result<JobEntry, QueueError> {
    let id_str: String = row.try_get("id").map_err(db)?;
    let id = Uuid::parse_str(&id_str).map_err(|_| QueueError::Backend("Invalid UUID".into()))?;

    let state_str: String = row.try_get("state").map_err(db)?;
    let state = JobState::parse(&state_str)
        .ok_or_else(|| QueueError::Backend(format!("Unknown job state '{}'", state_str)))?;

    let payload: String = row.try_get("payload").map_err(db)?;
    let result: Option<String> = row.try_get("result").map_err(db)?;
    let heartbeat_at: Option<i64> = row.try_get("heartbeat_at").map_err(db)?;

    Ok(JobEntry {
        id,
        kind: row.try_get("kind").map_err(db)?,
        payload: serde_json::from_str(&payload)?,
        state,
        priority: row.try_get::<i64, _>("priority").map_err(db)? as i32,
        attempts: row.try_get::<i64, _>("attempts").map_err(db)? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts").map_err(db)? as u32,
        available_at: from_millis(row.try_get("available_at").map_err(db)?)?,
        result: result
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?,
        last_error: row.try_get("last_error").map_err(db)?,
        leased_by: row.try_get("leased_by").map_err(db)?,
        heartbeat_at: heartbeat_at.map(from_millis).transpose()?,
        stalled_count: row.try_get::<i64, _>("stalled_count").map_err(db)? as u32,
        created_at: from_millis(row.try_get("created_at").map_err(db)?)?,
        updated_at: from_millis(row.try_get("updated_at").map_err(db)?)?,
    })
}

/// Durable queue backend using SQLite.
///
/// Leasing is a single `UPDATE ... RETURNING` statement, so concurrent workers
/// sharing one database never receive the same job.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self::with_clock(pool, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            policy,
            clock,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Distinguish a missing job from one whose lease moved elsewhere
    async fn lease_error(&self, id: JobId) -> QueueError {
        match sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => QueueError::LeaseLost(id),
            Ok(None) => QueueError::NotFound,
            Err(e) => db(e),
        }
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let id = Uuid::new_v4();
        let now = self.clock.now();
        let delayed = !options.delay.is_zero();
        let state = if delayed {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.policy.default_max_attempts)
            .max(1);

        sqlx::query(
            "INSERT INTO jobs (id, kind, payload, state, priority, attempts, max_attempts, available_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(kind)
        .bind(serde_json::to_string(&payload)?)
        .bind(state.as_str())
        .bind(options.priority as i64)
        .bind(max_attempts as i64)
        .bind(to_millis(add_duration(now, options.delay)))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(db)?;

        tracing::debug!(job_id = %id, kind = kind, priority = options.priority, delayed, "Job enqueued");
        Ok(id)
    }

    async fn lease_next(&self, worker_id: &str) -> Result<Option<JobEntry>, QueueError> {
        let now = to_millis(self.clock.now());

        sqlx::query(
            "UPDATE jobs SET state = 'waiting', updated_at = ? WHERE state = 'delayed' AND available_at <= ?",
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'active',
                attempts = attempts + 1,
                leased_by = ?,
                heartbeat_at = ?,
                updated_at = ?
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE state IN ('waiting', 'delayed') AND available_at <= ?
                ORDER BY priority ASC, created_at ASC, seq ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn heartbeat(&self, id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let now = to_millis(self.clock.now());
        let done = sqlx::query(
            "UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND state = 'active' AND leased_by = ?",
        )
        .bind(now)
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if done.rows_affected() == 0 {
            return Err(self.lease_error(id).await);
        }
        Ok(())
    }

    async fn report_success(
        &self,
        id: JobId,
        worker_id: &str,
        result: Value,
    ) -> Result<(), QueueError> {
        let now = to_millis(self.clock.now());
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', result = ?, leased_by = NULL, heartbeat_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'active' AND leased_by = ?
            "#,
        )
        .bind(serde_json::to_string(&result)?)
        .bind(now)
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if done.rows_affected() == 0 {
            return Err(self.lease_error(id).await);
        }
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

        let row = sqlx::query(
            "SELECT attempts, max_attempts FROM jobs WHERE id = ? AND state = 'active' AND leased_by = ?",
        )
        .bind(id.to_string())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        let Some(row) = row else {
            return Err(self.lease_error(id).await);
        };
        let attempts = row.try_get::<i64, _>("attempts").map_err(db)? as u32;
        let max_attempts = row.try_get::<i64, _>("max_attempts").map_err(db)? as u32;

        let decision = if retryable {
            self.policy.decide(attempts, max_attempts)
        } else {
            RetryDecision::GiveUp
        };

        let (state, available_at) = match decision {
            RetryDecision::Retry { delay } => (JobState::Waiting, Some(add_duration(now, delay))),
            RetryDecision::GiveUp => (JobState::Failed, None),
        };

        // Guarded on attempts too, so a reclaim and re-lease in between is not overwritten
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, last_error = ?, available_at = COALESCE(?, available_at),
                leased_by = NULL, heartbeat_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'active' AND leased_by = ? AND attempts = ?
            "#,
        )
        .bind(state.as_str())
        .bind(error)
        .bind(available_at.map(to_millis))
        .bind(to_millis(now))
        .bind(id.to_string())
        .bind(worker_id)
        .bind(attempts as i64)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if done.rows_affected() == 0 {
            return Err(self.lease_error(id).await);
        }

        match available_at {
            Some(available_at) => {
                tracing::debug!(job_id = %id, attempts, %available_at, "Re-queuing job with backoff");
                Ok(FailureOutcome::Retrying {
                    attempts,
                    available_at,
                })
            }
            None => Ok(FailureOutcome::Failed { attempts }),
        }
    }

    async fn release(&self, id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let now = to_millis(self.clock.now());
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'waiting', attempts = MAX(attempts - 1, 0), leased_by = NULL,
                heartbeat_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'active' AND leased_by = ?
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if done.rows_affected() == 0 {
            return Err(self.lease_error(id).await);
        }
        Ok(())
    }

    async fn reclaim_stalled(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<StalledJob>, QueueError> {
        let now = to_millis(self.clock.now());
        let mut tx = self.pool.begin().await.map_err(db)?;

        let rows = sqlx::query(
            r#"
            SELECT id, kind, leased_by, attempts, max_attempts FROM jobs
            WHERE state = 'active' AND COALESCE(heartbeat_at, updated_at) < ?
            ORDER BY seq
            "#,
        )
        .bind(to_millis(stale_before))
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id_str: String = row.try_get("id").map_err(db)?;
            let id =
                Uuid::parse_str(&id_str).map_err(|_| QueueError::Backend("Invalid UUID".into()))?;
            let attempts = row.try_get::<i64, _>("attempts").map_err(db)? as u32;
            let max_attempts = row.try_get::<i64, _>("max_attempts").map_err(db)? as u32;

            let state = if attempts >= max_attempts {
                JobState::Failed
            } else {
                JobState::Waiting
            };
            let last_error = (state == JobState::Failed).then_some("job stalled on its final attempt");

            sqlx::query(
                r#"
                UPDATE jobs
                SET state = ?, available_at = ?, last_error = COALESCE(?, last_error),
                    stalled_count = stalled_count + 1,
                    leased_by = NULL, heartbeat_at = NULL, updated_at = ?
                WHERE id = ? AND state = 'active'
                "#,
            )
            .bind(state.as_str())
            .bind(now)
            .bind(last_error)
            .bind(now)
            .bind(&id_str)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

            reclaimed.push(StalledJob {
                id,
                kind: row.try_get("kind").map_err(db)?,
                previous_worker: row.try_get("leased_by").map_err(db)?,
                attempts,
                state,
            });
        }

        tx.commit().await.map_err(db)?;
        Ok(reclaimed)
    }

    async fn clean(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let completed_cutoff = to_millis(sub_duration(now, retention.completed_age));
        let failed_cutoff = to_millis(sub_duration(now, retention.failed_age));
        let mut tx = self.pool.begin().await.map_err(db)?;

        let mut removed = sqlx::query("DELETE FROM jobs WHERE state = 'completed' AND updated_at < ?")
            .bind(completed_cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db)?
            .rows_affected();

        removed += sqlx::query("DELETE FROM jobs WHERE state = 'failed' AND updated_at < ?")
            .bind(failed_cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db)?
            .rows_affected();

        // Keep only the newest `completed_max_count` completed jobs
        removed += sqlx::query(
            r#"
            DELETE FROM jobs WHERE state = 'completed' AND seq NOT IN (
                SELECT seq FROM jobs WHERE state = 'completed'
                ORDER BY updated_at DESC, seq DESC
                LIMIT ?
            )
            "#,
        )
        .bind(retention.completed_max_count as i64)
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .rows_affected();

        tx.commit().await.map_err(db)?;
        Ok(removed as usize)
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or(QueueError::NotFound)?;

        row_to_entry(&row)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(db)?;
            let n: i64 = row.try_get("n").map_err(db)?;
            if let Some(state) = JobState::parse(&state) {
                counts.add(state, n as u64);
            }
        }
        Ok(counts)
    }
}
