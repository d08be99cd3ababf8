//! PostgreSQL-backed job store.
//!
//! Every operation is a single transaction. Claim and recovery take row
//! locks with `FOR UPDATE SKIP LOCKED`; heartbeat, complete, and fail are
//! single-row updates predicated on `worker_id`/`status`, so a worker that
//! lost its lease applies no update and learns about it from the return
//! value instead of an error.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::job::{FailureKind, Job, JobKind, JobStatus, NewJob};

/// Errors from the job store.
///
/// Conflicts (the row no longer matches the caller's view) are not errors;
/// they surface through the operation's return value.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database unreachable or the query failed
    #[error("job store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// Referenced job does not exist
    #[error("job not found: {0}")]
    NotFound(Uuid),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`PostgresJobStore::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Moved to `retrying`; `retry_count` is the incremented value
    Retried { retry_count: i32 },
    /// Moved to `failed`
    Failed,
    /// Row is no longer held by the caller; nothing was written
    Lost,
}

/// Outcome of [`PostgresJobStore::request_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job is now `cancelled`
    Cancelled,
    /// The job had already reached a terminal status
    AlreadyTerminal,
    /// No such job
    NotFound,
}

/// Outcome of [`PostgresJobStore::recover_zombie`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverOutcome {
    /// Requeued as `retrying` with an incremented `retry_count`
    Retried,
    /// Retries exhausted; moved to `failed`
    Failed,
    /// Row was no longer an expired `running` job; nothing was written
    Skipped,
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub retrying: i64,
    pub cancelled: i64,
}

impl JobStats {
    /// Total rows across all statuses.
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed + self.retrying + self.cancelled
    }
}

/// Filter for [`PostgresJobStore::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
}

const JOB_COLUMNS: &str = "id, kind, input, status, priority, scheduled_at, retry_count, \
     max_retries, last_error, worker_id, heartbeat_at, lease_expires_at, output, \
     created_at, updated_at, completed_at";

/// PostgreSQL job store.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new `pending` job.
    pub async fn create(&self, new_job: NewJob) -> StoreResult<Job> {
        let now = Utc::now();
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (id, kind, input, status, priority, scheduled_at, max_retries,
                              created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $7)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new_job.kind)
        .bind(&new_job.input)
        .bind(new_job.priority)
        .bind(new_job.scheduled_at)
        .bind(new_job.max_retries)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    /// Atomically claim the single most eligible job.
    ///
    /// Selects the highest-priority, longest-waiting `pending`/`retrying`
    /// row whose `scheduled_at` has passed, locks it with
    /// `FOR UPDATE SKIP LOCKED` so concurrent claimers never collide, and
    /// marks it `running` under the caller's lease in the same statement.
    pub async fn claim_one(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<Job>> {
        let now = Utc::now();
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status IN ('pending', 'retrying')
                  AND (scheduled_at IS NULL OR scheduled_at <= $1)
                ORDER BY priority DESC, scheduled_at ASC NULLS FIRST, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                worker_id = $2,
                heartbeat_at = $1,
                lease_expires_at = $3,
                updated_at = $1
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(worker_id)
        .bind(now + lease)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Extend the lease for a running job.
    ///
    /// Returns whether the update applied; `false` means the row is no
    /// longer running under `worker_id` and the caller should stand down.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = $3, lease_expires_at = $4, updated_at = $3
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .bind(now + lease)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finalize a running job as `completed`.
    ///
    /// Returns whether the update applied (same CAS semantics as
    /// [`heartbeat`](Self::heartbeat)).
    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        output: serde_json::Value,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                output = $3,
                completed_at = $4,
                last_error = NULL,
                worker_id = NULL,
                heartbeat_at = NULL,
                lease_expires_at = NULL,
                updated_at = $4
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(output)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failure, moving the job to `retrying` or `failed`.
    ///
    /// With `FailureKind::Retryable` and attempts remaining the row goes to
    /// `retrying` with `retry_count` incremented; otherwise to `failed`.
    /// `worker_id: None` skips the holder check (recovery paths).
    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        error: &str,
        kind: FailureKind,
    ) -> StoreResult<FailOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            return Err(StoreError::NotFound(job_id));
        };

        if job.status != JobStatus::Running {
            return Ok(FailOutcome::Lost);
        }
        if let Some(expected) = worker_id {
            if job.worker_id.as_deref() != Some(expected) {
                return Ok(FailOutcome::Lost);
            }
        }

        let retryable = kind == FailureKind::Retryable && job.retry_count + 1 <= job.max_retries;
        let outcome = if retryable {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'retrying',
                    retry_count = retry_count + 1,
                    last_error = $2,
                    worker_id = NULL,
                    heartbeat_at = NULL,
                    lease_expires_at = NULL,
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            FailOutcome::Retried {
                retry_count: job.retry_count + 1,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    last_error = $2,
                    worker_id = NULL,
                    heartbeat_at = NULL,
                    lease_expires_at = NULL,
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            FailOutcome::Failed
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Set the earliest re-claim time for a `retrying` job (retry backoff).
    pub async fn schedule_retry(&self, job_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET scheduled_at = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'retrying'",
        )
        .bind(job_id)
        .bind(at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Request cancellation.
    ///
    /// `pending`, `retrying`, and `running` rows all move straight to
    /// `cancelled`; a running worker observes the terminal status through
    /// its cancel-flag refresh and unwinds at its next checkpoint.
    pub async fn request_cancel(&self, job_id: Uuid) -> StoreResult<CancelOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status = sqlx::query_scalar::<_, JobStatus>(
            "SELECT status FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(status) = status else {
            return Ok(CancelOutcome::NotFound);
        };
        if status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                worker_id = NULL,
                heartbeat_at = NULL,
                lease_expires_at = NULL,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CancelOutcome::Cancelled)
    }

    /// Whether cancellation has been requested for this job.
    pub async fn is_cancel_requested(&self, job_id: Uuid) -> StoreResult<bool> {
        let status =
            sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(status == Some(JobStatus::Cancelled))
    }

    /// Clear lease fields without touching status.
    ///
    /// Used by a worker that observed cancellation: the terminal write was
    /// already done by the canceller. The `worker_id` predicate makes this
    /// a no-op when ownership already moved on.
    pub async fn release_lease(&self, job_id: Uuid, worker_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET worker_id = NULL, heartbeat_at = NULL, lease_expires_at = NULL, updated_at = $3
            WHERE id = $1 AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List running jobs whose lease expired more than `grace` ago.
    pub async fn list_zombies(&self, grace: Duration) -> StoreResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'running' AND lease_expires_at < $1
            ORDER BY lease_expires_at ASC
            "#
        ))
        .bind(Utc::now() - grace)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Recover one zombie: requeue with an incremented `retry_count`, or
    /// fail it when retries are exhausted.
    ///
    /// Re-verifies under a row lock that the job is still running with an
    /// expired lease, so a recovery racing a live worker (or a second
    /// sweeper) is a no-op.
    pub async fn recover_zombie(&self, job_id: Uuid, grace: Duration) -> StoreResult<RecoverOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE SKIP LOCKED"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            return Ok(RecoverOutcome::Skipped);
        };

        let still_expired = job.status == JobStatus::Running
            && job
                .lease_expires_at
                .map(|expires| expires < now - grace)
                .unwrap_or(false);
        if !still_expired {
            return Ok(RecoverOutcome::Skipped);
        }

        let outcome = if job.retry_count + 1 <= job.max_retries {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'retrying',
                    retry_count = retry_count + 1,
                    last_error = 'lease expired',
                    worker_id = NULL,
                    heartbeat_at = NULL,
                    lease_expires_at = NULL,
                    updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            RecoverOutcome::Retried
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    last_error = 'lease expired',
                    worker_id = NULL,
                    heartbeat_at = NULL,
                    lease_expires_at = NULL,
                    updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            RecoverOutcome::Failed
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Delete terminal jobs created before `cutoff`. Returns rows deleted.
    pub async fn cleanup_old(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs \
             WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count jobs by status.
    pub async fn stats(&self) -> StoreResult<JobStats> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Retrying => stats.retrying = count,
                JobStatus::Cancelled => stats.cancelled = count,
            }
        }
        Ok(stats)
    }

    /// Fetch a job by id.
    pub async fn get(&self, job_id: Uuid) -> StoreResult<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or(StoreError::NotFound(job_id))
    }

    /// List jobs, newest first, with optional status/kind filters.
    pub async fn list(&self, filter: JobFilter, limit: i64, offset: i64) -> StoreResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::job_status IS NULL OR status = $1)
              AND ($2::job_kind IS NULL OR kind = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.status)
        .bind(filter.kind)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Reset a `failed` job to `pending` with a fresh retry budget.
    pub async fn retry_failed(&self, job_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                retry_count = 0,
                last_error = NULL,
                scheduled_at = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
