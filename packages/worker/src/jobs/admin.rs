//! Admin surface over the job store.
//!
//! The operations a REST façade or CLI needs: enqueue, cancel, inspect,
//! re-run, and clean up. Everything routes through [`PostgresJobStore`]
//! so admins and workers observe the same timeline.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::{Job, JobKind, NewJob};
use super::store::{CancelOutcome, JobFilter, JobStats, PostgresJobStore, StoreResult};

/// Options for enqueuing a job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueOptions {
    pub kind: JobKind,

    #[builder(default = Value::Null)]
    pub input: Value,

    /// Higher runs first
    #[builder(default = 0)]
    pub priority: i32,

    /// Earliest execution time
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[builder(default = 3)]
    pub max_retries: i32,
}

/// Job management operations.
#[derive(Clone)]
pub struct JobAdmin {
    store: PostgresJobStore,
}

impl JobAdmin {
    /// Create an admin surface over a store.
    pub fn new(store: PostgresJobStore) -> Self {
        Self { store }
    }

    /// Enqueue a new job and return its id.
    pub async fn enqueue(&self, options: EnqueueOptions) -> StoreResult<Uuid> {
        let job = self
            .store
            .create(NewJob {
                kind: options.kind,
                input: options.input,
                priority: options.priority,
                scheduled_at: options.scheduled_at,
                max_retries: options.max_retries,
            })
            .await?;
        Ok(job.id)
    }

    /// Request cancellation of a job in any non-terminal status.
    pub async fn cancel(&self, job_id: Uuid) -> StoreResult<CancelOutcome> {
        self.store.request_cancel(job_id).await
    }

    /// Full projection of a single job.
    pub async fn status(&self, job_id: Uuid) -> StoreResult<Job> {
        self.store.get(job_id).await
    }

    /// Page through jobs, optionally filtered by status and kind.
    pub async fn list(&self, filter: JobFilter, limit: i64, offset: i64) -> StoreResult<Vec<Job>> {
        self.store.list(filter, limit, offset).await
    }

    /// Reset a `failed` job to `pending` with a fresh retry budget.
    pub async fn retry(&self, job_id: Uuid) -> StoreResult<bool> {
        self.store.retry_failed(job_id).await
    }

    /// Delete terminal jobs older than the given number of days.
    /// Returns the number of rows deleted.
    pub async fn cleanup(&self, older_than_days: i64) -> StoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        self.store.cleanup_old(cutoff).await
    }

    /// Job counts by status.
    pub async fn stats(&self) -> StoreResult<JobStats> {
        self.store.stats().await
    }
}
