//! Job model for durable background execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Pipeline shape selected by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// fetch → parse → chunk → embed → upsert
    FullEtl,
    Crawl,
    Parse,
    Chunk,
    Embed,
}

/// Job lifecycle state.
///
/// `Retrying` is distinct from `Pending` for observability only; the claim
/// query treats both as claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Whether a failure should go back through the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient failure - retry if attempts remain
    Retryable,
    /// Permanent failure - mark failed regardless of remaining attempts
    NonRetryable,
}

// ============================================================================
// Job Model
// ============================================================================

/// A durable job row.
///
/// The database row is authoritative; a `Job` value is a snapshot. While
/// `status = running` the lease fields (`worker_id`, `heartbeat_at`,
/// `lease_expires_at`) are all set; every transition out of `running`
/// clears them in the same transaction.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub input: serde_json::Value,
    pub status: JobStatus,

    // Scheduling
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,

    // Attempt accounting
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,

    // Lease management
    pub worker_id: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    // Result
    pub output: Option<serde_json::Value>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether this snapshot is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Parameters for enqueuing a new job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub kind: JobKind,

    #[builder(default = serde_json::Value::Null)]
    pub input: serde_json::Value,

    /// Higher runs first
    #[builder(default = 0)]
    pub priority: i32,

    /// Earliest execution time; eligible immediately when unset
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[builder(default = 3)]
    pub max_retries: i32,
}
