//! Durable job infrastructure.
//!
//! A single `jobs` table in PostgreSQL is the only coordination point:
//! claims take row locks with `FOR UPDATE SKIP LOCKED` for exactly-once
//! dispatch, a heartbeat-extended lease makes every claim self-expiring,
//! and cancellation is an authoritative status write that running workers
//! observe cooperatively.
//!
//! # Architecture
//!
//! ```text
//! JobAdmin.enqueue(cmd)
//!     └─► INSERT jobs (status = pending)
//!
//! JobWorker
//!     ├─► claim_one (SKIP LOCKED, sets lease)
//!     ├─► PipelineDriver.run(job, token)
//!     │       └─► fetch → parse → chunk → embed → upsert
//!     │           with cancellation checkpoints between stages
//!     ├─► heartbeat task (extends lease, refreshes cancel flag)
//!     ├─► complete / fail (+ backoff) / release_lease
//!     └─► sweep_zombies (lease expired ⇒ requeue or fail)
//! ```

pub mod admin;
pub mod driver;
mod job;
mod store;
pub mod sweeper;
pub mod worker;

pub use admin::{EnqueueOptions, JobAdmin};
pub use driver::{JobError, PipelineDriver};
pub use job::{FailureKind, Job, JobKind, JobStatus, NewJob};
pub use store::{
    CancelOutcome, FailOutcome, JobFilter, JobStats, PostgresJobStore, RecoverOutcome, StoreError,
    StoreResult,
};
pub use sweeper::{sweep_zombies, SweepStats};
pub use worker::{generate_worker_id, retry_backoff, JobWorker, JobWorkerConfig};
