//! Zombie sweeper: reclaims jobs whose lease expired past the grace period.
//!
//! A worker that crashes mid-job leaves its row `running` with a lease
//! that stops being extended. Once `lease_expires_at + grace` has passed
//! the owner is missing or too slow, and the sweep either requeues the
//! row or fails it when its retry budget is spent. Recovery re-verifies
//! each row under a lock, so concurrent sweeps from several workers are
//! safe.

use chrono::Duration;
use tracing::{debug, info, warn};

use super::store::{PostgresJobStore, RecoverOutcome, StoreError};

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Requeued as `retrying`
    pub retried: u64,
    /// Retries exhausted; moved to `failed`
    pub failed: u64,
    /// Rows that changed under us and were left alone
    pub skipped: u64,
}

impl SweepStats {
    /// Rows a terminal or requeue write was applied to.
    pub fn recovered(&self) -> u64 {
        self.retried + self.failed
    }
}

/// Run one sweep pass over every expired `running` job.
pub async fn sweep_zombies(
    store: &PostgresJobStore,
    grace: Duration,
) -> Result<SweepStats, StoreError> {
    let zombies = store.list_zombies(grace).await?;
    let mut stats = SweepStats::default();

    for job in zombies {
        match store.recover_zombie(job.id, grace).await {
            Ok(RecoverOutcome::Retried) => {
                info!(
                    job_id = %job.id,
                    retry_count = job.retry_count + 1,
                    "requeued expired job"
                );
                stats.retried += 1;
            }
            Ok(RecoverOutcome::Failed) => {
                warn!(job_id = %job.id, "expired job out of retries; failed");
                stats.failed += 1;
            }
            Ok(RecoverOutcome::Skipped) => {
                debug!(job_id = %job.id, "job changed during sweep; skipped");
                stats.skipped += 1;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to recover zombie");
            }
        }
    }

    Ok(stats)
}
