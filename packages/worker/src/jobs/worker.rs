//! Job worker: claim, execute, heartbeat, finalize.
//!
//! The worker is a long-running loop that:
//! - Polls the store and claims jobs while below the concurrency limit
//! - Pairs every claimed job with a heartbeat task extending its lease
//! - Drives the pipeline and writes the terminal status
//! - Sweeps for zombie jobs on the poll cadence
//! - Shuts down gracefully on signal, abandoning stragglers to lease
//!   recovery
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► claim_one (FOR UPDATE SKIP LOCKED)
//!     ├─► spawn: driver.run(job, token) ─┐ shared CancellationToken
//!     ├─► spawn: heartbeat loop ─────────┘
//!     ├─► complete / fail / release_lease
//!     └─► sweep_zombies every poll interval
//! ```
//!
//! The database row is authoritative. The per-job token is a derived
//! cache: the heartbeat refreshes it from the row's status, so it lags
//! the database by at most one heartbeat interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::driver::{JobError, PipelineDriver};
use super::job::{FailureKind, Job};
use super::store::{FailOutcome, PostgresJobStore};
use super::sweeper;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Identity recorded on claimed rows
    pub worker_id: String,
    /// Sleep between empty-queue polls; also the sweep cadence
    pub poll_interval: Duration,
    /// Maximum jobs driven concurrently by this process
    pub max_concurrent_jobs: usize,
    /// Cadence of lease extensions and cancel-flag refreshes
    pub heartbeat_interval: Duration,
    /// How long a claim holds the job without a heartbeat
    pub lease_duration: Duration,
    /// Safety margin past lease expiry before recovery
    pub zombie_grace: Duration,
    /// Maximum wait for in-flight jobs during shutdown
    pub shutdown_timeout: Duration,
    /// Base of the exponential retry backoff
    pub retry_backoff_base: Duration,
    /// Upper bound on the retry backoff
    pub retry_backoff_cap: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            poll_interval: Duration::from_secs(5),
            max_concurrent_jobs: 5,
            heartbeat_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(300),
            zombie_grace: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(3600),
        }
    }
}

/// Generate a stable per-process worker identity: `host-pid-randomN`.
pub fn generate_worker_id() -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    format!("{}-{}-{:04x}", host, std::process::id(), fastrand::u16(..))
}

/// Exponential retry backoff: `base * 2^attempt`, capped.
///
/// `attempt` is zero-based, so the first retry waits `base`.
pub fn retry_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(20))).min(cap)
}

/// A worker process's job-execution loop.
pub struct JobWorker {
    store: PostgresJobStore,
    driver: Arc<PipelineDriver>,
    config: JobWorkerConfig,
    shutdown: CancellationToken,
}

impl JobWorker {
    /// Create a worker with default configuration.
    pub fn new(store: PostgresJobStore, driver: PipelineDriver) -> Self {
        Self::with_config(store, driver, JobWorkerConfig::default())
    }

    /// Create a worker with custom configuration.
    pub fn with_config(
        store: PostgresJobStore,
        driver: PipelineDriver,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            store,
            driver: Arc::new(driver),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job worker starting"
        );

        let lease = to_chrono(self.config.lease_duration);
        let mut tasks: JoinSet<()> = JoinSet::new();

        // Recover anything a previous incarnation abandoned before
        // accepting new work.
        self.sweep().await;
        let mut last_sweep = Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if last_sweep.elapsed() >= self.config.poll_interval {
                self.sweep().await;
                last_sweep = Instant::now();
            }

            // Reap finished job tasks without blocking
            while tasks.try_join_next().is_some() {}

            if tasks.len() >= self.config.max_concurrent_jobs {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tasks.join_next() => {}
                }
                continue;
            }

            match self.store.claim_one(&self.config.worker_id, lease).await {
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, kind = ?job.kind, "claimed job");
                    let store = self.store.clone();
                    let driver = self.driver.clone();
                    let config = self.config.clone();
                    let token = self.shutdown.child_token();
                    tasks.spawn(async move {
                        execute_job(store, driver, config, job, token).await;
                    });
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        // Per-job tokens are children of the shutdown token, so
        // cancellation has already propagated; wait for cooperative
        // unwinding, then abandon stragglers to lease recovery.
        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight jobs");
            let drain = async {
                while tasks.join_next().await.is_some() {}
            };
            if tokio::time::timeout(self.config.shutdown_timeout, drain)
                .await
                .is_err()
            {
                warn!("shutdown timeout elapsed; abandoning jobs to lease recovery");
            }
        }

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }

    /// Run until a termination signal is received.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown_token();

        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });

        self.run().await
    }

    async fn sweep(&self) {
        match sweeper::sweep_zombies(&self.store, to_chrono(self.config.zombie_grace)).await {
            Ok(stats) if stats.recovered() > 0 => {
                info!(retried = stats.retried, failed = stats.failed, "zombie sweep recovered jobs");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "zombie sweep failed"),
        }
    }
}

/// Drive one claimed job to a terminal write (or deliberate abandonment).
async fn execute_job(
    store: PostgresJobStore,
    driver: Arc<PipelineDriver>,
    config: JobWorkerConfig,
    job: Job,
    job_token: CancellationToken,
) {
    let lease_lost = Arc::new(AtomicBool::new(false));
    let heartbeat = tokio::spawn(heartbeat_task(
        store.clone(),
        job.id,
        config.worker_id.clone(),
        config.heartbeat_interval,
        to_chrono(config.lease_duration),
        job_token.clone(),
        lease_lost.clone(),
    ));

    let result = driver.run(&job, &job_token).await;

    job_token.cancel();
    let _ = heartbeat.await;

    match result {
        Ok(output) => match store.complete(job.id, &config.worker_id, output).await {
            Ok(true) => info!(job_id = %job.id, kind = ?job.kind, "job completed"),
            Ok(false) => {
                debug!(job_id = %job.id, "lost ownership before completion; abandoning")
            }
            Err(e) => warn!(
                job_id = %job.id, error = %e,
                "store unavailable on completion; leaving to lease recovery"
            ),
        },
        Err(JobError::Cancelled) => {
            finalize_cancelled(&store, &config, &job, lease_lost.load(Ordering::SeqCst)).await;
        }
        Err(e) => {
            finalize_failed(&store, &config, &job, e).await;
        }
    }
}

async fn finalize_cancelled(
    store: &PostgresJobStore,
    config: &JobWorkerConfig,
    job: &Job,
    lease_lost: bool,
) {
    if lease_lost {
        debug!(job_id = %job.id, "lease lost; another owner is authoritative");
        return;
    }

    match store.is_cancel_requested(job.id).await {
        Ok(true) => {
            // The canceller already wrote the terminal status
            if let Err(e) = store.release_lease(job.id, &config.worker_id).await {
                warn!(job_id = %job.id, error = %e, "failed to release lease after cancel");
            }
            info!(job_id = %job.id, "job cancelled");
        }
        Ok(false) => {
            // Interrupted by shutdown: requeue through the retry path
            match store
                .fail(
                    job.id,
                    Some(&config.worker_id),
                    "interrupted by shutdown",
                    FailureKind::Retryable,
                )
                .await
            {
                Ok(FailOutcome::Retried { .. }) => {
                    info!(job_id = %job.id, "job requeued after shutdown interrupt")
                }
                Ok(FailOutcome::Failed) => {
                    warn!(job_id = %job.id, "retries exhausted during shutdown interrupt")
                }
                Ok(FailOutcome::Lost) => {
                    debug!(job_id = %job.id, "lost ownership during shutdown; abandoning")
                }
                Err(e) => warn!(
                    job_id = %job.id, error = %e,
                    "store unavailable during shutdown; leaving to lease recovery"
                ),
            }
        }
        Err(e) => warn!(
            job_id = %job.id, error = %e,
            "could not read cancel state; leaving to lease recovery"
        ),
    }
}

async fn finalize_failed(
    store: &PostgresJobStore,
    config: &JobWorkerConfig,
    job: &Job,
    error: JobError,
) {
    let kind = error.failure_kind();
    match store
        .fail(job.id, Some(&config.worker_id), &error.to_string(), kind)
        .await
    {
        Ok(FailOutcome::Retried { retry_count }) => {
            let attempt = retry_count.saturating_sub(1) as u32;
            let delay = retry_backoff(
                config.retry_backoff_base,
                config.retry_backoff_cap,
                attempt,
            );
            let at = Utc::now() + to_chrono(delay);
            if let Err(e) = store.schedule_retry(job.id, at).await {
                warn!(job_id = %job.id, error = %e, "failed to schedule retry backoff");
            }
            warn!(
                job_id = %job.id, error = %error, retry_count, next_attempt_at = %at,
                "job failed; retry scheduled"
            );
        }
        Ok(FailOutcome::Failed) => {
            warn!(job_id = %job.id, error = %error, "job failed permanently")
        }
        Ok(FailOutcome::Lost) => {
            debug!(job_id = %job.id, "lost ownership before failure write; abandoning")
        }
        Err(e) => warn!(
            job_id = %job.id, error = %e,
            "store unavailable on failure; leaving to lease recovery"
        ),
    }
}

/// Extend the lease and refresh the cancel flag until the job token fires.
///
/// Losing the lease (the row no longer matches) cancels the token so the
/// driver unwinds at its next checkpoint; `lease_lost` tells the job task
/// to stand down silently instead of releasing or failing the row.
async fn heartbeat_task(
    store: PostgresJobStore,
    job_id: Uuid,
    worker_id: String,
    interval: Duration,
    lease: chrono::Duration,
    token: CancellationToken,
    lease_lost: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match store.heartbeat(job_id, &worker_id, lease).await {
                    Ok(true) => {
                        match store.is_cancel_requested(job_id).await {
                            Ok(true) => {
                                debug!(job_id = %job_id, "cancel requested; signalling driver");
                                token.cancel();
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => {
                                warn!(job_id = %job_id, error = %e, "failed to refresh cancel flag")
                            }
                        }
                    }
                    Ok(false) => {
                        // Row no longer running under us: cancelled by an
                        // admin, or the lease expired and moved on
                        match store.is_cancel_requested(job_id).await {
                            Ok(true) => debug!(job_id = %job_id, "job cancelled; signalling driver"),
                            _ => {
                                lease_lost.store(true, Ordering::SeqCst);
                                debug!(job_id = %job_id, "lease lost; signalling driver");
                            }
                        }
                        token.cancel();
                        break;
                    }
                    Err(e) => {
                        // Transient; the lease survives until the next tick
                        warn!(job_id = %job_id, error = %e, "heartbeat failed; retrying next tick")
                    }
                }
            }
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
