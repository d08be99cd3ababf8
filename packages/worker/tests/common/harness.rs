//! Test harness with testcontainers for integration testing.
//!
//! A single Postgres container (pgvector image, so the document store
//! works too) is started once per test binary and shared; every test gets
//! its own freshly-migrated database inside it, so tests stay isolated
//! and can run concurrently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;
use uuid::Uuid;

use worker_core::jobs::{Job, JobStatus, PostgresJobStore};

/// Shared container - started once, reused by every test in the binary.
struct SharedPostgres {
    base_url: String,
    _container: ContainerAsync<GenericImage>,
}

static SHARED: OnceCell<SharedPostgres> = OnceCell::const_new();
static DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl SharedPostgres {
    async fn init() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        // pgvector/pgvector ships the vector extension on top of Postgres 16
        let container = GenericImage::new("pgvector/pgvector", "pg16")
            .with_wait_for(testcontainers::core::WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(testcontainers::core::ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .expect("Failed to start Postgres container");

        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");
        let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

        Self {
            base_url,
            _container: container,
        }
    }

    async fn get() -> &'static Self {
        SHARED.get_or_init(Self::init).await
    }
}

/// Create a fresh, migrated database and return a pool connected to it.
pub async fn test_pool() -> PgPool {
    let shared = SharedPostgres::get().await;

    let db_name = format!(
        "jobs_test_{}_{}",
        std::process::id(),
        DB_COUNTER.fetch_add(1, Ordering::SeqCst)
    );

    let admin = PgPool::connect(&format!("{}/postgres", shared.base_url))
        .await
        .expect("connect admin database");
    sqlx::query(&format!("CREATE DATABASE {db_name}"))
        .execute(&admin)
        .await
        .expect("create test database");
    admin.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&format!("{}/{}", shared.base_url, db_name))
        .await
        .expect("connect test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");

    pool
}

/// Push a running job's lease `past_secs` into the past.
pub async fn expire_lease(pool: &PgPool, job_id: Uuid, past_secs: i64) {
    sqlx::query(
        "UPDATE jobs SET lease_expires_at = NOW() - ($2 || ' seconds')::interval WHERE id = $1",
    )
    .bind(job_id)
    .bind(past_secs.to_string())
    .execute(pool)
    .await
    .expect("expire lease");
}

/// Backdate a job's creation time by `days`.
pub async fn age_job(pool: &PgPool, job_id: Uuid, days: i64) {
    sqlx::query("UPDATE jobs SET created_at = NOW() - ($2 || ' days')::interval WHERE id = $1")
        .bind(job_id)
        .bind(days.to_string())
        .execute(pool)
        .await
        .expect("age job");
}

/// Poll until the job reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    store: &PostgresJobStore,
    job_id: Uuid,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        let job = store.get(job_id).await.expect("job exists");
        if job.status == status {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {status:?}; job is {:?} ({:?})",
            job.status,
            job.last_error
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
