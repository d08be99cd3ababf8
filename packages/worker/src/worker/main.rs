// Main entry point for the job worker process

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use etl::embed::Embedder;
use etl::fetch::{FetchConfig, HttpFetcher};
use etl::store::PostgresDocumentStore;
use etl::testing::FakeEmbedder;
use etl::OpenAiEmbedder;

use worker_core::jobs::{JobWorker, JobWorkerConfig, PipelineDriver, PostgresJobStore};
use worker_core::{Config, EmbeddingsProvider};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ETL job worker");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire up pipeline stages
    let fetcher = HttpFetcher::new(FetchConfig {
        timeout: config.fetch_timeout,
        max_bytes: config.fetch_max_bytes,
        ..FetchConfig::default()
    })
    .context("Failed to build HTTP fetcher")?;

    let embedder: Arc<dyn Embedder> = match config.embeddings_provider {
        EmbeddingsProvider::OpenAi => {
            let api_key = config
                .openai_api_key
                .clone()
                .context("OPENAI_API_KEY must be set for the openai embeddings provider")?;
            Arc::new(
                OpenAiEmbedder::new(api_key)
                    .with_model("text-embedding-3-small", config.embedding_dimension),
            )
        }
        EmbeddingsProvider::Fake => {
            tracing::warn!("using fake embeddings provider; vectors are hash-derived");
            Arc::new(FakeEmbedder::new(config.embedding_dimension))
        }
    };

    let documents = PostgresDocumentStore::from_pool(pool.clone(), config.embedding_dimension)
        .await
        .context("Failed to prepare document store")?;

    let driver = PipelineDriver::new(Arc::new(fetcher), embedder, Arc::new(documents));

    // Build and run the worker
    let store = PostgresJobStore::new(pool);
    let worker_config = JobWorkerConfig {
        poll_interval: config.poll_interval,
        max_concurrent_jobs: config.max_concurrent_jobs,
        heartbeat_interval: config.heartbeat_interval,
        lease_duration: config.lease_duration,
        zombie_grace: config.zombie_grace,
        shutdown_timeout: config.shutdown_timeout,
        retry_backoff_base: config.retry_backoff_base,
        retry_backoff_cap: config.retry_backoff_cap,
        ..JobWorkerConfig::default()
    };
    tracing::info!(worker_id = %worker_config.worker_id, "worker identity assigned");

    let worker = JobWorker::with_config(store, driver, worker_config);
    worker.run_until_shutdown().await
}
