use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Which embedding capability the worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingsProvider {
    /// OpenAI-compatible HTTP endpoint (requires `OPENAI_API_KEY`)
    OpenAi,
    /// Deterministic hash-derived vectors; no network
    Fake,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub heartbeat_interval: Duration,
    pub lease_duration: Duration,
    pub zombie_grace: Duration,
    pub shutdown_timeout: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    pub embeddings_provider: EmbeddingsProvider,
    pub openai_api_key: Option<String>,
    pub embedding_dimension: usize,
    pub fetch_timeout: Duration,
    pub fetch_max_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let embeddings_provider = match env::var("EMBEDDINGS_PROVIDER")
            .unwrap_or_else(|_| "openai".to_string())
            .to_lowercase()
            .as_str()
        {
            "openai" => EmbeddingsProvider::OpenAi,
            "fake" => EmbeddingsProvider::Fake,
            other => anyhow::bail!("unknown EMBEDDINGS_PROVIDER: {other}"),
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            poll_interval: secs_var("JOB_POLL_INTERVAL", 5)?,
            max_concurrent_jobs: int_var("MAX_CONCURRENT_JOBS", 5)? as usize,
            heartbeat_interval: secs_var("HEARTBEAT_INTERVAL", 30)?,
            lease_duration: secs_var("LEASE_DURATION", 300)?,
            zombie_grace: secs_var("ZOMBIE_GRACE", 60)?,
            shutdown_timeout: secs_var("SHUTDOWN_TIMEOUT", 30)?,
            retry_backoff_base: secs_var("RETRY_BACKOFF_BASE", 1)?,
            retry_backoff_cap: secs_var("RETRY_BACKOFF_CAP", 3600)?,
            embeddings_provider,
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            embedding_dimension: int_var("EMBEDDING_DIMENSION", 1536)? as usize,
            fetch_timeout: secs_var("FETCH_TIMEOUT", 30)?,
            fetch_max_bytes: int_var("FETCH_MAX_BYTES", 10 * 1024 * 1024)? as usize,
        })
    }
}

fn int_var(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(int_var(name, default_secs)?))
}
