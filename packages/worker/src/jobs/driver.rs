//! Pipeline driver: executes a job's kind against the ETL stages.
//!
//! The driver owns job context and cancellation; stages know nothing about
//! either. Cooperative cancellation is observed only at the checkpoints
//! between stages (and between embedding batches), so a cancel request
//! never interrupts a stage mid-flight and the document upsert stays
//! all-or-nothing.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use etl::chunk::{chunk_text, ChunkConfig};
use etl::embed::Embedder;
use etl::error::{EmbedError, FetchError, ParseError};
use etl::fetch::Fetcher;
use etl::parse::parse_bytes;
use etl::store::{DocumentMeta, DocumentStore};

use super::job::{FailureKind, Job, JobKind};

/// Chunks embedded per provider call; a checkpoint sits between calls.
const EMBED_BATCH_SIZE: usize = 64;

/// Failure of a single job execution.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job payload is malformed; never retried
    #[error("bad job input: {0}")]
    BadInput(String),

    /// Cancellation observed at a checkpoint; not a failure
    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    /// Document store failure
    #[error("document store error: {0}")]
    Store(#[from] etl::error::StoreError),
}

impl JobError {
    /// Map this failure onto the queue's retry decision.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            JobError::BadInput(_) | JobError::Parse(_) | JobError::Cancelled => {
                FailureKind::NonRetryable
            }
            JobError::Fetch(e) => {
                if e.is_retryable() {
                    FailureKind::Retryable
                } else {
                    FailureKind::NonRetryable
                }
            }
            JobError::Embed(e) => {
                if e.is_permanent() {
                    FailureKind::NonRetryable
                } else {
                    FailureKind::Retryable
                }
            }
            JobError::Store(_) => FailureKind::Retryable,
        }
    }
}

/// Executes jobs by composing the ETL stages for each [`JobKind`].
///
/// All capabilities are injected; the driver holds no global state.
#[derive(Clone)]
pub struct PipelineDriver {
    fetcher: Arc<dyn Fetcher>,
    embedder: Arc<dyn Embedder>,
    documents: Arc<dyn DocumentStore>,
    chunking: ChunkConfig,
}

impl PipelineDriver {
    /// Create a driver over the given stage implementations.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        embedder: Arc<dyn Embedder>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            fetcher,
            embedder,
            documents,
            chunking: ChunkConfig::default(),
        }
    }

    /// Override the default chunking configuration.
    pub fn with_chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Run one job to completion, cancellation, or failure.
    ///
    /// `cancel` is the job's cooperative cancellation probe: it is checked
    /// at every checkpoint and nowhere else.
    pub async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<Value, JobError> {
        match job.kind {
            JobKind::FullEtl => self.run_full_etl(job, cancel).await,
            JobKind::Crawl => self.run_crawl(job, cancel).await,
            JobKind::Parse => self.run_parse(job, cancel).await,
            JobKind::Chunk => self.run_chunk(job, cancel).await,
            JobKind::Embed => self.run_embed(job, cancel).await,
        }
    }

    async fn run_full_etl(&self, job: &Job, cancel: &CancellationToken) -> Result<Value, JobError> {
        let url = require_str(&job.input, "url")?;

        checkpoint(cancel)?;
        let fetched = self.fetcher.fetch(url).await?;
        debug!(job_id = %job.id, stage = "fetch", bytes = fetched.bytes.len(), "stage complete");

        checkpoint(cancel)?;
        let text = parse_bytes(&fetched.bytes, &fetched.content_type)?;
        debug!(job_id = %job.id, stage = "parse", chars = text.len(), "stage complete");

        checkpoint(cancel)?;
        let chunks = chunk_text(&text, &self.chunking);
        debug!(job_id = %job.id, stage = "chunk", chunks = chunks.len(), "stage complete");

        checkpoint(cancel)?;
        let vectors = self.embed_chunks(&chunks, cancel).await?;
        debug!(job_id = %job.id, stage = "embed", vectors = vectors.len(), "stage complete");

        checkpoint(cancel)?;
        let meta = DocumentMeta {
            source_url: fetched.final_url.clone(),
            content_type: Some(fetched.content_type.clone()),
        };
        let document_id = self.documents.upsert_document(&meta, &chunks, &vectors).await?;
        debug!(job_id = %job.id, stage = "upsert", document_id = %document_id, "stage complete");

        Ok(json!({
            "document_id": document_id,
            "chunk_count": chunks.len(),
        }))
    }

    async fn run_crawl(&self, job: &Job, cancel: &CancellationToken) -> Result<Value, JobError> {
        let url = require_str(&job.input, "url")?;

        checkpoint(cancel)?;
        let fetched = self.fetcher.fetch(url).await?;

        Ok(json!({
            "final_url": fetched.final_url,
            "content_type": fetched.content_type,
            "size_bytes": fetched.bytes.len(),
        }))
    }

    async fn run_parse(&self, job: &Job, cancel: &CancellationToken) -> Result<Value, JobError> {
        let content = require_str(&job.input, "content")?;
        let content_type = job
            .input
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("text/plain");

        checkpoint(cancel)?;
        let text = parse_bytes(content.as_bytes(), content_type)?;

        Ok(json!({ "text": text }))
    }

    async fn run_chunk(&self, job: &Job, cancel: &CancellationToken) -> Result<Value, JobError> {
        let text = require_str(&job.input, "text")?;

        let mut config = self.chunking.clone();
        if let Some(size) = job.input.get("size").and_then(Value::as_u64) {
            config = config.with_size(size as usize);
        }
        if let Some(overlap) = job.input.get("overlap").and_then(Value::as_u64) {
            config = config.with_overlap(overlap as usize);
        }

        checkpoint(cancel)?;
        let chunks = chunk_text(text, &config);

        Ok(json!({
            "chunk_count": chunks.len(),
            "chunks": chunks,
        }))
    }

    async fn run_embed(&self, job: &Job, cancel: &CancellationToken) -> Result<Value, JobError> {
        let texts: Vec<String> = job
            .input
            .get("texts")
            .and_then(Value::as_array)
            .ok_or_else(|| JobError::BadInput("missing required field: texts".into()))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| JobError::BadInput("texts must be strings".into()))
            })
            .collect::<Result<_, _>>()?;

        let vectors = self.embed_chunks(&texts, cancel).await?;

        Ok(json!({
            "count": vectors.len(),
            "dimension": self.embedder.dimension(),
            "vectors": vectors,
        }))
    }

    /// Embed in provider-sized batches, probing cancellation between them.
    async fn embed_chunks(
        &self,
        chunks: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, JobError> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            checkpoint(cancel)?;
            vectors.extend(self.embedder.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

/// A cooperative cancellation checkpoint.
fn checkpoint(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }
    Ok(())
}

fn require_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, JobError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| JobError::BadInput(format!("missing required field: {key}")))
}
