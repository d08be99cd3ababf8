//! Embedding generation.
//!
//! The [`Embedder`] trait abstracts the provider; [`OpenAiEmbedder`] talks
//! to any OpenAI-compatible `/embeddings` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EmbedError;

/// Maximum inputs sent to the provider in one request; larger batches are
/// split internally.
const PROVIDER_BATCH_SIZE: usize = 128;

/// Pluggable embedding provider.
///
/// Implementations must preserve input order: `result[i]` is the vector
/// for `texts[i]`, and every vector has exactly `dimension()` components.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Vector dimension produced by this provider.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Embedder backed by an OpenAI-compatible REST API.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    /// Create a new embedder with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
        }
    }

    /// Create from the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Result<Self, EmbedError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| EmbedError::Provider {
            message: "OPENAI_API_KEY not set".into(),
            permanent: true,
        })?;
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the embedding model and its dimension.
    pub fn with_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.model = model.into();
        self.dimension = dimension;
        self
    }

    async fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .http_client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(EmbedError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 429 and 5xx are transient; other 4xx mean the request itself
            // is wrong and will never succeed
            let permanent = status.is_client_error() && status.as_u16() != 429;
            return Err(EmbedError::Provider {
                message: format!("HTTP {status}: {body}"),
                permanent,
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(EmbedError::Http)?;

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        if data.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                expected: texts.len(),
                got: data.len(),
            });
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(PROVIDER_BATCH_SIZE) {
            debug!(batch_size = batch.len(), model = %self.model, "requesting embeddings");
            vectors.extend(self.request_batch(batch).await?);
        }
        Ok(vectors)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}
