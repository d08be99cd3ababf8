//! Mock implementations for testing.
//!
//! These let pipeline and worker tests run without network access, an
//! embedding provider, or a live document database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::embed::Embedder;
use crate::error::{EmbedError, FetchError, StoreError};
use crate::fetch::{Fetched, Fetcher};
use crate::store::{DocumentMeta, DocumentStore};

/// Canned response for a [`MockFetcher`] URL.
#[derive(Debug, Clone)]
enum MockResponse {
    Page { bytes: Vec<u8>, content_type: String },
    Status(u16),
    Timeout,
}

/// Fetcher serving canned responses from memory.
#[derive(Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, MockResponse>>,
    delay: Option<Duration>,
    /// Number of leading calls that fail with a timeout before canned
    /// responses apply (for retry tests)
    fail_first: usize,
    calls: AtomicUsize,
}

impl MockFetcher {
    /// Create an empty mock fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `html` as `text/html` for `url`.
    pub fn with_page(self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.with_typed_page(url, html.into().into_bytes(), "text/html")
    }

    /// Serve arbitrary bytes with an explicit content type for `url`.
    pub fn with_typed_page(
        self,
        url: impl Into<String>,
        bytes: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        self.responses.lock().unwrap().insert(
            url.into(),
            MockResponse::Page {
                bytes,
                content_type: content_type.into(),
            },
        );
        self
    }

    /// Respond to `url` with an HTTP status error.
    pub fn with_status(self, url: impl Into<String>, status: u16) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.into(), MockResponse::Status(status));
        self
    }

    /// Respond to `url` with a timeout.
    pub fn with_timeout(self, url: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.into(), MockResponse::Timeout);
        self
    }

    /// Sleep this long before answering each fetch (for cancellation tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` fetches with timeouts, then serve normally.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Total fetches attempted so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if call < self.fail_first {
            return Err(FetchError::Timeout {
                url: url.to_string(),
            });
        }

        let response = self.responses.lock().unwrap().get(url).cloned();
        match response {
            Some(MockResponse::Page {
                bytes,
                content_type,
            }) => Ok(Fetched {
                bytes,
                content_type,
                final_url: url.to_string(),
            }),
            Some(MockResponse::Status(status)) => Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
            Some(MockResponse::Timeout) => Err(FetchError::Timeout {
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

/// Deterministic embedder deriving vectors from a content hash.
///
/// The same text always produces the same vector, which makes assertions
/// about re-embedding and ordering possible without a provider.
pub struct FakeEmbedder {
    dimension: usize,
}

impl FakeEmbedder {
    /// Create a fake embedder with the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for FakeEmbedder {
    fn default() -> Self {
        Self::new(1536)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let mut vector = Vec::with_capacity(self.dimension);
            let mut digest = Sha256::digest(text.as_bytes());
            'fill: loop {
                for byte in digest.iter() {
                    if vector.len() == self.dimension {
                        break 'fill;
                    }
                    vector.push(*byte as f32 / 255.0 - 0.5);
                }
                digest = Sha256::digest(digest);
            }
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

/// A document captured by [`MemoryDocumentStore`].
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: Uuid,
    pub content_type: Option<String>,
    pub chunks: Vec<String>,
    pub vectors: Vec<Vec<f32>>,
}

/// In-memory document store for inspection in tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<String, StoredDocument>>,
    upserts: AtomicUsize,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upserts performed.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Number of distinct documents stored.
    pub fn document_count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    /// Get a stored document by source URL.
    pub fn get(&self, source_url: &str) -> Option<StoredDocument> {
        self.documents.lock().unwrap().get(source_url).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert_document(
        &self,
        meta: &DocumentMeta,
        chunks: &[String],
        vectors: &[Vec<f32>],
    ) -> Result<Uuid, StoreError> {
        if chunks.len() != vectors.len() {
            return Err(StoreError::Mismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }

        let mut documents = self.documents.lock().unwrap();
        let id = documents
            .get(&meta.source_url)
            .map(|existing| existing.id)
            .unwrap_or_else(Uuid::new_v4);

        documents.insert(
            meta.source_url.clone(),
            StoredDocument {
                id,
                content_type: meta.content_type.clone(),
                chunks: chunks.to_vec(),
                vectors: vectors.to_vec(),
            },
        );
        self.upserts.fetch_add(1, Ordering::SeqCst);

        Ok(id)
    }
}
