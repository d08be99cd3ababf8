//! # ETL stage library
//!
//! Content ingestion stages used by the job pipeline:
//!
//! ```text
//! FETCH → PARSE → CHUNK → EMBED → UPSERT
//!
//! 1. Fetcher pulls bytes from a URL            → Fetched
//! 2. parse_bytes converts bytes to plain text  → String
//! 3. chunk_text splits text for embedding      → Vec<String>
//! 4. Embedder turns chunks into vectors        → Vec<Vec<f32>>
//! 5. DocumentStore persists doc + chunks       → document id
//! ```
//!
//! Stages know nothing about jobs or scheduling: each is a pure function
//! or a small trait the caller composes. The trait seams (`Fetcher`,
//! `Embedder`, `DocumentStore`) exist so production implementations
//! (reqwest, an OpenAI-compatible endpoint, Postgres + pgvector) can be
//! swapped for the mocks in [`testing`].
//!
//! ## Modules
//!
//! - [`fetch`] - HTTP fetching with timeout and size limits
//! - [`parse`] - MIME-dispatched byte-to-text conversion
//! - [`chunk`] - pure text chunking
//! - [`embed`] - embedding provider trait + OpenAI-compatible client
//! - [`store`] - atomic document + chunk persistence
//! - [`error`] - typed per-stage errors
//! - [`testing`] - mock implementations

pub mod chunk;
pub mod embed;
pub mod error;
pub mod fetch;
pub mod parse;
pub mod store;
pub mod testing;

pub use chunk::{chunk_text, ChunkConfig};
pub use embed::{Embedder, OpenAiEmbedder};
pub use error::{EmbedError, FetchError, ParseError, StoreError};
pub use fetch::{FetchConfig, Fetched, Fetcher, HttpFetcher};
pub use parse::parse_bytes;
pub use store::{DocumentMeta, DocumentRecord, DocumentStore, PostgresDocumentStore};
