//! Typed errors for the ingestion stages.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match
//! on the failure and decide whether a retry makes sense.

use thiserror::Error;

/// Errors that can occur while fetching content over HTTP.
#[derive(Debug, Error)]
pub enum FetchError {
    /// URL could not be parsed or has an unsupported scheme
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Request exceeded the configured timeout
    #[error("timeout fetching: {url}")]
    Timeout { url: String },

    /// Response body exceeded the configured size limit
    #[error("response too large: {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },

    /// Upstream returned a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Connection, DNS, or transport failure
    #[error("I/O error fetching {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Timeouts, transport failures, and 5xx responses are transient;
    /// 4xx responses, oversized bodies, and bad URLs are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Io { .. } => true,
            FetchError::HttpStatus { status, .. } => *status >= 500,
            FetchError::InvalidUrl { .. }
            | FetchError::TooLarge { .. }
            | FetchError::Client(_) => false,
        }
    }
}

/// Errors that can occur while converting fetched bytes to text.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Document claimed to be JSON but did not parse
    #[error("malformed JSON document: {0}")]
    Json(#[from] serde_json::Error),

    /// Document claimed to be XML but did not parse
    #[error("malformed XML document: {0}")]
    Xml(String),
}

/// Errors from an embedding provider.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Provider rejected or failed the request
    #[error("embedding provider error: {message}")]
    Provider {
        message: String,
        /// Permanent errors (bad request, invalid model) must not be retried
        permanent: bool,
    },

    /// Transport-level failure talking to the provider
    #[error("embedding request failed: {0}")]
    Http(#[source] reqwest::Error),

    /// Provider returned a different number of vectors than inputs
    #[error("provider returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

impl EmbedError {
    /// Whether the failure is permanent (retrying is pointless).
    pub fn is_permanent(&self) -> bool {
        matches!(self, EmbedError::Provider { permanent: true, .. })
    }
}

/// Errors from the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),

    /// Caller passed mismatched chunk and vector slices
    #[error("chunk/vector count mismatch: {chunks} chunks, {vectors} vectors")]
    Mismatch { chunks: usize, vectors: usize },

    /// A vector's dimension does not match the store's configured dimension
    #[error("embedding dimension {got} does not match store dimension {expected}")]
    Dimension { expected: usize, got: usize },
}
