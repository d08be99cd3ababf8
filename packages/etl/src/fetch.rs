//! HTTP content fetching.
//!
//! The [`Fetcher`] trait abstracts where bytes come from so the pipeline can
//! be driven by a real HTTP client in production and a mock in tests.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::FetchError;

/// A successfully fetched resource.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Raw response body
    pub bytes: Vec<u8>,
    /// Content type reported by the server (parameters stripped by [`crate::parse`])
    pub content_type: String,
    /// URL after redirects
    pub final_url: String,
}

/// Pluggable content fetching.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a single URL.
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError>;
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Maximum response body size in bytes
    pub max_bytes: usize,
    /// Maximum redirects to follow
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 10 * 1024 * 1024,
            max_redirects: 5,
        }
    }
}

/// HTTP fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    /// Create a fetcher with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        // Browser-like User-Agent to avoid bot detection on static sites
        let user_agent = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.9,*/*;q=0.8",
            ),
        );

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        let response = self.client.get(parsed).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Io {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        // Reject early when the server declares an oversized body
        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let final_url = response.url().to_string();

        // Accumulate the body chunk by chunk so a lying Content-Length
        // cannot blow past the limit.
        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Io {
                    url: url.to_string(),
                    source: e,
                }
            }
        })? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(Fetched {
            bytes: body,
            content_type,
            final_url,
        })
    }
}
