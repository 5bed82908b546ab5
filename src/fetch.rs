use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("imgcache/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("source fetch failed from {url}: {status}")]
    UpstreamStatus { status: StatusCode, url: String },
    #[error("source larger than {limit} bytes: {url}")]
    TooLarge { limit: usize, url: String },
    #[error("source fetch failed from {url}: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Outbound retrieval of source images.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedSource, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT)
            .build()
            .context("build reqwest client")?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedSource, FetchError> {
        let parsed = validate_source_url(url)?;
        let upstream = |source| FetchError::Upstream {
            url: url.to_string(),
            source,
        };
        let mut response = self.client.get(parsed).send().await.map_err(upstream)?;
        if !response.status().is_success() {
            return Err(FetchError::UpstreamStatus {
                status: response.status(),
                url: url.to_string(),
            });
        }
        let too_large = || FetchError::TooLarge {
            limit: self.max_bytes,
            url: url.to_string(),
        };
        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(too_large());
            }
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut buffer = BytesMut::with_capacity(std::cmp::min(self.max_bytes, 64 * 1024));
        let mut total = 0usize;
        while let Some(chunk) = response.chunk().await.map_err(upstream)? {
            total = total.saturating_add(chunk.len());
            if total > self.max_bytes {
                return Err(too_large());
            }
            buffer.extend_from_slice(&chunk);
        }
        debug!(url = %url, size = total, "fetched source");
        Ok(FetchedSource {
            bytes: buffer.freeze(),
            content_type,
        })
    }
}

fn validate_source_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}
