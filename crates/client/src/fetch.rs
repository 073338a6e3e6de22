//! Ranged streaming reads from the archive blob store.
//!
//! Container files are immutable and huge; a fetch reads exactly the
//! byte range named by a locator (`Range: bytes=offset..end`) and
//! yields chunks as they arrive, so decoding can begin before the
//! fetch completes. Access is anonymous. Every fetch passes the
//! governor first; a `RateLimited` denial is surfaced unchanged - the
//! retry decision belongs to the orchestrator.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, StatusCode, header};

use warchive_core::Error;
use warchive_core::config::AppConfig;
use warchive_core::records::Locator;

use crate::governor::Governor;

/// Chunk stream for one ranged fetch.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Progress callback: (bytes so far, total expected).
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Source of container byte ranges, mockable for tests.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch(&self, locator: &Locator) -> Result<ByteStream, Error>;
}

/// Streaming byte-range fetcher for the archive blob store.
pub struct BlobFetcher {
    http: Client,
    base_url: String,
    mirror_url: Option<String>,
    max_fetch_bytes: u64,
    governor: Arc<Governor>,
}

impl BlobFetcher {
    pub fn new(cfg: &AppConfig, governor: Arc<Governor>) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&cfg.user_agent)
            .timeout(cfg.blob.timeout())
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let base =
            url::Url::parse(&cfg.blob.base_url).map_err(|e| Error::Config(format!("blob.base_url: {e}")))?;
        let mirror = cfg
            .blob
            .mirror_url
            .as_ref()
            .map(|u| url::Url::parse(u).map_err(|e| Error::Config(format!("blob.mirror_url: {e}"))))
            .transpose()?;

        Ok(Self {
            http,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            mirror_url: mirror.map(|u| u.as_str().trim_end_matches('/').to_string()),
            max_fetch_bytes: cfg.blob.max_fetch_bytes,
            governor,
        })
    }

    async fn request_range(&self, endpoint: &str, locator: &Locator) -> Result<reqwest::Response, Error> {
        let url = format!("{}/{}", endpoint, locator.container_id);
        let range = format!("bytes={}-{}", locator.offset, locator.end_inclusive());

        let response = self
            .http
            .get(&url)
            .header(header::RANGE, range)
            .send()
            .await
            .map_err(|e| classify_request_error(e, locator))?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => Ok(response),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::RANGE_NOT_SATISFIABLE => {
                Err(Error::NotFound { context: locator.to_string() })
            }
            s if s.is_server_error() => {
                Err(Error::Transient { context: format!("{locator}: status {}", s.as_u16()), attempts: 1 })
            }
            s => Err(Error::Http { status: s.as_u16(), context: locator.to_string() }),
        }
    }

    /// Fetch exactly the locator's byte range as a chunk stream.
    ///
    /// On a transient primary failure the configured mirror is tried
    /// once before the error surfaces. At most `locator.length` bytes
    /// are yielded even if the server over-delivers; every chunk is
    /// metered through the governor's byte accounting.
    pub async fn fetch(&self, locator: &Locator) -> Result<ByteStream, Error> {
        if locator.length == 0 {
            return Err(Error::InvalidQuery { context: format!("{locator}: zero-length range") });
        }
        if locator.length > self.max_fetch_bytes {
            return Err(Error::InvalidQuery {
                context: format!("{locator}: range exceeds max_fetch_bytes {}", self.max_fetch_bytes),
            });
        }

        self.governor.acquire(1).await?;

        let response = match self.request_range(&self.base_url, locator).await {
            Ok(response) => response,
            Err(e) if e.is_transient() && self.mirror_url.is_some() => {
                let mirror = self.mirror_url.as_deref().unwrap_or_default();
                tracing::warn!(locator = %locator, error = %e, "primary fetch failed; trying mirror");
                self.request_range(mirror, locator).await?
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(locator = %locator, "streaming byte range");

        let context = locator.to_string();
        let governor = Arc::clone(&self.governor);
        let stream = response
            .bytes_stream()
            .map(move |item| item.map_err(|e| classify_stream_error(e, &context)))
            .scan(locator.length, move |remaining, item| {
                let out = match item {
                    Ok(mut chunk) => {
                        if *remaining == 0 {
                            return futures_util::future::ready(None);
                        }
                        if chunk.len() as u64 > *remaining {
                            chunk.truncate(*remaining as usize);
                        }
                        *remaining -= chunk.len() as u64;
                        governor.record_bytes(chunk.len() as u64);
                        Some(Ok(chunk))
                    }
                    Err(e) => Some(Err(e)),
                };
                futures_util::future::ready(out)
            });

        Ok(Box::pin(stream))
    }

    /// Collect a ranged fetch into one buffer, reporting progress as
    /// chunks arrive.
    pub async fn fetch_all(&self, locator: &Locator, on_progress: Option<&ProgressFn>) -> Result<Bytes, Error> {
        let mut stream = self.fetch(locator).await?;
        let mut out = Vec::with_capacity(locator.length as usize);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.extend_from_slice(&chunk);
            if let Some(progress) = on_progress {
                progress(out.len() as u64, locator.length);
            }
        }

        Ok(Bytes::from(out))
    }
}

#[async_trait]
impl BlobSource for BlobFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<ByteStream, Error> {
        BlobFetcher::fetch(self, locator).await
    }
}

fn classify_request_error(e: reqwest::Error, locator: &Locator) -> Error {
    if e.is_timeout() {
        Error::Timeout { context: locator.to_string() }
    } else {
        Error::Transient { context: format!("{locator}: {e}"), attempts: 1 }
    }
}

fn classify_stream_error(e: reqwest::Error, context: &str) -> Error {
    if e.is_timeout() {
        Error::Timeout { context: context.to_string() }
    } else {
        Error::Transient { context: format!("{context}: {e}"), attempts: 1 }
    }
}
