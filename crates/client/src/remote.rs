//! HTTP implementation of the shared remote cache tier.
//!
//! Speaks a minimal key-value protocol against an external service:
//! `GET/PUT/DELETE {base}/{key}`, with the entry TTL passed as a query
//! parameter on writes. The remote tier is best-effort; the manager
//! treats every failure as a miss, and the engine probes reachability
//! once at startup to decide whether to use the tier at all.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};

use warchive_core::Error;
use warchive_core::cache::RemoteTier;

/// Remote key-value tier over plain HTTP.
pub struct HttpRemoteTier {
    http: Client,
    base_url: String,
}

impl HttpRemoteTier {
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    /// Startup reachability probe. Any HTTP answer (even 404) counts
    /// as reachable; only transport failures report the tier down.
    pub async fn probe(&self) -> bool {
        match self.http.get(&self.base_url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(base_url = %self.base_url, error = %e, "remote tier unreachable");
                false
            }
        }
    }
}

#[async_trait]
impl RemoteTier for HttpRemoteTier {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        let response = self
            .http
            .get(self.key_url(key))
            .send()
            .await
            .map_err(|e| Error::Transient { context: format!("remote get {key}: {e}"), attempts: 1 })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Transient { context: format!("remote get {key}: {e}"), attempts: 1 })?;
                Ok(Some(bytes))
            }
            s => Err(Error::Http { status: s.as_u16(), context: format!("remote get {key}") }),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), Error> {
        let response = self
            .http
            .put(self.key_url(key))
            .query(&[("ttl", ttl.as_secs().to_string())])
            .body(value)
            .send()
            .await
            .map_err(|e| Error::Transient { context: format!("remote set {key}: {e}"), attempts: 1 })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Http { status: status.as_u16(), context: format!("remote set {key}") })
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let response = self
            .http
            .delete(self.key_url(key))
            .send()
            .await
            .map_err(|e| Error::Transient { context: format!("remote delete {key}: {e}"), attempts: 1 })?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::Http { status: status.as_u16(), context: format!("remote delete {key}") })
        }
    }
}
