//! Archive index client.
//!
//! Resolves logical queries (exact URL, prefix, or whole domain within
//! a named snapshot) to locators via the remote index service. The
//! service is eventually consistent and rate limited, so every request
//! passes the governor, a per-endpoint circuit breaker, and the
//! transient-retry driver. The snapshot listing changes rarely and is
//! cached aggressively, with the last good copy served while the
//! service is down.

pub mod response;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::Instant;

use warchive_core::Error;
use warchive_core::config::AppConfig;
use warchive_core::records::{IndexRecord, SnapshotInfo};

use crate::breaker::CircuitBreaker;
use crate::governor::Governor;
use crate::retry::{self, RetryPolicy};
use response::{RawCollection, RawIndexLine};

/// Query match mode. Always an explicit tag, never inferred from the
/// query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Exact URL match.
    Exact,
    /// Every capture whose URL starts with the query.
    Prefix,
    /// Every capture under the domain, subdomains included.
    Domain,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Exact => "exact",
            QueryKind::Prefix => "prefix",
            QueryKind::Domain => "domain",
        }
    }

    /// Wire value for the index's match-type parameter; exact match is
    /// the service default and sends none.
    fn match_type_param(&self) -> Option<&'static str> {
        match self {
            QueryKind::Exact => None,
            QueryKind::Prefix => Some("prefix"),
            QueryKind::Domain => Some("domain"),
        }
    }
}

/// One logical index lookup.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub kind: QueryKind,
    pub url: String,
    pub snapshot_id: String,
    pub limit: u32,
    /// Opaque pagination cursor from a previous page.
    pub cursor: Option<String>,
}

impl SearchQuery {
    pub fn exact(url: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self { kind: QueryKind::Exact, url: url.into(), snapshot_id: snapshot_id.into(), limit: 100, cursor: None }
    }

    pub fn domain(domain: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Domain,
            url: domain.into(),
            snapshot_id: snapshot_id.into(),
            limit: 100,
            cursor: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// One page of index results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub records: Vec<IndexRecord>,
    /// Cursor for the next page, or `None` when pagination is done.
    pub next_cursor: Option<String>,
}

/// Source of index lookups, mockable for tests.
#[async_trait]
pub trait IndexSource: Send + Sync {
    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, Error>;
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, Error>;
}

struct CachedSnapshots {
    list: Vec<SnapshotInfo>,
    fetched_at: Instant,
}

/// Client for the archive index service.
pub struct IndexClient {
    http: Client,
    base_url: String,
    max_results: u32,
    snapshot_ttl: Duration,
    governor: Arc<Governor>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    snapshots: tokio::sync::Mutex<Option<CachedSnapshots>>,
}

impl IndexClient {
    pub fn new(cfg: &AppConfig, governor: Arc<Governor>) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&cfg.user_agent)
            .timeout(cfg.index.timeout())
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let base = url::Url::parse(&cfg.index.base_url)
            .map_err(|e| Error::Config(format!("index.base_url: {e}")))?;
        let base_url = base.as_str().trim_end_matches('/').to_string();
        let breaker =
            CircuitBreaker::new(base_url.clone(), cfg.rate.breaker_threshold, cfg.rate.breaker_cooldown());

        Ok(Self {
            http,
            base_url,
            max_results: cfg.index.max_results,
            snapshot_ttl: cfg.index.snapshot_ttl(),
            governor,
            breaker,
            retry: RetryPolicy::from(&cfg.rate),
            snapshots: tokio::sync::Mutex::new(None),
        })
    }

    /// List the archive's snapshots.
    ///
    /// The listing is cached for `snapshot_ttl`; on remote failure the
    /// last successfully cached list is served (however stale), and
    /// only with no cached copy at all does the call fail with
    /// `IndexUnavailable`.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, Error> {
        let mut cached = self.snapshots.lock().await;

        if let Some(existing) = cached.as_ref()
            && existing.fetched_at.elapsed() < self.snapshot_ttl
        {
            return Ok(existing.list.clone());
        }

        match self.fetch_snapshots().await {
            Ok(list) => {
                tracing::info!(count = list.len(), "refreshed snapshot listing");
                *cached = Some(CachedSnapshots { list: list.clone(), fetched_at: Instant::now() });
                Ok(list)
            }
            Err(e) => match cached.as_ref() {
                Some(stale) => {
                    tracing::warn!(error = %e, "snapshot listing refresh failed; serving last good copy");
                    Ok(stale.list.clone())
                }
                None => Err(Error::IndexUnavailable { context: format!("snapshot listing: {e}") }),
            },
        }
    }

    /// The newest snapshot by date.
    pub async fn latest_snapshot(&self) -> Result<SnapshotInfo, Error> {
        let mut snapshots = self.list_snapshots().await?;
        snapshots.sort_by_key(|s| s.date);
        snapshots
            .pop()
            .ok_or_else(|| Error::IndexUnavailable { context: "snapshot listing is empty".to_string() })
    }

    async fn fetch_snapshots(&self) -> Result<Vec<SnapshotInfo>, Error> {
        let url = format!("{}/collinfo.json", self.base_url);

        retry::run(&self.retry, &self.breaker, "list snapshots", |_| async {
            self.governor.acquire(1).await?;

            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| classify_request_error(e, "snapshot listing"))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(Error::Transient {
                    context: format!("snapshot listing: status {}", status.as_u16()),
                    attempts: 1,
                });
            }
            if !status.is_success() {
                return Err(Error::Http { status: status.as_u16(), context: "snapshot listing".to_string() });
            }

            let collections: Vec<RawCollection> = response
                .json()
                .await
                .map_err(|e| Error::Serialize { context: format!("snapshot listing: {e}") })?;

            Ok(collections.into_iter().map(SnapshotInfo::from).collect())
        })
        .await
    }

    /// Issue one paginated index query.
    ///
    /// A full page yields `next_cursor`; a short page ends pagination.
    /// Unparseable response lines are skipped with a warning rather
    /// than failing the page.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchPage, Error> {
        let limit = query.limit.min(self.max_results);
        let page: u64 = match &query.cursor {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| Error::InvalidQuery { context: format!("bad pagination cursor {cursor:?}") })?,
            None => 0,
        };

        let url = format!("{}/{}-index", self.base_url, query.snapshot_id);

        let limit_param = limit.to_string();
        let page_param = page.to_string();

        let body = retry::run(&self.retry, &self.breaker, "index search", |_| async {
            self.governor.acquire(1).await?;

            let mut request = self.http.get(&url).query(&[
                ("url", query.url.as_str()),
                ("output", "json"),
                ("limit", limit_param.as_str()),
                ("page", page_param.as_str()),
            ]);
            if let Some(match_type) = query.kind.match_type_param() {
                request = request.query(&[("matchType", match_type)]);
            }

            let response = request.send().await.map_err(|e| classify_request_error(e, &query.url))?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(Error::NotFound {
                    context: format!("{} in {}", query.url, query.snapshot_id),
                });
            }
            if status.is_server_error() {
                return Err(Error::Transient {
                    context: format!("index search {}: status {}", query.url, status.as_u16()),
                    attempts: 1,
                });
            }
            if status.is_client_error() {
                return Err(Error::InvalidQuery {
                    context: format!("index search {}: status {}", query.url, status.as_u16()),
                });
            }

            response
                .text()
                .await
                .map_err(|e| classify_request_error(e, &query.url))
        })
        .await?;

        let records = parse_index_lines(&body);
        tracing::debug!(
            query = %query.url,
            snapshot = %query.snapshot_id,
            count = records.len(),
            "index search page"
        );

        let next_cursor = if records.len() as u32 >= limit { Some((page + 1).to_string()) } else { None };

        Ok(SearchPage { records, next_cursor })
    }

    /// Drain pagination into a bounded record list.
    pub async fn search_all(&self, query: &SearchQuery, max_records: usize) -> Result<Vec<IndexRecord>, Error> {
        let mut out = Vec::new();
        let mut cursor = query.cursor.clone();

        loop {
            let page = self.search(&query.clone().with_cursor(cursor)).await?;
            out.extend(page.records);
            if out.len() >= max_records {
                out.truncate(max_records);
                return Ok(out);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(out),
            }
        }
    }
}

#[async_trait]
impl IndexSource for IndexClient {
    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, Error> {
        IndexClient::list_snapshots(self).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, Error> {
        IndexClient::search(self, query).await
    }
}

fn classify_request_error(e: reqwest::Error, context: &str) -> Error {
    if e.is_timeout() {
        Error::Timeout { context: context.to_string() }
    } else {
        Error::Transient { context: format!("{context}: {e}"), attempts: 1 }
    }
}

fn parse_index_lines(body: &str) -> Vec<IndexRecord> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let raw: RawIndexLine = match serde_json::from_str(line) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unparseable index line");
                    return None;
                }
            };
            match raw.normalize() {
                Ok(record) => Some(record),
                Err(reason) => {
                    tracing::warn!(reason, "skipping unnormalizable index line");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_kind_is_explicit() {
        assert_eq!(QueryKind::Exact.match_type_param(), None);
        assert_eq!(QueryKind::Prefix.match_type_param(), Some("prefix"));
        assert_eq!(QueryKind::Domain.match_type_param(), Some("domain"));
    }

    #[test]
    fn test_query_builders() {
        let query = SearchQuery::exact("http://example.com/", "snap-1").with_limit(10);
        assert_eq!(query.kind, QueryKind::Exact);
        assert_eq!(query.limit, 10);
        assert!(query.cursor.is_none());

        let query = SearchQuery::domain("example.com", "snap-1").with_cursor(Some("2".to_string()));
        assert_eq!(query.kind, QueryKind::Domain);
        assert_eq!(query.cursor.as_deref(), Some("2"));
    }

    #[test]
    fn test_parse_index_lines_skips_garbage() {
        let body = concat!(
            r#"{"url":"http://example.com/","timestamp":"20240210123456","status":"200","#,
            r#""mime":"text/html","length":"500","offset":"1000","filename":"c1.warc.gz"}"#,
            "\n",
            "this line is not json\n",
            "\n",
            r#"{"url":"http://example.com/b","timestamp":"20240211000000","status":"301","#,
            r#""mime":"text/html","length":"300","offset":"9000","filename":"c2.warc.gz"}"#,
            "\n",
        );
        let records = parse_index_lines(body);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].locator.offset, 1000);
        assert_eq!(records[1].status_code, Some(301));
    }

    #[tokio::test]
    async fn test_bad_cursor_rejected_without_network() {
        let cfg = AppConfig::default();
        let governor = Arc::new(Governor::new(&cfg.rate));
        let client = IndexClient::new(&cfg, governor).unwrap();

        let query = SearchQuery::exact("http://example.com/", "snap-1").with_cursor(Some("not-a-page".into()));
        let result = client.search(&query).await;
        assert!(matches!(result, Err(Error::InvalidQuery { .. })));
    }
}
