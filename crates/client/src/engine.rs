//! The archive read-path facade.
//!
//! Wires index lookup, ranged fetch, and container decode behind the
//! tiered cache. This is the interface downstream consumers (analysis,
//! export) call: `resolve` for logical queries, `fetch_one` for a
//! known locator. Both are transparently cached and safe under
//! arbitrary concurrent callers; single-flight in the cache manager
//! keeps duplicate cost-bearing downloads from ever being issued.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use warchive_core::Error;
use warchive_core::cache::{CacheStats, CacheValue, RemoteTier, TieredCache, cache_key};
use warchive_core::config::AppConfig;
use warchive_core::records::{ContainerRecord, Locator, RateBudget, SnapshotInfo};

use crate::decode::decode_stream;
use crate::fetch::{BlobFetcher, BlobSource};
use crate::governor::Governor;
use crate::index::{IndexClient, IndexSource, SearchQuery};
use crate::remote::HttpRemoteTier;

/// Default bound on concurrent record fetches within one resolve.
const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Engine-level counters for diagnostics and cost reporting.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub budget: RateBudget,
    pub bytes_downloaded: u64,
    pub estimated_cost_usd: f64,
}

/// Archive access engine: index -> fetch -> decode behind the cache.
pub struct ArchiveEngine<I = IndexClient, B = BlobFetcher> {
    index: I,
    blobs: B,
    cache: Arc<TieredCache>,
    governor: Arc<Governor>,
    fetch_concurrency: usize,
}

impl ArchiveEngine<IndexClient, BlobFetcher> {
    /// Build the fully wired engine from configuration.
    ///
    /// The remote tier is probed once; if unreachable the engine runs
    /// memory+disk-only.
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, Error> {
        let governor = Arc::new(Governor::new(&cfg.rate));

        let remote: Option<Arc<dyn RemoteTier>> = match &cfg.cache.remote_url {
            Some(url) => {
                let tier = HttpRemoteTier::new(url, Duration::from_secs(5), &cfg.user_agent)?;
                if tier.probe().await {
                    tracing::info!(url = %url, "remote cache tier enabled");
                    Some(Arc::new(tier))
                } else {
                    tracing::warn!(url = %url, "remote cache tier unreachable; running memory+disk-only");
                    None
                }
            }
            None => None,
        };

        let cache = Arc::new(TieredCache::open(&cfg.cache, remote).await?);
        let index = IndexClient::new(cfg, Arc::clone(&governor))?;
        let blobs = BlobFetcher::new(cfg, Arc::clone(&governor))?;

        Ok(Self { index, blobs, cache, governor, fetch_concurrency: DEFAULT_FETCH_CONCURRENCY })
    }
}

impl<I, B> ArchiveEngine<I, B>
where
    I: IndexSource,
    B: BlobSource,
{
    /// Assemble an engine from parts; tests substitute mock sources.
    pub fn new(index: I, blobs: B, cache: Arc<TieredCache>, governor: Arc<Governor>) -> Self {
        Self { index, blobs, cache, governor, fetch_concurrency: DEFAULT_FETCH_CONCURRENCY }
    }

    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = concurrency.max(1);
        self
    }

    /// List the archive's snapshots.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, Error> {
        self.index.list_snapshots().await
    }

    /// Resolve a logical query to decoded container records.
    ///
    /// On a cache miss this searches the index, then fetches and
    /// decodes every located record with bounded concurrency.
    /// Per-record `NotFound`/`MalformedRecord` failures are skipped so
    /// one bad record yields a partial result, not a failed query;
    /// anything else fails the resolve.
    pub async fn resolve(&self, query: &SearchQuery) -> Result<Vec<ContainerRecord>, Error> {
        let key = cache_key(
            "resolve",
            &query.snapshot_id,
            &[query.kind.as_str(), &query.url, &query.limit.to_string()],
        );

        let entry = self
            .cache
            .get_or_populate(&key, None, || async {
                let page = self.index.search(query).await?;
                tracing::info!(
                    query = %query.url,
                    snapshot = %query.snapshot_id,
                    located = page.records.len(),
                    "resolving index records"
                );

                let fetches = page.records.into_iter().map(|record| self.fetch_one(record.locator));
                let results: Vec<Result<ContainerRecord, Error>> =
                    futures_util::stream::iter(fetches).buffered(self.fetch_concurrency).collect().await;

                let mut records = Vec::new();
                for result in results {
                    match result {
                        Ok(record) => records.push(record),
                        Err(e @ (Error::MalformedRecord { .. } | Error::NotFound { .. })) => {
                            tracing::warn!(error = %e, "skipping unresolvable record");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(CacheValue::Records(records))
            })
            .await?;

        match entry.value {
            CacheValue::Records(records) => Ok(records),
            CacheValue::Record(record) => Ok(vec![record]),
            CacheValue::Bytes(_) => {
                self.cache.invalidate(&key).await?;
                Err(Error::CacheCorruption { key })
            }
        }
    }

    /// Fetch and decode the single record a locator points at.
    pub async fn fetch_one(&self, locator: Locator) -> Result<ContainerRecord, Error> {
        let key = cache_key(
            "record",
            &locator.container_id,
            &[&locator.offset.to_string(), &locator.length.to_string()],
        );

        let entry = self
            .cache
            .get_or_populate(&key, None, || async {
                let record = self.fetch_decode_first(&locator).await?;
                Ok(CacheValue::Record(record))
            })
            .await?;

        match entry.value {
            CacheValue::Record(record) => Ok(record),
            _ => {
                self.cache.invalidate(&key).await?;
                Err(Error::CacheCorruption { key })
            }
        }
    }

    /// Run the fetch -> decode pipeline and return the first complete
    /// record in the range.
    async fn fetch_decode_first(&self, locator: &Locator) -> Result<ContainerRecord, Error> {
        let stream = self.blobs.fetch(locator).await?;
        let mut decoded = std::pin::pin!(decode_stream(stream));

        let mut malformed: Option<Error> = None;
        while let Some(item) = decoded.next().await {
            match item {
                Ok(record) => return Ok(record),
                Err(e @ Error::MalformedRecord { .. }) => {
                    malformed = Some(e);
                }
                Err(other) => return Err(other),
            }
        }

        Err(malformed.unwrap_or_else(|| Error::NotFound { context: locator.to_string() }))
    }

    /// Remove one cached resolve/record entry.
    pub async fn invalidate(&self, key: &str) -> Result<(), Error> {
        self.cache.invalidate(key).await
    }

    /// Spawn the cache's background TTL sweeper.
    pub fn start_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.cache.start_sweeper(interval)
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub async fn stats(&self) -> Result<EngineStats, Error> {
        Ok(EngineStats {
            cache: self.cache.stats().await?,
            budget: self.governor.budget(),
            bytes_downloaded: self.governor.bytes_total(),
            estimated_cost_usd: self.governor.estimated_cost_usd(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use crate::fetch::ByteStream;
    use crate::index::SearchPage;
    use warchive_core::config::{CacheConfig, RateConfig};
    use warchive_core::records::IndexRecord;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn member(uri: &str, payload: &[u8]) -> Vec<u8> {
        let mut raw = format!(
            "WARC/1.0\r\nWARC-Type: response\r\nWARC-Target-URI: {uri}\r\n\
             WARC-Date: 2024-02-10T12:34:56Z\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        )
        .into_bytes();
        raw.extend_from_slice(payload);
        raw.extend_from_slice(b"\r\n\r\n");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        encoder.finish().unwrap()
    }

    fn index_record(url: &str, locator: Locator) -> IndexRecord {
        IndexRecord {
            url: url.to_string(),
            capture_timestamp: Utc::now(),
            status_code: Some(200),
            mime_type: "text/html".to_string(),
            digest: None,
            locator,
            extra: Default::default(),
        }
    }

    struct MockIndex {
        records: Vec<IndexRecord>,
        searches: AtomicUsize,
    }

    #[async_trait]
    impl IndexSource for MockIndex {
        async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, Error> {
            Ok(Vec::new())
        }

        async fn search(&self, _query: &SearchQuery) -> Result<SearchPage, Error> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            Ok(SearchPage { records: self.records.clone(), next_cursor: None })
        }
    }

    struct MockBlobs {
        ranges: HashMap<String, Vec<u8>>,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BlobSource for MockBlobs {
        async fn fetch(&self, locator: &Locator) -> Result<ByteStream, Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.ranges.get(&locator.container_id) {
                Some(data) => {
                    let chunk = Bytes::from(data.clone());
                    Ok(Box::pin(futures_util::stream::iter(vec![Ok(chunk)])))
                }
                None => Err(Error::NotFound { context: locator.to_string() }),
            }
        }
    }

    async fn engine_with(
        records: Vec<IndexRecord>, ranges: HashMap<String, Vec<u8>>,
    ) -> (tempfile::TempDir, ArchiveEngine<MockIndex, MockBlobs>, Arc<AtomicUsize>) {
        let dir = tempfile::tempdir().unwrap();
        let cache_cfg = CacheConfig { dir: dir.path().to_path_buf(), ..Default::default() };
        let cache = Arc::new(TieredCache::open(&cache_cfg, None).await.unwrap());
        let governor = Arc::new(Governor::new(&RateConfig::default()));

        let fetches = Arc::new(AtomicUsize::new(0));
        let index = MockIndex { records, searches: AtomicUsize::new(0) };
        let blobs = MockBlobs { ranges, fetches: Arc::clone(&fetches) };

        (dir, ArchiveEngine::new(index, blobs, cache, governor), fetches)
    }

    #[tokio::test]
    async fn test_resolve_caches_across_calls() {
        init_tracing();
        let locator = Locator::new("c1", 1000, 500);
        let payload = vec![0x42u8; 200];
        let mut ranges = HashMap::new();
        ranges.insert("c1".to_string(), member("http://example.com/", &payload));

        let (_dir, engine, fetches) =
            engine_with(vec![index_record("http://example.com/", locator)], ranges).await;

        let query = SearchQuery::exact("example.com/", "snap-1");
        let records = engine.resolve(&query).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_uri(), Some("http://example.com/"));
        assert_eq!(records[0].payload.len(), 200);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // identical query answers from cache without touching the fetcher
        let records = engine.resolve(&query).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_one_caches_by_locator() {
        let locator = Locator::new("c1", 0, 100);
        let mut ranges = HashMap::new();
        ranges.insert("c1".to_string(), member("http://example.com/page", b"body"));

        let (_dir, engine, fetches) = engine_with(Vec::new(), ranges).await;

        let record = engine.fetch_one(locator.clone()).await.unwrap();
        assert_eq!(record.target_uri(), Some("http://example.com/page"));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        engine.fetch_one(locator).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_partial_result_on_bad_record() {
        let good = Locator::new("good", 0, 100);
        let bad = Locator::new("bad", 0, 100);
        let mut ranges = HashMap::new();
        ranges.insert("good".to_string(), member("http://example.com/ok", b"fine"));
        ranges.insert("bad".to_string(), b"not a gzip member at all".to_vec());

        let (_dir, engine, _) = engine_with(
            vec![index_record("http://example.com/ok", good), index_record("http://example.com/broken", bad)],
            ranges,
        )
        .await;

        let records = engine.resolve(&SearchQuery::domain("example.com", "snap-1")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_uri(), Some("http://example.com/ok"));
    }

    #[tokio::test]
    async fn test_resolve_missing_container_is_partial() {
        let present = Locator::new("here", 0, 100);
        let absent = Locator::new("gone", 0, 100);
        let mut ranges = HashMap::new();
        ranges.insert("here".to_string(), member("http://example.com/here", b"yes"));

        let (_dir, engine, _) = engine_with(
            vec![index_record("http://example.com/here", present), index_record("http://example.com/gone", absent)],
            ranges,
        )
        .await;

        let records = engine.resolve(&SearchQuery::domain("example.com", "snap-1")).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_one_not_found_surfaces() {
        let (_dir, engine, _) = engine_with(Vec::new(), HashMap::new()).await;
        let result = engine.fetch_one(Locator::new("missing", 0, 100)).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_fetch_one_all_malformed_surfaces_malformed() {
        let mut ranges = HashMap::new();
        ranges.insert("junk".to_string(), b"garbage bytes, no member anywhere".to_vec());
        let (_dir, engine, _) = engine_with(Vec::new(), ranges).await;

        let result = engine.fetch_one(Locator::new("junk", 0, 100)).await;
        assert!(matches!(result, Err(Error::MalformedRecord { .. })));
    }

    #[tokio::test]
    async fn test_stats_reflect_activity() {
        let locator = Locator::new("c1", 0, 100);
        let mut ranges = HashMap::new();
        ranges.insert("c1".to_string(), member("http://example.com/", b"body"));

        let (_dir, engine, _) = engine_with(vec![index_record("http://example.com/", locator)], ranges).await;
        engine.resolve(&SearchQuery::exact("example.com/", "snap-1")).await.unwrap();

        let stats = engine.stats().await.unwrap();
        assert!(stats.cache.misses >= 1);
        assert!(stats.cache.disk_bytes > 0);
    }
}
