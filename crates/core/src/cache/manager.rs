//! Tiered cache manager.
//!
//! The central read-path orchestrator: checks memory, then disk, then
//! the optional remote tier, promoting hits into every faster tier.
//! Misses are populated through `get_or_populate`, which collapses
//! concurrent callers for the same key into one underlying populate
//! call (single-flight) so a cost-bearing download never runs twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OnceCell};

use super::disk::DiskTier;
use super::entry::{CacheEntry, CacheStats, CacheValue, Tier};
use super::memory::MemoryTier;
use super::remote::RemoteTier;
use crate::Error;
use crate::config::CacheConfig;

/// Shared in-flight populate result. The cell guarantees the populate
/// future runs at most once; every waiter clones the same outcome.
type Flight = Arc<OnceCell<Result<CacheValue, Error>>>;

/// Multi-tier cache manager.
pub struct TieredCache {
    memory: MemoryTier,
    disk: DiskTier,
    remote: Option<Arc<dyn RemoteTier>>,
    default_ttl: Duration,
    remote_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    flights: Mutex<HashMap<String, Flight>>,
}

impl TieredCache {
    /// Open the cache tiers described by `cfg`.
    ///
    /// `remote` is the optional shared tier; pass `None` to run
    /// memory+disk-only.
    pub async fn open(cfg: &CacheConfig, remote: Option<Arc<dyn RemoteTier>>) -> Result<Self, Error> {
        let disk = DiskTier::open(&cfg.dir, cfg.disk_max_bytes).await?;
        Ok(Self {
            memory: MemoryTier::new(cfg.memory_max_bytes),
            disk,
            remote,
            default_ttl: cfg.ttl(),
            remote_ttl: cfg.remote_ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            flights: Mutex::new(HashMap::new()),
        })
    }

    /// Look up a key across all tiers, promoting a hit into every
    /// faster tier before returning it.
    ///
    /// A corrupt disk entry is evicted and the lookup continues as a
    /// miss; remote tier failures degrade to a miss with a warning.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        if let Some((value, inserted_at)) = self.memory.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, "cache HIT (memory)");
            return Ok(Some(self.entry(key, value, Tier::Memory, inserted_at)));
        }

        match self.disk.get(key).await {
            Ok(Some((raw, created_at))) => match serde_json::from_slice::<CacheValue>(&raw) {
                Ok(value) => {
                    let stored = self.memory.insert(key, value.clone(), raw.len() as u64, self.default_ttl);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key, "cache HIT (disk)");
                    let tier = if stored { Tier::Memory } else { Tier::Disk };
                    return Ok(Some(self.entry(key, value, tier, created_at)));
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "disk entry undecodable; evicting");
                    self.disk.remove(key).await?;
                }
            },
            Ok(None) => {}
            Err(Error::CacheCorruption { .. }) => {
                // entry already evicted by the disk tier; read continues as a miss
            }
            Err(e) => return Err(e),
        }

        if let Some(remote) = &self.remote {
            match remote.get(key).await {
                Ok(Some(raw)) => match serde_json::from_slice::<CacheValue>(&raw) {
                    Ok(value) => {
                        if let Err(e) = self.disk.insert(key, &raw, self.default_ttl).await {
                            tracing::warn!(key, error = %e, "failed to promote remote hit to disk");
                        }
                        let stored = self.memory.insert(key, value.clone(), raw.len() as u64, self.default_ttl);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(key, "cache HIT (remote)");
                        let tier = if stored { Tier::Memory } else { Tier::Disk };
                        return Ok(Some(self.entry(key, value, tier, Utc::now())));
                    }
                    Err(e) => tracing::warn!(key, error = %e, "remote entry undecodable; ignoring"),
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(key, error = %e, "remote tier get failed"),
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key, "cache MISS");
        Ok(None)
    }

    /// Return the cached entry for `key`, or run `populate` to produce
    /// it, storing the result in every tier.
    ///
    /// Concurrent callers for the same key observe single-flight
    /// semantics: exactly one populate executes, and every caller
    /// receives the same success or failure.
    pub async fn get_or_populate<F, Fut>(
        &self, key: &str, ttl: Option<Duration>, populate: F,
    ) -> Result<CacheEntry, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, Error>>,
    {
        if let Some(entry) = self.get(key).await? {
            return Ok(entry);
        }

        let cell: Flight = {
            let mut flights = self.flights.lock().await;
            flights.entry(key.to_string()).or_default().clone()
        };

        let result = cell
            .get_or_init(|| async {
                tracing::debug!(key, "populating cache");
                match populate().await {
                    Ok(value) => {
                        if let Err(e) = self.insert(key, &value, ttl).await {
                            tracing::warn!(key, error = %e, "failed to store populated value");
                        }
                        Ok(value)
                    }
                    Err(e) => {
                        tracing::debug!(key, error = %e, "populate failed");
                        Err(e)
                    }
                }
            })
            .await
            .clone();

        {
            let mut flights = self.flights.lock().await;
            let ours = flights.get(key).is_some_and(|current| Arc::ptr_eq(current, &cell));
            if ours {
                flights.remove(key);
            }
        }

        let value = result?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        Ok(CacheEntry {
            key: key.to_string(),
            size_bytes: value.approx_size(),
            value,
            tier: Tier::Memory,
            inserted_at: Utc::now(),
            last_access: Utc::now(),
            ttl,
        })
    }

    /// Store a value in every tier.
    pub async fn insert(&self, key: &str, value: &CacheValue, ttl: Option<Duration>) -> Result<(), Error> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let raw = serde_json::to_vec(value)?;

        self.memory.insert(key, value.clone(), raw.len() as u64, ttl);
        self.disk.insert(key, &raw, ttl).await?;

        if let Some(remote) = &self.remote
            && let Err(e) = remote.set(key, Bytes::from(raw), self.remote_ttl).await
        {
            tracing::warn!(key, error = %e, "remote tier set failed");
        }

        Ok(())
    }

    /// Remove a key from every tier synchronously.
    pub async fn invalidate(&self, key: &str) -> Result<(), Error> {
        self.memory.remove(key);
        self.disk.remove(key).await?;

        if let Some(remote) = &self.remote
            && let Err(e) = remote.delete(key).await
        {
            tracing::warn!(key, error = %e, "remote tier delete failed");
        }

        Ok(())
    }

    /// Current hit/miss/eviction counters and per-tier resident bytes.
    ///
    /// Remote tier residency is owned by the external service and not
    /// reported here.
    pub async fn stats(&self) -> Result<CacheStats, Error> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.memory.eviction_count() + self.disk.eviction_count(),
            memory_bytes: self.memory.bytes_resident(),
            disk_bytes: self.disk.bytes_resident().await?,
        })
    }

    /// Drop expired entries from the bounded tiers. Returns how many
    /// were removed.
    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let from_memory = self.memory.purge_expired();
        let from_disk = self.disk.purge_expired().await?;
        Ok(from_memory + from_disk)
    }

    /// Spawn the background TTL sweep task.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match cache.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(purged = n, "ttl sweep removed expired entries"),
                    Err(e) => tracing::warn!(error = %e, "ttl sweep failed"),
                }
            }
        })
    }

    fn entry(&self, key: &str, value: CacheValue, tier: Tier, inserted_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            size_bytes: value.approx_size(),
            value,
            tier,
            inserted_at,
            last_access: Utc::now(),
            ttl: self.default_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(dir: &std::path::Path) -> CacheConfig {
        CacheConfig { dir: dir.to_path_buf(), ..Default::default() }
    }

    async fn open_temp() -> (tempfile::TempDir, Arc<TieredCache>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(&test_config(dir.path()), None).await.unwrap();
        (dir, Arc::new(cache))
    }

    fn value(text: &str) -> CacheValue {
        CacheValue::Bytes(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[tokio::test]
    async fn test_populate_then_hit() {
        let (_dir, cache) = open_temp().await;

        let entry = cache
            .get_or_populate("k1", None, || async { Ok(value("payload")) })
            .await
            .unwrap();
        assert!(matches!(&entry.value, CacheValue::Bytes(b) if &b[..] == b"payload"));

        let hit = cache.get("k1").await.unwrap().unwrap();
        assert_eq!(hit.tier, Tier::Memory);
        assert!(matches!(&hit.value, CacheValue::Bytes(b) if &b[..] == b"payload"));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let (_dir, cache) = open_temp().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_populate("same-key", None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(value("shared"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let entry = handle.await.unwrap().unwrap();
            assert!(matches!(&entry.value, CacheValue::Bytes(b) if &b[..] == b"shared"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_flight_shares_failure() {
        let (_dir, cache) = open_temp().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_populate("failing-key", None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(Error::NotFound { context: "failing-key".into() })
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(Error::NotFound { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_flight_can_retry_later() {
        let (_dir, cache) = open_temp().await;

        let result = cache
            .get_or_populate("k", None, || async { Err(Error::NotFound { context: "k".into() }) })
            .await;
        assert!(result.is_err());

        let entry = cache
            .get_or_populate("k", None, || async { Ok(value("second try")) })
            .await
            .unwrap();
        assert!(matches!(&entry.value, CacheValue::Bytes(b) if &b[..] == b"second try"));
    }

    #[tokio::test]
    async fn test_invalidate_removes_all_tiers() {
        let (_dir, cache) = open_temp().await;
        cache
            .get_or_populate("gone", None, || async { Ok(value("soon")) })
            .await
            .unwrap();

        cache.invalidate("gone").await.unwrap();
        assert!(cache.get("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_hit_promotes_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = TieredCache::open(&test_config(dir.path()), None).await.unwrap();
            cache.insert("warm", &value("persisted"), None).await.unwrap();
        }

        // fresh manager: memory is cold, disk still holds the entry
        let cache = TieredCache::open(&test_config(dir.path()), None).await.unwrap();
        let hit = cache.get("warm").await.unwrap().unwrap();
        assert_eq!(hit.tier, Tier::Memory);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert!(stats.memory_bytes > 0);
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let (_dir, cache) = open_temp().await;
        assert!(cache.get("missing").await.unwrap().is_none());
        cache
            .get_or_populate("present", None, || async { Ok(value("x")) })
            .await
            .unwrap();
        cache.get("present").await.unwrap().unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        // one explicit miss plus the get_or_populate's internal miss
        assert_eq!(stats.misses, 2);
    }

    struct MapRemote {
        entries: std::sync::Mutex<HashMap<String, Bytes>>,
        gets: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteTier for MapRemote {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: Bytes, _ttl: Duration) -> Result<(), Error> {
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_remote_hit_promotes_to_faster_tiers() {
        let remote = Arc::new(MapRemote { entries: std::sync::Mutex::new(HashMap::new()), gets: AtomicUsize::new(0) });
        let raw = Bytes::from(serde_json::to_vec(&value("from remote")).unwrap());
        remote.entries.lock().unwrap().insert("shared".to_string(), raw);

        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(&test_config(dir.path()), Some(remote.clone() as Arc<dyn RemoteTier>))
            .await
            .unwrap();

        let hit = cache.get("shared").await.unwrap().unwrap();
        assert_eq!(hit.tier, Tier::Memory);
        assert_eq!(remote.gets.load(Ordering::SeqCst), 1);

        // promoted copies answer without touching the remote again
        cache.get("shared").await.unwrap().unwrap();
        assert_eq!(remote.gets.load(Ordering::SeqCst), 1);
    }

    struct FailingRemote;

    #[async_trait::async_trait]
    impl RemoteTier for FailingRemote {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
            Err(Error::Transient { context: format!("remote get {key}"), attempts: 1 })
        }

        async fn set(&self, key: &str, _value: Bytes, _ttl: Duration) -> Result<(), Error> {
            Err(Error::Transient { context: format!("remote set {key}"), attempts: 1 })
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            Err(Error::Transient { context: format!("remote delete {key}"), attempts: 1 })
        }
    }

    #[tokio::test]
    async fn test_remote_failures_degrade_to_local_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(&test_config(dir.path()), Some(Arc::new(FailingRemote) as Arc<dyn RemoteTier>))
            .await
            .unwrap();

        let entry = cache
            .get_or_populate("resilient", None, || async { Ok(value("still works")) })
            .await
            .unwrap();
        assert!(matches!(&entry.value, CacheValue::Bytes(b) if &b[..] == b"still works"));

        let hit = cache.get("resilient").await.unwrap().unwrap();
        assert_eq!(hit.tier, Tier::Memory);
        cache.invalidate("resilient").await.unwrap();
    }
}
