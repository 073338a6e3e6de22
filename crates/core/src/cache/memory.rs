//! In-process memory tier.
//!
//! A byte-bounded LRU map. Recency is tracked with a monotonic tick
//! rather than wall time so two accesses in the same instant still
//! order. Eviction runs synchronously inside `insert`: resident bytes
//! never exceed the configured capacity once `insert` returns.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::entry::CacheValue;

struct MemEntry {
    value: CacheValue,
    size: u64,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_access: u64,
}

#[derive(Default)]
struct MemoryInner {
    map: HashMap<String, MemEntry>,
    clock: u64,
    bytes: u64,
}

/// Byte-bounded LRU memory tier.
pub struct MemoryTier {
    inner: Mutex<MemoryInner>,
    capacity: u64,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(capacity: u64) -> Self {
        Self { inner: Mutex::new(MemoryInner::default()), capacity, evictions: AtomicU64::new(0) }
    }

    /// Look up a value, bumping its recency. Expired entries are
    /// dropped and reported as a miss.
    pub fn get(&self, key: &str) -> Option<(CacheValue, DateTime<Utc>)> {
        let mut inner = self.inner.lock().expect("memory tier lock poisoned");
        inner.clock += 1;
        let tick = inner.clock;

        let expired = match inner.map.get_mut(key) {
            Some(entry) if entry.expires_at <= Utc::now() => true,
            Some(entry) => {
                entry.last_access = tick;
                return Some((entry.value.clone(), entry.inserted_at));
            }
            None => return None,
        };

        if expired
            && let Some(entry) = inner.map.remove(key)
        {
            inner.bytes -= entry.size;
        }
        None
    }

    /// Insert a value, evicting least-recently-used entries until the
    /// tier fits its capacity again. Values larger than the whole tier
    /// are refused and live only in the slower tiers.
    ///
    /// Returns whether the value was stored.
    pub fn insert(&self, key: &str, value: CacheValue, size: u64, ttl: Duration) -> bool {
        if size > self.capacity {
            tracing::debug!(key, size, capacity = self.capacity, "value exceeds memory tier; not stored");
            return false;
        }

        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));

        let mut inner = self.inner.lock().expect("memory tier lock poisoned");
        inner.clock += 1;
        let tick = inner.clock;

        if let Some(old) = inner.map.insert(
            key.to_string(),
            MemEntry { value, size, inserted_at: now, expires_at, last_access: tick },
        ) {
            inner.bytes -= old.size;
        }
        inner.bytes += size;

        while inner.bytes > self.capacity {
            let victim = inner
                .map
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    if let Some(entry) = inner.map.remove(&k) {
                        inner.bytes -= entry.size;
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(key = %k, "evicted from memory tier");
                    }
                }
                None => break,
            }
        }

        true
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().expect("memory tier lock poisoned");
        if let Some(entry) = inner.map.remove(key) {
            inner.bytes -= entry.size;
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> u64 {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("memory tier lock poisoned");
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.map.remove(key) {
                inner.bytes -= entry.size;
            }
        }
        expired.len() as u64
    }

    pub fn bytes_resident(&self) -> u64 {
        self.inner.lock().expect("memory tier lock poisoned").bytes
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
