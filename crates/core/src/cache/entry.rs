//! Cache entry and statistics types.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::records::ContainerRecord;

/// Cache tier, ordered fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Memory,
    Disk,
    Remote,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Memory => "memory",
            Tier::Disk => "disk",
            Tier::Remote => "remote",
        }
    }
}

/// A cacheable value: raw bytes, one decoded record, or a resolved
/// record set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheValue {
    Bytes(Bytes),
    Record(ContainerRecord),
    Records(Vec<ContainerRecord>),
}

impl CacheValue {
    /// Approximate in-memory footprint, used for the memory tier's
    /// byte accounting. Disk accounting uses the serialized size.
    pub fn approx_size(&self) -> u64 {
        fn record_size(r: &ContainerRecord) -> u64 {
            let headers: usize = r.headers.iter().map(|(k, v)| k.len() + v.len() + 4).sum();
            (r.payload.len() + headers) as u64
        }

        match self {
            CacheValue::Bytes(b) => b.len() as u64,
            CacheValue::Record(r) => record_size(r),
            CacheValue::Records(rs) => rs.iter().map(record_size).sum(),
        }
    }
}

/// One cached value plus its bookkeeping, as returned by the manager.
///
/// `tier` reflects the fastest tier currently holding a copy; after a
/// promotion that is normally `Memory`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: CacheValue,
    pub tier: Tier,
    pub size_bytes: u64,
    pub inserted_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub ttl: Duration,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl CacheStats {
    /// Hit rate as a percentage (0.0-100.0). Returns 0.0 when no accesses.
    pub fn hit_rate_pct(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        (self.hits as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordType;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Memory < Tier::Disk);
        assert!(Tier::Disk < Tier::Remote);
    }

    #[test]
    fn test_approx_size_bytes() {
        let value = CacheValue::Bytes(Bytes::from_static(&[0u8; 128]));
        assert_eq!(value.approx_size(), 128);
    }

    #[test]
    fn test_approx_size_counts_headers_and_payload() {
        let record = ContainerRecord {
            record_type: RecordType::Response,
            headers: vec![("WARC-Type".to_string(), "response".to_string())],
            payload: Bytes::from_static(&[0u8; 200]),
            payload_length: 200,
        };
        let value = CacheValue::Record(record);
        assert!(value.approx_size() > 200);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats { hits: 3, misses: 1, ..Default::default() };
        assert_eq!(stats.hit_rate_pct(), 75.0);
        assert_eq!(CacheStats::default().hit_rate_pct(), 0.0);
    }
}
