//! Optional shared remote tier.
//!
//! A minimal key-value contract against an external service. The
//! remote tier is one more cache level, never authoritative: its
//! eviction policy belongs to the external service, and the engine
//! degrades to memory+disk-only operation when it is absent or
//! unreachable.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Error;

/// Contract for an external shared cache tier.
///
/// Implementations own their transport; the manager only issues
/// get/set/delete and treats every failure as a miss.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Fetch a value. `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error>;

    /// Store a value with a TTL owned by the remote service.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), Error>;

    /// Remove a value if present.
    async fn delete(&self, key: &str) -> Result<(), Error>;
}
