//! Core types and shared functionality for warchive.
//!
//! This crate provides:
//! - The tiered cache (memory, disk, optional remote) with single-flight
//!   population and TTL sweeping
//! - Shared data model for archive records and locators
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod records;

pub use cache::{CacheEntry, CacheStats, CacheValue, DiskTier, MemoryTier, RemoteTier, Tier, TieredCache};
pub use config::AppConfig;
pub use error::Error;
pub use records::{ContainerRecord, IndexRecord, Locator, RateBudget, RecordType, SnapshotInfo};
