//! Client side of the warchive engine.
//!
//! This crate provides everything that touches the network or decodes
//! archive bytes:
//!
//! - Rate/cost governor (token bucket admission + byte accounting)
//! - Retry driver and per-endpoint circuit breaker
//! - Index client (snapshot listing, paginated search)
//! - Blob fetcher (ranged streaming reads with mirror fallback)
//! - Container decoder (concatenated gzip members, skip-and-resync)
//! - HTTP implementation of the shared remote cache tier
//! - [`ArchiveEngine`], the read-path facade consumed downstream

pub mod breaker;
pub mod decode;
pub mod engine;
pub mod fetch;
pub mod governor;
pub mod index;
pub mod remote;
pub mod retry;

pub use breaker::CircuitBreaker;
pub use decode::{DecodeEvent, Decoder, DecoderState, decode_bytes, decode_stream};
pub use engine::{ArchiveEngine, EngineStats};
pub use fetch::{BlobFetcher, BlobSource, ByteStream};
pub use governor::Governor;
pub use index::{IndexClient, IndexSource, QueryKind, SearchPage, SearchQuery};
pub use remote::HttpRemoteTier;
pub use retry::{RetryPolicy, RetryState};
