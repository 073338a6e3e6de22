//! Unified error types for the archive access engine.
//!
//! Every failure carries enough structured context (key or locator,
//! error kind, attempt count) to be logged and diagnosed without
//! re-running the operation. The enum is `Clone` so a single-flight
//! result can be handed to every waiter; non-clonable sources are
//! wrapped in `Arc`.

use std::sync::Arc;

use tokio_rusqlite::rusqlite;

/// Unified error type for the archive access engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Query or locator has no corresponding data. Never retried.
    #[error("NOT_FOUND: {context}")]
    NotFound { context: String },

    /// Network or 5xx-class failure worth retrying.
    #[error("TRANSIENT: {context} (attempt {attempts})")]
    Transient { context: String, attempts: u32 },

    /// The governor denied admission within the caller's timeout.
    #[error("RATE_LIMITED: {context}")]
    RateLimited { context: String },

    /// The endpoint's circuit breaker is open; fail fast until cool-down.
    #[error("CIRCUIT_OPEN: {endpoint}")]
    CircuitOpen { endpoint: String },

    /// A single container record failed to decode; the stream continues.
    #[error("MALFORMED_RECORD: at byte {offset}: {reason}")]
    MalformedRecord { offset: u64, reason: String },

    /// Deadline exceeded; partial work discarded.
    #[error("TIMEOUT: {context}")]
    Timeout { context: String },

    /// An on-disk entry failed its integrity check and was evicted.
    #[error("CACHE_CORRUPTION: {key}")]
    CacheCorruption { key: String },

    /// The index service is unreachable and no cached listing exists.
    #[error("INDEX_UNAVAILABLE: {context}")]
    IndexUnavailable { context: String },

    /// Bad query or parameters, rejected by the remote with a 4xx. Never retried.
    #[error("INVALID_QUERY: {context}")]
    InvalidQuery { context: String },

    /// Unexpected HTTP response outside the classified cases.
    #[error("HTTP_ERROR: status {status}: {context}")]
    Http { status: u16, context: String },

    /// Cache metadata database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Storage(Arc<tokio_rusqlite::Error>),

    /// Filesystem operation on the disk tier failed.
    #[error("IO_ERROR: {context}: {source}")]
    Io {
        context: String,
        source: Arc<std::io::Error>,
    },

    /// Cached value failed to (de)serialize.
    #[error("SERIALIZE_ERROR: {context}")]
    Serialize { context: String },

    /// Configuration rejected at load time.
    #[error("CONFIG_ERROR: {0}")]
    Config(String),
}

impl Error {
    /// Whether the retry driver may re-issue the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Attach filesystem context to an I/O failure.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io { context: context.into(), source: Arc::new(source) }
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => {
                Error::Storage(Arc::new(tokio_rusqlite::Error::ConnectionClosed))
            }
            tokio_rusqlite::Error::Close(c) => Error::Storage(Arc::new(tokio_rusqlite::Error::Close(c))),
            _ => Error::Storage(Arc::new(tokio_rusqlite::Error::ConnectionClosed)),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Storage(Arc::new(err))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(Arc::new(tokio_rusqlite::Error::Error(err)))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialize { context: err.to_string() }
    }
}
