//! Cache and retry error types

use std::path::PathBuf;

/// Boxed failure returned by a fetcher.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Fetches are disallowed and no cached value exists for key: {key}")]
    FetchesDisallowed { key: String },

    /// Failure raised by the fetcher, displayed unchanged.
    #[error("{0}")]
    Fetch(#[from] BoxError),

    #[error("In-flight fetch for key {key} failed: {message}")]
    InFlight { key: String, message: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache entry at {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Invalid retry policy parameters
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryConfigError {
    #[error("num_attempts must be at least {min}, got {got}")]
    TooFewAttempts { min: u32, got: u32 },

    #[error("sleep_seconds must be a positive, representable number of seconds, got {0}")]
    InvalidSleep(f64),
}
