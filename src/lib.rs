//! memocache - Memoizing tiered cache and retry primitives
//!
//! This library wraps expensive or flaky calls behind two building blocks:
//! - A tiered read-through cache: in-memory Moka cache, then one JSON file per key
//!   on disk, then a caller-supplied fetcher
//! - Retry with fixed backoff, either around an arbitrary block of code
//!   ([`AttemptController`]) or around a single callable ([`retry`])
//!
//! The cache supports:
//! - Per-tier hit counters and a printable summary
//! - A fetch-disallowed mode for catching accidental misses in CI
//! - Coalescing of concurrent fetches for the same key
//! - Pluggable on-disk layout (flat or sharded SHA-256 file names)
//!
//! Sleeping is injected through the [`Sleeper`] trait so tests never wait on a real timer.

mod config;
mod error;
mod hash_key;
pub mod retry;
pub mod sleep;
mod tiered_cache;

pub use config::CacheConfig;
pub use error::{BoxError, CacheError, RetryConfigError};
pub use hash_key::{HashKeyCodec, KeyCodec, ShardedHashKeyCodec, hash_key};
pub use retry::{
    Attempt, AttemptController, AttemptOutcome, ControllerState, IntoOutcome, RetryPolicy,
    Retrying, retry,
};
pub use sleep::{ForbiddenSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use tiered_cache::{Cache, CacheKey, CacheStats, Cacheable, DataFetcher, NoCache, TieredCache};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
