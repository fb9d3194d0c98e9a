//! Cache configuration

use std::path::PathBuf;

/// Configuration for the tiered cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one file per cached key
    pub cache_dir: PathBuf,
    /// Allow falling through to the fetcher on a miss
    pub allow_fetches: bool,
    /// Remove the whole cache directory before first use
    pub clean_cache_dir: bool,
    /// Share one in-flight fetch between concurrent misses for the same key
    pub coalesce_fetches: bool,
}

impl CacheConfig {
    /// Configuration with defaults for everything but the directory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            allow_fetches: true,
            clean_cache_dir: false,
            coalesce_fetches: true,
        }
    }
}
