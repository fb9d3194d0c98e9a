//! Generic tiered caching
//!
//! This module provides a read-through cache with three tiers:
//! - Memory: in-process Moka cache (fastest, never expires)
//! - Disk: one JSON file per key under a cache directory (survives restarts)
//! - Fetch: a caller-supplied fetcher, invoked only on a full miss
//!
//! The cache supports:
//! - Hit/miss accounting per tier
//! - A fetch-disallowed mode that turns any full miss into an error
//! - Coalescing of concurrent fetches for the same key (optional)
//! - All-or-nothing disk writes (temp file + rename)

use async_trait::async_trait;
use moka::future::Cache as MemoryCache;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    fs,
    future::Future,
    hash::Hash,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info};

use crate::{BoxError, CacheConfig, CacheError, HashKeyCodec, KeyCodec};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Trait for cache key types
pub trait CacheKey: AsRef<str> + Display + Hash + Eq + Clone + Send + Sync + 'static {}
impl<T> CacheKey for T where T: AsRef<str> + Display + Hash + Eq + Clone + Send + Sync + 'static {}

/// Produces the value for a key on a full cache miss.
///
/// Supplied per call rather than at construction, so one cache can front several
/// origins. Any `Fn(K) -> impl Future<Output = Result<V, BoxError>>` is a fetcher.
#[async_trait]
pub trait DataFetcher<K, V>: Send + Sync {
    async fn fetch(&self, key: &K) -> Result<V, BoxError>;
}

#[async_trait]
impl<K, V, F, Fut> DataFetcher<K, V> for F
where
    K: CacheKey,
    V: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
{
    async fn fetch(&self, key: &K) -> Result<V, BoxError> {
        (self)(key.clone()).await
    }
}

/// Common interface of [`TieredCache`] and [`NoCache`]
#[async_trait]
pub trait Cache<K: CacheKey, V: Cacheable>: Send + Sync {
    /// Get the value for `key`, calling `fetcher` only when no tier holds it.
    async fn get<F>(&self, key: &K, fetcher: &F) -> Result<Arc<V>, CacheError>
    where
        F: DataFetcher<K, V>;

    /// Log the hit counters.
    fn print_summary(&self);
}

/// Passthrough used when caching is disabled: every `get` calls the fetcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

#[async_trait]
impl<K: CacheKey, V: Cacheable> Cache<K, V> for NoCache {
    async fn get<F>(&self, key: &K, fetcher: &F) -> Result<Arc<V>, CacheError>
    where
        F: DataFetcher<K, V>,
    {
        Ok(Arc::new(fetcher.fetch(key).await?))
    }

    fn print_summary(&self) {}
}

/// Snapshot of the per-tier counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub fetches: u64,
}

impl CacheStats {
    /// Summary lines with the counters right-aligned to the widest value.
    pub fn lines(&self) -> [String; 3] {
        let width = self
            .memory_hits
            .max(self.disk_hits)
            .max(self.fetches)
            .to_string()
            .len();
        [
            format!("Mem    {:>width$}", self.memory_hits),
            format!("Disk   {:>width$}", self.disk_hits),
            format!("Fetch  {:>width$}", self.fetches),
        ]
    }
}

impl Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [mem, disk, fetch] = self.lines();
        write!(f, "{mem}\n{disk}\n{fetch}")
    }
}

type InFlightResult<V> = Option<Result<Arc<V>, String>>;

/// Represents an in-flight fetch that other requests can wait on
type InFlightFetch<V> = watch::Receiver<InFlightResult<V>>;
type InFlightSender<V> = watch::Sender<InFlightResult<V>>;
type InFlightMap<K, V> = Arc<RwLock<HashMap<K, InFlightFetch<V>>>>;

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped without completing, removes its entry from the in-flight map and
/// notifies waiters with an error.
struct InFlightGuard<K: CacheKey, V: Cacheable> {
    key: K,
    in_flight: InFlightMap<K, V>,
    tx: Option<InFlightSender<V>>,
    rx: InFlightFetch<V>,
}

impl<K: CacheKey, V: Cacheable> InFlightGuard<K, V> {
    /// Unregister the fetch and hand its result to the waiters.
    async fn complete(mut self, result: Result<Arc<V>, String>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
        remove_if_same(&mut *self.in_flight.write().await, &self.key, &self.rx);
    }
}

impl<K: CacheKey, V: Cacheable> Drop for InFlightGuard<K, V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("fetch was cancelled or panicked".to_owned())));
        }

        if let Ok(mut map) = self.in_flight.try_write() {
            remove_if_same(&mut *map, &self.key, &self.rx);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let key = self.key.clone();
        let rx = self.rx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        handle.spawn(async move {
            remove_if_same(&mut *in_flight.write().await, &key, &rx);
        });
    }
}

/// Remove `key` only if it still belongs to this fetch; a newer leader may own it.
fn remove_if_same<K: CacheKey, V>(
    map: &mut HashMap<K, InFlightFetch<V>>,
    key: &K,
    rx: &InFlightFetch<V>,
) {
    if map.get(key).is_some_and(|current| current.same_channel(rx)) {
        map.remove(key);
    }
}

/// Memory → disk → fetch read-through cache
pub struct TieredCache<K: CacheKey, V: Cacheable> {
    inner: Arc<TieredCacheInner<K, V>>,
}

struct TieredCacheInner<K: CacheKey, V: Cacheable> {
    memory: MemoryCache<K, Arc<V>>,
    cache_dir: PathBuf,
    codec: Box<dyn KeyCodec>,
    allow_fetches: bool,
    coalesce_fetches: bool,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    fetches: AtomicU64,
    /// Track in-flight fetches for request coalescing
    in_flight: InFlightMap<K, V>,
}

impl<K: CacheKey, V: Cacheable> Clone for TieredCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: Cacheable> TieredCache<K, V> {
    /// Create a cache using the flat SHA-256 file layout
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        Self::with_codec(config, HashKeyCodec)
    }

    /// Create a cache with a custom on-disk layout
    pub fn with_codec(config: CacheConfig, codec: impl KeyCodec) -> Result<Self, CacheError> {
        if config.clean_cache_dir {
            match fs::remove_dir_all(&config.cache_dir) {
                Ok(()) => debug!("Removed cache directory {}", config.cache_dir.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&config.cache_dir, e)),
            }
        }

        Ok(Self {
            inner: Arc::new(TieredCacheInner {
                memory: MemoryCache::builder().build(),
                cache_dir: config.cache_dir,
                codec: Box::new(codec),
                allow_fetches: config.allow_fetches,
                coalesce_fetches: config.coalesce_fetches,
                memory_hits: AtomicU64::new(0),
                disk_hits: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
                in_flight: Arc::new(RwLock::new(HashMap::new())),
            }),
        })
    }

    /// Directory holding the on-disk tier
    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// On-disk location of the entry for `key`
    pub fn path_for(&self, key: &K) -> PathBuf {
        self.inner
            .cache_dir
            .join(self.inner.codec.relative_path(key.as_ref()))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.inner.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.inner.disk_hits.load(Ordering::Relaxed),
            fetches: self.inner.fetches.load(Ordering::Relaxed),
        }
    }

    pub fn print_summary(&self) {
        info!("Cache hit summary");
        for line in self.stats().lines() {
            info!("  {}", line);
        }
    }

    /// Get value by key using tiered caching
    pub async fn get<F>(&self, key: &K, fetcher: &F) -> Result<Arc<V>, CacheError>
    where
        F: DataFetcher<K, V> + ?Sized,
    {
        if let Some(value) = self.inner.memory.get(key).await {
            self.inner.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit memory for key: {}", key);
            return Ok(value);
        }

        debug!("Cache miss memory for key: {}", key);

        let path = self.path_for(key);
        if let Some(value) = self.read_from_disk(key, &path)? {
            let value = Arc::new(value);
            self.inner.memory.insert(key.clone(), Arc::clone(&value)).await;
            return Ok(value);
        }

        if !self.inner.allow_fetches {
            return Err(CacheError::FetchesDisallowed {
                key: key.to_string(),
            });
        }

        if !self.inner.coalesce_fetches {
            return self.fetch_and_store(key, &path, fetcher).await;
        }

        // Check if there's already an in-flight fetch for this key
        let existing = self.inner.in_flight.read().await.get(key).cloned();
        if let Some(rx) = existing {
            return self.wait_for_in_flight(key, rx).await;
        }

        let guard = {
            let mut in_flight = self.inner.in_flight.write().await;
            // Double-check: another task might have started a fetch while we waited for the write lock
            if let Some(rx) = in_flight.get(key).cloned() {
                drop(in_flight);
                return self.wait_for_in_flight(key, rx).await;
            }
            // ...or finished one, in which case the memory tier has it
            if let Some(value) = self.inner.memory.get(key).await {
                self.inner.memory_hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit memory for key (race): {}", key);
                return Ok(value);
            }
            let (tx, rx) = watch::channel(None);
            in_flight.insert(key.clone(), rx.clone());
            InFlightGuard {
                key: key.clone(),
                in_flight: Arc::clone(&self.inner.in_flight),
                tx: Some(tx),
                rx,
            }
        };

        // The guard cleans up if this future is dropped mid-fetch
        let result = self.fetch_and_store(key, &path, fetcher).await;
        guard
            .complete(match &result {
                Ok(value) => Ok(Arc::clone(value)),
                Err(e) => Err(e.to_string()),
            })
            .await;

        result
    }

    /// Wait on another caller's fetch. Counted as a memory hit: the value is served
    /// from in-process state without a fetch of our own.
    async fn wait_for_in_flight(
        &self,
        key: &K,
        mut rx: InFlightFetch<V>,
    ) -> Result<Arc<V>, CacheError> {
        self.inner.memory_hits.fetch_add(1, Ordering::Relaxed);
        debug!("Waiting for in-flight fetch for key: {}", key);

        loop {
            if let Some(result) = rx.borrow().as_ref() {
                return match result {
                    Ok(value) => Ok(Arc::clone(value)),
                    Err(message) => Err(CacheError::InFlight {
                        key: key.to_string(),
                        message: message.clone(),
                    }),
                };
            }
            if rx.changed().await.is_err() {
                return Err(CacheError::InFlight {
                    key: key.to_string(),
                    message: "fetch was cancelled".to_owned(),
                });
            }
        }
    }

    fn read_from_disk(&self, key: &K, path: &Path) -> Result<Option<V>, CacheError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Cache miss disk for key: {}", key);
                return Ok(None);
            }
            Err(e) => return Err(CacheError::io(path, e)),
        };

        self.inner.disk_hits.fetch_add(1, Ordering::Relaxed);
        debug!("Cache hit disk for key: {}", key);

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn fetch_and_store<F>(
        &self,
        key: &K,
        path: &Path,
        fetcher: &F,
    ) -> Result<Arc<V>, CacheError>
    where
        F: DataFetcher<K, V> + ?Sized,
    {
        let fetched = fetcher.fetch(key).await;
        // Counts attempts, so failures are included; a cancelled fetch never gets here
        self.inner.fetches.fetch_add(1, Ordering::Relaxed);

        let value = match fetched {
            Ok(value) => value,
            Err(e) => {
                error!("Fetch error for key {}: {}", key, e);
                return Err(CacheError::Fetch(e));
            }
        };
        debug!("Cache miss - fetched for key: {}", key);

        let json = serde_json::to_vec(&value)?;
        write_atomically(path, &json)?;

        let value = Arc::new(value);
        self.inner.memory.insert(key.clone(), Arc::clone(&value)).await;
        Ok(value)
    }
}

#[async_trait]
impl<K: CacheKey, V: Cacheable> Cache<K, V> for TieredCache<K, V> {
    async fn get<F>(&self, key: &K, fetcher: &F) -> Result<Arc<V>, CacheError>
    where
        F: DataFetcher<K, V>,
    {
        TieredCache::get(self, key, fetcher).await
    }

    fn print_summary(&self) {
        TieredCache::print_summary(self);
    }
}

/// Write `bytes` to `path` so that readers see either nothing or the whole file.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| CacheError::io(parent, e))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| CacheError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| CacheError::io(path, e.error))?;
    Ok(())
}
