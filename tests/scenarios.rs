use memocache::{
    BoxError, CacheConfig, CacheError, CacheStats, RecordingSleeper, RetryPolicy, TieredCache,
    TokioSleeper, hash_key, retry,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn stats(memory_hits: u64, disk_hits: u64, fetches: u64) -> CacheStats {
    CacheStats {
        memory_hits,
        disk_hits,
        fetches,
    }
}

#[tokio::test]
async fn fetch_then_memory_then_disk_across_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("c");
    let key = "u1".to_owned();

    // Fetch on first lookup, persisted under the key's digest
    let cache: TieredCache<String, Value> = TieredCache::new(CacheConfig::new(&dir)).unwrap();
    let fetched = cache
        .get(&key, &|_key: String| async { Ok::<_, BoxError>(json!({"a": 1})) })
        .await
        .unwrap();
    assert_eq!(*fetched, json!({"a": 1}));
    let path = dir.join(hash_key("u1"));
    let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk, json!({"a": 1}));
    assert_eq!(cache.stats(), stats(0, 0, 1));

    // Same instance answers from memory
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = {
        let calls = Arc::clone(&calls);
        move |_key: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BoxError>(json!("unused")) }
        }
    };
    let again = cache.get(&key, &counted).await.unwrap();
    assert_eq!(*again, json!({"a": 1}));
    assert_eq!(cache.stats(), stats(1, 0, 1));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // A fresh instance on the same directory answers from disk
    let restarted: TieredCache<String, Value> =
        TieredCache::new(CacheConfig::new(&dir)).unwrap();
    let from_disk = restarted
        .get(&key, &|_key: String| async {
            Err::<Value, BoxError>("origin must not be contacted".into())
        })
        .await
        .unwrap();
    assert_eq!(*from_disk, json!({"a": 1}));
    assert_eq!(restarted.stats(), stats(0, 1, 0));
}

#[tokio::test]
async fn retry_returns_ok_after_two_failures() {
    let calls = AtomicUsize::new(0);
    let side_effects = |_: ()| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            match n {
                0 | 1 => Err(format!("error {n}")),
                _ => Ok("ok"),
            }
        }
    };
    let sleeper = RecordingSleeper::new();
    let policy = RetryPolicy::new(3, 0.01).unwrap();

    let result = retry(side_effects, policy, sleeper.clone()).call(()).await;

    assert_eq!(result, Ok("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(sleeper.recorded(), vec![Duration::from_millis(10); 2]);
}

#[tokio::test]
async fn retry_really_sleeps_between_attempts() {
    let calls = AtomicUsize::new(0);
    let side_effects = |_: ()| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move { if n < 2 { Err("transient") } else { Ok("ok") } }
    };
    let policy = RetryPolicy::new(3, 0.01).unwrap();

    let start = Instant::now();
    let result = retry(side_effects, policy, TokioSleeper).call(()).await;

    assert_eq!(result, Ok("ok"));
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn retried_fetch_populates_cache_once() {
    let tmp = tempfile::tempdir().unwrap();
    let cache: TieredCache<String, Value> =
        TieredCache::new(CacheConfig::new(tmp.path())).unwrap();
    let sleeper = RecordingSleeper::new();
    let origin_calls = Arc::new(AtomicUsize::new(0));

    let flaky_origin = {
        let origin_calls = Arc::clone(&origin_calls);
        move |key: String| {
            let n = origin_calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err::<Value, BoxError>("connection reset".into())
                } else {
                    Ok(json!({"key": key}))
                }
            }
        }
    };
    let wrapped = Arc::new(retry(
        flaky_origin,
        RetryPolicy::new(2, 0.5).unwrap(),
        sleeper.clone(),
    ));
    let fetcher = move |key: String| {
        let wrapped = Arc::clone(&wrapped);
        async move { wrapped.call(key).await }
    };

    let key = "https://example.com/item/7".to_owned();
    let value = cache.get(&key, &fetcher).await.unwrap();
    assert_eq!(*value, json!({"key": "https://example.com/item/7"}));
    let value = cache.get(&key, &fetcher).await.unwrap();
    assert_eq!(*value, json!({"key": "https://example.com/item/7"}));

    assert_eq!(origin_calls.load(Ordering::SeqCst), 2);
    assert_eq!(sleeper.recorded(), vec![Duration::from_millis(500)]);
    assert_eq!(cache.stats(), stats(1, 0, 1));
}

#[tokio::test]
async fn disallowed_fetch_surfaces_key() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        allow_fetches: false,
        ..CacheConfig::new(tmp.path())
    };
    let cache: TieredCache<String, Value> = TieredCache::new(config).unwrap();

    let err = cache
        .get(&"missing".to_owned(), &|_key: String| async {
            Ok::<_, BoxError>(json!(null))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::FetchesDisallowed { ref key } if key == "missing"));
    assert!(err.to_string().contains("missing"));
    assert_eq!(cache.stats(), CacheStats::default());
}
