use kontrol::core::lru::LruCache;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_get_returns_value_or_none() {
    let cache: LruCache<String, u32> = LruCache::new(Duration::from_secs(60), None, None);
    cache.put("a".to_string(), 1);
    assert_eq!(cache.get(&"a".to_string()), Some(1));
    assert_eq!(cache.get(&"b".to_string()), None);
}

#[tokio::test]
async fn test_capacity_eviction_hits_the_lru_entry() {
    let evicted = Arc::new(AtomicUsize::new(0));
    let seen = evicted.clone();
    let cache: LruCache<String, u32> = LruCache::new(
        Duration::from_secs(60),
        Some(2),
        Some(Arc::new(move |val| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(val, 1);
        })),
    );

    cache.put("a".to_string(), 1);
    cache.put("b".to_string(), 2);
    cache.put("c".to_string(), 3);

    assert_eq!(evicted.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&"a".to_string()), None);
    assert_eq!(cache.get(&"b".to_string()), Some(2));
    assert_eq!(cache.get(&"c".to_string()), Some(3));
}

#[tokio::test]
async fn test_get_refreshes_recency() {
    let cache: LruCache<String, u32> = LruCache::new(Duration::from_secs(60), Some(2), None);
    cache.put("a".to_string(), 1);
    cache.put("b".to_string(), 2);

    // Touch "a" so "b" becomes the victim.
    assert_eq!(cache.get(&"a".to_string()), Some(1));
    cache.put("c".to_string(), 3);

    assert_eq!(cache.get(&"a".to_string()), Some(1));
    assert_eq!(cache.get(&"b".to_string()), None);
}

#[tokio::test]
async fn test_sweep_evicts_stale_entries_exactly_once() {
    let evicted = Arc::new(AtomicUsize::new(0));
    let seen = evicted.clone();
    let cache: LruCache<String, u32> = LruCache::new(
        Duration::from_millis(50),
        None,
        Some(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })),
    );

    cache.put("a".to_string(), 1);
    tokio::time::sleep(Duration::from_millis(120)).await;

    cache.sweep();
    assert_eq!(evicted.load(Ordering::SeqCst), 1);
    assert!(cache.is_empty());

    // A second sweep has nothing left to do.
    cache.sweep();
    assert_eq!(evicted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sweep_spares_recently_accessed_entries() {
    let cache: LruCache<String, u32> = LruCache::new(Duration::from_millis(100), None, None);
    cache.put("a".to_string(), 1);
    cache.put("b".to_string(), 2);

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(cache.get(&"a".to_string()), Some(1));
    tokio::time::sleep(Duration::from_millis(60)).await;

    cache.sweep();
    assert_eq!(cache.get(&"a".to_string()), Some(1));
    assert_eq!(cache.get(&"b".to_string()), None);
}
