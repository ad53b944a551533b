use super::CacheService;
use std::time::Duration;

fn local_cache() -> CacheService {
    CacheService::new(None, "chorus-test".to_string(), None)
}

#[tokio::test]
async fn kv_roundtrip_and_delete() {
    let cache = local_cache();

    cache.set("schedule:1", b"cached", None).await.unwrap();
    assert_eq!(
        cache.get_string("schedule:1").await.unwrap().as_deref(),
        Some("cached")
    );

    cache.del("schedule:1").await.unwrap();
    assert_eq!(cache.get("schedule:1").await.unwrap(), None);
}

#[tokio::test]
async fn ttl_expires_entries() {
    let cache = local_cache();

    cache
        .set("cooldown", b"1", Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert!(cache.get("cooldown").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get("cooldown").await.unwrap(), None);
}

#[tokio::test]
async fn set_nx_is_exclusive_until_expiry() {
    let cache = local_cache();

    assert!(cache
        .set_nx("lock:a", b"1", Some(Duration::from_millis(30)))
        .await
        .unwrap());
    assert!(!cache
        .set_nx("lock:a", b"1", Some(Duration::from_millis(30)))
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache
        .set_nx("lock:a", b"1", Some(Duration::from_millis(30)))
        .await
        .unwrap());
}

#[tokio::test]
async fn pattern_delete_only_touches_matches() {
    let cache = local_cache();

    cache.set("user:7:schedules:list", b"a", None).await.unwrap();
    cache.set("user:7:schedules:count", b"b", None).await.unwrap();
    cache.set("user:8:schedules:list", b"c", None).await.unwrap();

    let removed = cache.del_pattern("user:7:schedules:*").await.unwrap();
    assert_eq!(removed, 2);
    assert!(cache.get("user:8:schedules:list").await.unwrap().is_some());
}

#[tokio::test]
async fn incr_counts_from_zero() {
    let cache = local_cache();

    assert_eq!(cache.incr("uses", 1).await.unwrap(), 1);
    assert_eq!(cache.incr("uses", 2).await.unwrap(), 3);
}
