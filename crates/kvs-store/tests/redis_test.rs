//! Integration tests for the Redis adapter.
//!
//! Requires a running Redis instance. Run with:
//! ```
//! KVS_TEST_REDIS_HOST=localhost cargo test -p kvs-store --features redis --test redis_test -- --ignored
//! ```
#![cfg(feature = "redis")]

use std::time::Duration;

use kvs_core::{LockId, StoreConfig};
use kvs_store::{CollectionStore, KeyValueStore, RedisStore};

const TTL: Duration = Duration::from_secs(60);

fn store() -> RedisStore {
    let config = StoreConfig {
        host: std::env::var("KVS_TEST_REDIS_HOST").unwrap_or_else(|_| "localhost".into()),
        ..Default::default()
    };
    RedisStore::from_config(&config).unwrap()
}

/// A key no other test run will touch.
fn scratch(name: &str) -> String {
    format!("kvs-test:{}:{name}", LockId::generate())
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_claim_script_writes_fields_and_ttl() {
    let store = store();
    let key = scratch("claim");

    assert!(store
        .hash_claim(&key, "lockId", b"t1", &[("lockedAt", b"100".as_slice())], TTL)
        .await
        .unwrap());
    assert!(!store
        .hash_claim(&key, "lockId", b"t2", &[("lockedAt", b"200".as_slice())], TTL)
        .await
        .unwrap());

    let fields = store.hash_get_all(&key).await.unwrap().unwrap();
    assert_eq!(fields["lockId"], b"t1");
    assert_eq!(fields["lockedAt"], b"100");
    assert!(store.time_to_live(&key).await.unwrap().is_some());

    assert!(!store
        .hash_delete_if_eq(&key, "lockId", b"t2", &["lockId", "lockedAt"])
        .await
        .unwrap());
    assert!(store.delete_if_eq(&key, "lockId", b"t1").await.unwrap());
    assert!(store.hash_get_all(&key).await.unwrap().is_none());

    store.connections().shutdown();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_collection_primitives() {
    let store = store();
    let hash = scratch("user");
    let set = scratch("roles");
    let zset = scratch("online");
    let list = scratch("log");

    store
        .hash_set(&hash, &[("name", b"ada".as_slice())])
        .await
        .unwrap();
    assert_eq!(store.hash_get(&hash, "name").await.unwrap(), Some(b"ada".to_vec()));
    assert_eq!(store.time_to_live(&hash).await.unwrap(), None);

    assert_eq!(store.set_add(&set, &[b"a".as_slice(), b"b"]).await.unwrap(), 2);
    assert!(store.set_contains(&set, b"a").await.unwrap());
    assert_eq!(store.set_remove(&set, &[b"a".as_slice()]).await.unwrap(), 1);
    assert_eq!(store.set_members(&set).await.unwrap(), vec![b"b".to_vec()]);

    assert!(store.sorted_set_add(&zset, b"x", 1.0).await.unwrap());
    assert!(store.sorted_set_add(&zset, b"y", 5.0).await.unwrap());
    assert_eq!(
        store.sorted_set_range_by_score(&zset, 0.0, 2.0).await.unwrap(),
        vec![b"x".to_vec()]
    );
    assert!(store.sorted_set_remove(&zset, b"x").await.unwrap());

    assert_eq!(store.list_push(&list, b"1").await.unwrap(), 1);
    assert_eq!(store.list_push(&list, b"2").await.unwrap(), 2);
    assert_eq!(store.list_range(&list, -1, -1).await.unwrap(), vec![b"2".to_vec()]);

    for key in [&hash, &set, &zset, &list] {
        store.delete(key).await.unwrap();
    }
    store.connections().shutdown();
}
