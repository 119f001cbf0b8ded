use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kvs_core::{codec, Error, KeySpace, LockId, SessionAction, SessionItems, SessionValue};
use kvs_session::record;
use kvs_session::{LockingSessionStore, ReadOutcome, SessionStateStore};
use kvs_store::{KeyValueStore, MemoryStore};

const TIMEOUT: Duration = Duration::from_secs(20 * 60);

// ── Helpers ─────────────────────────────────────────────────────────

fn setup() -> (Arc<MemoryStore>, LockingSessionStore) {
    setup_with_policy(true)
}

fn setup_with_policy(log_and_wrap: bool) -> (Arc<MemoryStore>, LockingSessionStore) {
    let memory = Arc::new(MemoryStore::new());
    let provider = LockingSessionStore::new(
        memory.clone(),
        KeySpace::new("test").unwrap(),
        TIMEOUT,
        log_and_wrap,
    );
    (memory, provider)
}

fn items(pairs: &[(&str, &str)]) -> SessionItems {
    pairs.iter().map(|(k, v)| (*k, *v)).collect()
}

/// Store `data` unlocked, the way a finished request leaves it.
async fn seed(provider: &LockingSessionStore, id: &str, data: &SessionItems) {
    provider
        .commit_and_release(id, data, None, true)
        .await
        .unwrap();
}

// ── Reads ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_absent_record_is_missing() {
    let (_, provider) = setup();
    for exclusive in [false, true] {
        let outcome = provider.acquire_for_read("nope", exclusive).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Missing);
        assert!(!outcome.is_locked());
        assert!(outcome.data().is_none());
        assert_eq!(outcome.lock_id(), None);
    }
}

#[tokio::test]
async fn test_shared_read_does_not_lock() {
    let (memory, provider) = setup();
    seed(&provider, "s", &items(&[("k", "v")])).await;

    for _ in 0..2 {
        let outcome = provider.get_item("s").await.unwrap();
        assert!(!outcome.holds_lock());
        assert_eq!(outcome.data().unwrap().items, items(&[("k", "v")]));
    }

    let fields = memory
        .hash_get_all(&provider.key_space().session("s"))
        .await
        .unwrap()
        .unwrap();
    assert!(!fields.contains_key(record::LOCK_ID));

    assert!(provider.get_item_exclusive("s").await.unwrap().holds_lock());
}

#[tokio::test]
async fn test_uninitialized_item_lifecycle() {
    let (_, provider) = setup();
    provider
        .create_uninitialized("S1", Duration::from_secs(20 * 60))
        .await
        .unwrap();

    let first = provider.get_item_exclusive("S1").await.unwrap();
    assert_eq!(first.action(), SessionAction::InitializeItem);
    assert!(first.data().unwrap().items.is_empty());
    assert!(!first.is_locked());

    let mut data = first.clone().into_data().unwrap().items;
    data.insert("k", "v");
    provider
        .commit_and_release("S1", &data, first.lock_id(), true)
        .await
        .unwrap();

    let second = provider.get_item_exclusive("S1").await.unwrap();
    assert_eq!(second.action(), SessionAction::None);
    assert!(second.holds_lock());
    let token = second.lock_id().expect("fresh lock token");
    assert_ne!(Some(token), first.lock_id());
    assert_eq!(
        second.data().unwrap().items.get("k"),
        Some(&SessionValue::Text("v".into()))
    );
}

#[tokio::test]
async fn test_init_marker_is_consumed_once() {
    let (_, provider) = setup();
    provider.create_uninitialized("s", TIMEOUT).await.unwrap();

    let first = provider.get_item("s").await.unwrap();
    assert_eq!(first.action(), SessionAction::InitializeItem);

    let second = provider.get_item("s").await.unwrap();
    assert_eq!(second.action(), SessionAction::None);
    assert!(second.data().unwrap().items.is_empty());
}

#[tokio::test]
async fn test_second_exclusive_read_reports_contention() {
    let (_, provider) = setup();
    seed(&provider, "S1", &items(&[("k", "v")])).await;

    let first = provider.get_item_exclusive("S1").await.unwrap();
    let token = first.lock_id().unwrap();

    let second = provider.get_item_exclusive("S1").await.unwrap();
    assert!(second.is_locked());
    assert_eq!(second.lock_id(), Some(token));
    assert!(second.lock_age() < Duration::from_secs(5));
    assert!(second.data().is_none());

    // Shared readers are refused too while the lock is held.
    assert!(provider.get_item("S1").await.unwrap().is_locked());
}

#[tokio::test]
async fn test_lock_age_reflects_locked_at() {
    let (memory, provider) = setup();
    let key = provider.key_space().session("old");
    let token = LockId::generate();
    let blob = codec::serialize(&items(&[("k", "v")])).unwrap();
    let locked_at = record::encode_millis(Utc::now() - chrono::TimeDelta::seconds(90));
    memory
        .hash_set_with_expiry(
            &key,
            &[
                (record::DATA, blob.as_slice()),
                (record::LOCK_ID, token.to_field().as_slice()),
                (record::LOCKED_AT, locked_at.as_slice()),
            ],
            TIMEOUT,
        )
        .await
        .unwrap();

    let outcome = provider.get_item_exclusive("old").await.unwrap();
    assert_eq!(outcome.lock_id(), Some(token));
    assert!(outcome.lock_age() >= Duration::from_secs(90));
    assert!(outcome.lock_age() < Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_exclusive_read_stamps_lock_and_ttl() {
    let (memory, provider) = setup();
    seed(&provider, "s", &items(&[("k", "v")])).await;
    let key = provider.key_space().session("s");
    memory.expire(&key, Duration::from_secs(30)).await.unwrap();

    let outcome = provider.get_item_exclusive("s").await.unwrap();
    let token = outcome.lock_id().unwrap();

    let fields = memory.hash_get_all(&key).await.unwrap().unwrap();
    assert_eq!(fields[record::LOCK_ID], token.to_field());
    assert!(fields.contains_key(record::LOCKED_AT));
    assert_eq!(memory.time_to_live(&key).await.unwrap(), Some(TIMEOUT));
}

#[tokio::test]
async fn test_record_without_data_reads_fresh_and_unlocked() {
    let (memory, provider) = setup();
    let key = provider.key_space().session("bare");
    memory
        .hash_set_with_expiry(&key, &[("other", b"x".as_slice())], TIMEOUT)
        .await
        .unwrap();

    for exclusive in [false, true] {
        let outcome = provider.acquire_for_read("bare", exclusive).await.unwrap();
        assert!(!outcome.is_locked());
        assert_eq!(outcome.lock_id(), None);
        assert_eq!(outcome.action(), SessionAction::None);
        assert!(outcome.data().unwrap().items.is_empty());
    }

    let fields = memory.hash_get_all(&key).await.unwrap().unwrap();
    assert!(!fields.contains_key(record::LOCK_ID));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_exclusive_reads_have_one_winner() {
    let (_, provider) = setup();
    seed(&provider, "hot", &items(&[("n", "1")])).await;
    let provider = Arc::new(provider);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let provider = Arc::clone(&provider);
        tasks.push(tokio::spawn(async move {
            provider.get_item_exclusive("hot").await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    let mut contended = Vec::new();
    for task in tasks {
        let outcome = task.await.unwrap();
        if outcome.holds_lock() {
            winners.push(outcome.lock_id().unwrap());
        } else {
            assert!(outcome.is_locked());
            contended.push(outcome.lock_id().unwrap());
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(contended.len(), 15);
    assert!(contended.iter().all(|t| *t == winners[0]));
}

// ── Release / commit ────────────────────────────────────────────────

#[tokio::test]
async fn test_release_lock_requires_matching_token() {
    let (_, provider) = setup();
    seed(&provider, "s", &items(&[("k", "v")])).await;
    let token = provider.get_item_exclusive("s").await.unwrap().lock_id().unwrap();

    provider.release_lock("s", LockId::generate()).await.unwrap();
    let still = provider.get_item_exclusive("s").await.unwrap();
    assert_eq!(still.lock_id(), Some(token));
    assert!(still.is_locked());

    provider.release_lock("s", token).await.unwrap();
    let next = provider.get_item_exclusive("s").await.unwrap();
    assert!(next.holds_lock());
    assert_ne!(next.lock_id(), Some(token));
}

#[tokio::test]
async fn test_release_lock_on_absent_record_is_noop() {
    let (memory, provider) = setup();
    provider.release_lock("ghost", LockId::generate()).await.unwrap();
    assert!(memory.is_empty());
}

#[tokio::test]
async fn test_commit_with_matching_token_releases_and_writes() {
    let (_, provider) = setup();
    seed(&provider, "s", &items(&[("k", "v1")])).await;
    let token = provider.get_item_exclusive("s").await.unwrap().lock_id().unwrap();

    provider
        .commit_and_release("s", &items(&[("k", "v2")]), Some(token), false)
        .await
        .unwrap();

    let outcome = provider.get_item_exclusive("s").await.unwrap();
    assert!(outcome.holds_lock());
    assert_eq!(outcome.data().unwrap().items, items(&[("k", "v2")]));
}

#[tokio::test(start_paused = true)]
async fn test_commit_with_stale_token_still_persists() {
    let (memory, provider) = setup();
    seed(&provider, "s", &items(&[("k", "v1")])).await;
    let token = provider.get_item_exclusive("s").await.unwrap().lock_id().unwrap();

    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    provider
        .commit_and_release("s", &items(&[("k", "v2")]), Some(LockId::generate()), false)
        .await
        .unwrap();

    let key = provider.key_space().session("s");
    assert_eq!(memory.time_to_live(&key).await.unwrap(), Some(TIMEOUT));

    // The real holder's lock survives the mismatched release.
    let contended = provider.get_item("s").await.unwrap();
    assert_eq!(contended.lock_id(), Some(token));

    provider.release_lock("s", token).await.unwrap();
    let outcome = provider.get_item("s").await.unwrap();
    assert_eq!(outcome.data().unwrap().items, items(&[("k", "v2")]));
}

// ── Remove / timeout ────────────────────────────────────────────────

#[tokio::test]
async fn test_remove_requires_matching_token() {
    let (_, provider) = setup();
    seed(&provider, "S1", &items(&[("k", "v")])).await;
    let token = provider.get_item_exclusive("S1").await.unwrap().lock_id().unwrap();

    provider.remove("S1", Some(LockId::generate())).await.unwrap();
    assert!(provider.get_item("S1").await.unwrap().is_locked());

    provider.remove("S1", None).await.unwrap();
    assert!(provider.get_item("S1").await.unwrap().is_locked());

    provider.remove("S1", Some(token)).await.unwrap();
    assert_eq!(provider.get_item("S1").await.unwrap(), ReadOutcome::Missing);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_timeout_extends_expiry() {
    let (_, provider) = setup();
    provider.create_uninitialized("s", TIMEOUT).await.unwrap();

    tokio::time::advance(Duration::from_secs(15 * 60)).await;
    provider.refresh_timeout("s").await.unwrap();

    tokio::time::advance(Duration::from_secs(15 * 60)).await;
    assert_ne!(provider.get_item("s").await.unwrap(), ReadOutcome::Missing);

    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    assert_eq!(provider.get_item("s").await.unwrap(), ReadOutcome::Missing);
}

#[tokio::test]
async fn test_refresh_timeout_on_absent_record_is_noop() {
    let (memory, provider) = setup();
    provider.refresh_timeout("ghost").await.unwrap();
    assert!(memory.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_create_uninitialized_uses_given_timeout() {
    let (memory, provider) = setup();
    provider
        .create_uninitialized("s", Duration::from_secs(60))
        .await
        .unwrap();
    let key = provider.key_space().session("s");
    assert_eq!(
        memory.time_to_live(&key).await.unwrap(),
        Some(Duration::from_secs(60))
    );
}

// ── Failures ────────────────────────────────────────────────────────

async fn corrupt(memory: &MemoryStore, provider: &LockingSessionStore, id: &str) {
    let key = provider.key_space().session(id);
    memory
        .hash_set_with_expiry(&key, &[(record::DATA, b"\x01garbage".as_slice())], TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_corrupted_record_propagates_codec_error() {
    let (memory, provider) = setup_with_policy(false);
    corrupt(&memory, &provider, "bad").await;

    let err = provider.get_item_exclusive("bad").await.unwrap_err();
    assert!(matches!(err, Error::Codec(_)));

    // No lock is left behind by the failed read.
    let fields = memory
        .hash_get_all(&provider.key_space().session("bad"))
        .await
        .unwrap()
        .unwrap();
    assert!(!fields.contains_key(record::LOCK_ID));
}

#[tokio::test]
async fn test_corrupted_record_is_wrapped_when_logging() {
    let (memory, provider) = setup_with_policy(true);
    corrupt(&memory, &provider, "bad").await;

    let err = provider.get_item("bad").await.unwrap_err();
    assert!(matches!(err, Error::Provider));
}

#[test]
fn test_provider_surface() {
    let (_, provider) = setup();
    assert_eq!(provider.name(), "RedisSessionStateStore");
    assert!(!provider.supports_expire_callback());
    assert_eq!(provider.session_timeout(), TIMEOUT);

    let fresh = provider.create_new_store_data(Duration::from_secs(5));
    assert!(fresh.items.is_empty());
    assert_eq!(fresh.timeout, Duration::from_secs(5));
}
