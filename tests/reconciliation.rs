//! End-to-end behavior of the async reconciling wrappers against a mock
//! backend, driven by tokio's paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{settle, MockBackend};
use floodgate::{
    AddAndGetRequest, AsyncBatchStorage, AsyncSlidingStorage, CounterFilter, InMemorySlidingStorage,
    InMemoryStorage, LimitKey, ManualClock, UsageStorage,
};

const PERIOD: Duration = Duration::from_secs(2);
const WINDOW: Duration = Duration::from_secs(3600);

fn at(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).expect("valid timestamp")
}

fn request(property: &str, event: DateTime<Utc>, cost: i64) -> AddAndGetRequest {
    AddAndGetRequest::builder("search", "per-user", property)
        .window_length(WINDOW)
        .event_timestamp(event)
        .cost(cost)
        .distributed(true)
        .build()
}

/// Wrapper whose cache clock is pinned, so bucket eviction is driven by the
/// test rather than the wall clock.
async fn batch_storage(
    backend: Arc<MockBackend>,
    force_cache_init: bool,
) -> (Arc<ManualClock>, AsyncBatchStorage) {
    let clock = Arc::new(ManualClock::epoch());
    let cache = Arc::new(InMemoryStorage::with_clock(clock.clone()));
    let storage = AsyncBatchStorage::builder(backend, PERIOD)
        .first_sync_delay(PERIOD)
        .force_cache_init(force_cache_init)
        .cache(cache)
        .build()
        .await
        .expect("build storage");
    (clock, storage)
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

#[tokio::test(start_paused = true)]
async fn requests_are_served_from_the_cache_only() {
    let backend = Arc::new(MockBackend::new());
    let (_, storage) = batch_storage(backend.clone(), false).await;

    let (_, first) = storage.add_and_get_one(request("alice", at(100), 1)).await.unwrap();
    let (_, second) = storage.add_and_get_one(request("alice", at(200), 1)).await.unwrap();

    assert_eq!((first, second), (1, 2));
    assert_eq!(backend.add_calls(), 0, "request path must never touch the backend");
}

#[tokio::test(start_paused = true)]
async fn periodic_flush_drains_delta_and_folds_the_total_back() {
    let backend = Arc::new(MockBackend::new());
    let seeded = request("alice", at(100), 0);
    backend.seed(LimitKey::from_request(&seeded), 10);

    let (_, storage) = batch_storage(backend.clone(), false).await;
    storage.add_and_get_one(request("alice", at(100), 3)).await.unwrap();

    tokio::time::advance(PERIOD).await;
    settle().await;

    assert_eq!(backend.value_of(&LimitKey::from_request(&seeded)), Some(13));
    let (_, value) = storage.add_and_get_one(request("alice", at(100), 0)).await.unwrap();
    assert_eq!(value, 13, "cache should now reflect the authoritative total");

    // `counters` reports the backend's view, not the cache's.
    let remote = storage.counters(&CounterFilter::all()).await.unwrap();
    assert_eq!(remote.values().copied().sum::<i64>(), 13);
}

#[tokio::test(start_paused = true)]
async fn first_sweep_lands_one_delay_after_construction() {
    let backend = Arc::new(MockBackend::new());
    let (_, storage) = batch_storage(backend.clone(), false).await;
    storage.add_and_get_one(request("alice", at(100), 1)).await.unwrap();

    // The schedule is anchored at build time, so the sweep fires even if the
    // task was never polled before time moved.
    tokio::time::advance(PERIOD).await;
    settle().await;
    assert_eq!(backend.add_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn local_counters_are_never_flushed() {
    let backend = Arc::new(MockBackend::new());
    let (_, storage) = batch_storage(backend.clone(), false).await;

    let local = AddAndGetRequest::builder("search", "per-user", "alice")
        .window_length(WINDOW)
        .event_timestamp(at(100))
        .cost(5)
        .build();
    storage.add_and_get_one(local).await.unwrap();

    tokio::time::advance(PERIOD).await;
    settle().await;

    assert_eq!(backend.add_calls(), 0);
    assert_eq!(backend.stored_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn outage_keeps_the_delta_for_the_next_cycle() {
    let backend = Arc::new(MockBackend::new());
    backend.set_failing(true);
    let (_, storage) = batch_storage(backend.clone(), false).await;

    storage.add_and_get_one(request("alice", at(100), 3)).await.unwrap();

    tokio::time::advance(PERIOD).await;
    settle().await;
    assert_eq!(backend.add_calls(), 1);
    assert_eq!(backend.stored_len(), 0);
    let (_, value) = storage.add_and_get_one(request("alice", at(100), 0)).await.unwrap();
    assert_eq!(value, 3, "failed flush must leave the delta untouched");

    backend.set_failing(false);
    tokio::time::advance(PERIOD).await;
    settle().await;

    let seeded = LimitKey::from_request(&request("alice", at(100), 0));
    assert_eq!(backend.value_of(&seeded), Some(3), "retry sends the accumulated delta");
    let (_, value) = storage.add_and_get_one(request("alice", at(100), 0)).await.unwrap();
    assert_eq!(value, 3);
}

#[tokio::test(start_paused = true)]
async fn traffic_during_a_flush_is_never_lost() {
    let backend = Arc::new(MockBackend::new());
    let (_, storage) = batch_storage(backend.clone(), false).await;

    storage.add_and_get_one(request("alice", at(100), 10)).await.unwrap();

    backend.gate_next_call();
    tokio::time::advance(PERIOD).await;
    wait_until(|| backend.is_gated()).await;

    // The flush snapshot (delta = 10) is on the wire; more traffic arrives.
    storage.add_and_get_one(request("alice", at(100), 4)).await.unwrap();
    backend.release();
    settle().await;

    let key = LimitKey::from_request(&request("alice", at(100), 0));
    assert_eq!(backend.value_of(&key), Some(10), "only the snapshot was flushed");
    let (_, value) = storage.add_and_get_one(request("alice", at(100), 0)).await.unwrap();
    assert_eq!(value, 14, "backend total plus post-snapshot delta");
}

#[tokio::test(start_paused = true)]
async fn counter_evicted_during_a_flush_is_abandoned() {
    let backend = Arc::new(MockBackend::new());
    let (clock, storage) = batch_storage(backend.clone(), false).await;

    storage.add_and_get_one(request("alice", at(100), 10)).await.unwrap();

    backend.gate_next_call();
    tokio::time::advance(PERIOD).await;
    wait_until(|| backend.is_gated()).await;

    // The window ends while the flush is in flight; a mutating call sweeps
    // the bucket away.
    clock.set(at(7_200_000));
    storage.add_and_get_one(request("alice", at(7_200_100), 1)).await.unwrap();
    backend.release();
    settle().await;

    let old_key = LimitKey::from_request(&request("alice", at(100), 0));
    assert_eq!(backend.value_of(&old_key), Some(10), "in-flight increment still lands");
    let cached = storage.cache_counters().await.unwrap();
    assert!(!cached.contains_key(&old_key), "abandoned entry must not be resurrected");
    assert_eq!(cached.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn force_cache_init_seeds_the_cache_from_the_backend() {
    let backend = Arc::new(MockBackend::new());
    backend.seed(LimitKey::from_request(&request("alice", at(100), 0)), 10);

    let (_, storage) = batch_storage(backend.clone(), true).await;

    let (_, value) = storage.add_and_get_one(request("alice", at(100), 1)).await.unwrap();
    assert_eq!(value, 11, "fresh process must see traffic recorded elsewhere");
}

#[tokio::test(start_paused = true)]
async fn close_stops_the_reconciliation_task() {
    let backend = Arc::new(MockBackend::new());
    let (_, storage) = batch_storage(backend.clone(), false).await;

    storage.add_and_get_one(request("alice", at(100), 3)).await.unwrap();
    storage.close().await.unwrap();
    assert!(backend.is_closed());

    let calls_after_close = backend.add_calls();
    tokio::time::advance(PERIOD * 4).await;
    settle().await;
    assert_eq!(backend.add_calls(), calls_after_close);
}

#[tokio::test(start_paused = true)]
async fn sliding_slides_flush_as_their_own_buckets() {
    let backend = Arc::new(MockBackend::new());
    let clock = Arc::new(ManualClock::new(at(20_000)));
    let retention = Duration::from_secs(60);
    let slide_size = Duration::from_secs(1);
    let cache =
        Arc::new(InMemorySlidingStorage::with_clock(retention, slide_size, clock.clone()));
    let storage = AsyncSlidingStorage::builder(backend.clone(), PERIOD, retention, slide_size)
        .first_sync_delay(PERIOD)
        .cache(cache)
        .build()
        .await
        .expect("build storage");

    let fresh = AddAndGetRequest::builder("search", "per-user", "alice")
        .window_length(Duration::from_secs(10))
        .event_timestamp(at(20_000))
        .cost(2)
        .distributed(true)
        .build();
    // Ten seconds old: still cached (retention is 60s) but older than
    // sync_period + slide_size, so reconciling it would race eviction.
    let stale = AddAndGetRequest::builder("search", "per-user", "alice")
        .window_length(Duration::from_secs(10))
        .event_timestamp(at(10_000))
        .cost(5)
        .distributed(true)
        .build();
    storage.add_and_get(&[fresh, stale]).await.unwrap();

    tokio::time::advance(PERIOD).await;
    settle().await;

    assert_eq!(backend.stored_len(), 1, "stale slide must be skipped");
    let flushed = LimitKey::new("search", "per-user", "alice", true, at(20_000), slide_size);
    assert_eq!(backend.value_of(&flushed), Some(2));
}
