//! End-to-end behaviour of a client's query and mutation caches.

use rstest::rstest;
use serde_json::{Value, json};
use stash::query::{ConsumerId, ManualClock, QueryDefaults};
use stash::{
    Client, DataState, EntryKey, Expiry, Failure, MutationOptions, QueryFilter, QueryOptions, Status, key,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

fn client_at(now: u64) -> (Client, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now));
    let client = Client::builder().clock(clock.clone()).build().unwrap();
    (client, clock)
}

fn counting(key: EntryKey, calls: &Arc<AtomicUsize>) -> QueryOptions {
    let calls = calls.clone();
    QueryOptions::new(key, move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok::<_, Failure>(n) }
    })
}

#[rstest]
#[case::object_order(key![{"a": 1, "b": 2}], key![{"b": 2, "a": 1}], true)]
#[case::array_order(key!["a", "b"], key!["b", "a"], false)]
#[case::nested(key!["t", {"f": {"x": [1, 2], "y": null}}], key!["t", {"f": {"y": null, "x": [1, 2]}}], true)]
fn canonical_keys_share_an_entry(#[case] left: EntryKey, #[case] right: EntryKey, #[case] same: bool) {
    assert_eq!(left.to_cache_key() == right.to_cache_key(), same);
    let client = Client::new();
    let entry = client.query_cache().set_query_data(&left, json!(1));
    let found = client.query_cache().get(&right);
    assert_eq!(found.is_some_and(|found| Arc::ptr_eq(&found, &entry)), same);
}

#[tokio::test]
async fn fetch_then_refresh_with_zero_stale_time_calls_again() {
    let client = Client::new();
    let queries = client.query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = queries.ensure(counting(key!["x"], &calls).stale_time(Expiry::millis(0)));

    let state = queries.fetch(&entry).await.unwrap();
    assert_eq!(state.data(), Some(&json!(1)));
    assert_eq!(entry.state().data(), Some(&json!(1)));

    queries.refresh(&entry).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(entry.state().data(), Some(&json!(2)));
}

#[test]
fn set_query_data_on_unseen_key() {
    let client = Client::new();
    let queries = client.query_cache();
    assert_eq!(queries.get_query_data(&key!["y"]), None);

    let entry = queries.set_query_data(&key!["y"], json!("v1"));
    assert_eq!(entry.state().status(), Status::Success);
    assert_eq!(entry.state().data(), Some(&json!("v1")));
    assert_eq!(queries.get_query_data(&key!["y"]), Some(json!("v1")));
}

#[tokio::test]
async fn only_latest_fetch_writes_state() {
    let (client, clock) = client_at(1_000);
    let queries = client.query_cache();
    let (first_tx, first_rx) = oneshot::channel::<i64>();
    let (second_tx, second_rx) = oneshot::channel::<i64>();
    let pending = Arc::new(Mutex::new(VecDeque::from([first_rx, second_rx])));
    let entry = queries.ensure(QueryOptions::new(key!["race"], move |_| {
        let rx = pending.lock().unwrap().pop_front().unwrap();
        async move { Ok::<_, Failure>(rx.await.unwrap()) }
    }));

    let first = queries.fetch(&entry);
    let second = queries.fetch(&entry);

    clock.set(2_000);
    second_tx.send(2).unwrap();
    assert_eq!(second.await.unwrap().data(), Some(&json!(2)));

    clock.set(3_000);
    first_tx.send(1).unwrap();
    // The superseded call still resolves with its own value.
    assert_eq!(first.await.unwrap().data(), Some(&json!(1)));

    assert_eq!(entry.state().data(), Some(&json!(2)));
    assert_eq!(entry.when(), 2_000);
    assert!(!entry.is_pending());
}

#[tokio::test]
async fn concurrent_refreshes_share_one_call() {
    let client = Client::new();
    let queries = client.query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = queries.ensure(counting(key!["shared"], &calls));

    let (a, b, c) = tokio::join!(queries.refresh(&entry), queries.refresh(&entry), queries.refresh(&entry));
    assert_eq!(a.unwrap(), b.unwrap());
    assert!(c.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn staleness_follows_stale_time() {
    let (client, clock) = client_at(1_000);
    let queries = client.query_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let finite = queries.ensure(counting(key!["finite"], &calls).stale_time(Expiry::millis(1_000)));
    queries.set_query_data(&key!["finite"], json!(1));
    let infinite = queries.ensure(counting(key!["infinite"], &calls).stale_time(Expiry::Never));
    assert!(infinite.is_stale());
    queries.set_query_data(&key!["infinite"], json!(1));

    clock.set(1_999);
    assert!(!finite.is_stale());
    clock.set(2_000);
    assert!(finite.is_stale());

    clock.set(u64::MAX / 2);
    assert!(!infinite.is_stale());
    queries.invalidate(&infinite);
    assert!(infinite.is_stale());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn ensure_returns_the_same_entry_for_equal_keys() {
    let client = Client::new();
    let queries = client.query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let first = queries.ensure(counting(key!["todos", {"page": 1, "sort": "asc"}], &calls));
    let second = queries.ensure(
        counting(key!["todos", {"sort": "asc", "page": 1}], &calls).stale_time(Expiry::Never),
    );
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(queries.len(), 1);
    assert_eq!(second.options().map(|options| options.stale_time), Some(Expiry::Never));
}

#[test]
fn key_tree_keeps_descendants() {
    let client = Client::new();
    let queries = client.query_cache();
    queries.set_query_data(&key!["a", "b", "c"], json!("x"));
    queries.set_query_data(&key!["a", "b", "d"], json!("y"));
    assert!(queries.get(&key!["a", "b"]).is_none());
    assert_eq!(queries.get_entries(&QueryFilter::new().key(key!["a", "b"])).len(), 2);

    let parent = queries.set_query_data(&key!["a", "b"], json!("z"));
    queries.remove(&parent);
    assert_eq!(queries.get_query_data(&key!["a", "b", "c"]), Some(json!("x")));
    assert_eq!(queries.get_query_data(&key!["a", "b", "d"]), Some(json!("y")));
}

#[tokio::test(start_paused = true)]
async fn gc_waits_for_last_consumer() {
    let client = Client::new();
    let queries = client.query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = queries.ensure(counting(key!["gc"], &calls).gc_time(Expiry::secs(1)));
    let (one, two, three) = (ConsumerId::new(), ConsumerId::new(), ConsumerId::new());

    queries.track(&entry, one);
    queries.track(&entry, two);
    queries.untrack(&entry, one);
    assert!(!entry.gc_scheduled());
    queries.untrack(&entry, two);
    assert!(entry.gc_scheduled());

    queries.track(&entry, three);
    assert!(!entry.gc_scheduled());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(queries.get(&key!["gc"]).is_some());

    queries.untrack(&entry, three);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(queries.get(&key!["gc"]).is_none());
}

#[tokio::test]
async fn error_keeps_previous_data() {
    let client = Client::new();
    let queries = client.query_cache();
    queries.set_query_data(&key!["n"], json!(5));
    let entry = queries.ensure(QueryOptions::new(key!["n"], |_| async { Err::<Value, _>(Failure::msg("offline")) }));

    let failure = queries.fetch(&entry).await.unwrap_err();
    assert_eq!(failure.to_string(), "offline");
    let state = entry.state();
    assert_eq!(state.status(), Status::Error);
    assert_eq!(state.data(), Some(&json!(5)));
    assert_eq!(state.error(), Some(&failure));
}

#[tokio::test]
async fn mutation_invalidates_and_refetches_active_queries() {
    let (client, clock) = client_at(1_000);
    let queries = client.query_cache();
    let mutations = client.mutation_cache();
    let (active_calls, inactive_calls, other_calls) =
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));

    let active = queries.ensure(counting(key!["todos", "open"], &active_calls));
    let inactive = queries.ensure(counting(key!["todos", "done"], &inactive_calls));
    let other = queries.ensure(counting(key!["users"], &other_calls));
    queries.track(&active, ConsumerId::new());
    for entry in [&active, &inactive, &other] {
        queries.fetch(entry).await.unwrap();
    }

    clock.set(5_000);
    let create = mutations.create(
        MutationOptions::new(|vars: Value, _| async move { Ok::<_, Failure>(vars) }).invalidate_keys(vec![key!["todos"]]),
    );
    let create = mutations.ensure(&create, json!({"title": "ship"})).unwrap();
    let created = mutations.mutate(&create, json!({"title": "ship"})).await.unwrap();
    assert_eq!(created, json!({"title": "ship"}));

    assert_eq!(active_calls.load(Ordering::SeqCst), 2);
    assert_eq!(active.when(), 5_000);
    assert_eq!(active.state().data(), Some(&json!(2)));

    assert_eq!(inactive_calls.load(Ordering::SeqCst), 1);
    assert_eq!(inactive.when(), 0);
    assert!(inactive.is_stale());

    assert_eq!(other_calls.load(Ordering::SeqCst), 1);
    assert_eq!(other.when(), 1_000);
}

#[tokio::test]
async fn failed_mutation_leaves_queries_alone() {
    let client = Client::new();
    let queries = client.query_cache();
    let mutations = client.mutation_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let todos = queries.ensure(counting(key!["todos"], &calls));
    queries.fetch(&todos).await.unwrap();
    let when = todos.when();

    let failing = mutations.create(
        MutationOptions::new(|_, _| async { Err::<Value, _>(Failure::msg("rejected")) })
            .invalidate_keys(vec![key!["todos"]]),
    );
    let failing = mutations.ensure(&failing, json!(null)).unwrap();
    assert!(mutations.mutate(&failing, json!(null)).await.is_err());
    assert_eq!(failing.state().status(), Status::Error);
    assert_eq!(todos.when(), when);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn serialized_cache_hydrates_a_fresh_client() {
    let (source, _) = client_at(1_000);
    source.query_cache().set_query_data(&key!["todos", {"page": 1}], json!(["a", "b"]));
    source.query_cache().set_entry_state(
        &source.query_cache().set_query_data(&key!["broken"], json!(1)),
        DataState::success(json!(1)).failed(Failure::msg("boom")),
    );
    let snapshot = serde_json::to_value(source.query_cache().serialize()).unwrap();

    let target = Client::builder()
        .defaults(QueryDefaults { stale_time: Expiry::Never, ..QueryDefaults::default() })
        .build()
        .unwrap();
    target.query_cache().hydrate_json(snapshot).unwrap();

    let todos = target.query_cache().get(&key!["todos", {"page": 1}]).unwrap();
    assert_eq!(todos.state().data(), Some(&json!(["a", "b"])));
    assert_eq!(todos.when(), 1_000);
    let broken = target.query_cache().get(&key!["broken"]).unwrap();
    assert_eq!(broken.state().status(), Status::Error);
    assert_eq!(broken.state().error().map(ToString::to_string), Some(String::from("boom")));
}
