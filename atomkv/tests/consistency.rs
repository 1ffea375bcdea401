use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atomkv::{
    keys, AtomRegistry, Backend, FeedConfig, MemStore, NamespacedStore, RegistryConfig, Status,
    StoreError,
};
use serde_json::{json, Value};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_failed_read_keeps_loading_until_reload() {
    init_logging();
    let store = MemStore::new();
    store.set_available(false);
    let registry = AtomRegistry::new(store.connect());

    let atom = registry.get_or_create("k", json!("dflt"));
    assert!(matches!(atom.ready().await, Err(StoreError::StorageUnavailable(_))));
    assert_eq!(atom.status(), Status::Loading);
    assert_eq!(atom.value(), json!("dflt"));
    assert!(atom.load_error().is_some());

    store.set_available(true);
    registry.reload(&atom);
    assert_eq!(atom.ready().await, Ok(Status::Empty));
    assert_eq!(atom.load_error(), None);
}

#[tokio::test]
async fn test_failed_write_is_not_rolled_back() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());
    let atom = registry.get_or_create("k", json!(0));
    atom.ready().await.unwrap();

    store.set_available(false);
    let result = atom.set(json!(1)).await;

    assert!(matches!(result, Err(StoreError::StorageUnavailable(_))));
    assert_eq!(atom.value(), json!(1));
    assert_eq!(atom.status(), Status::Loaded);
    assert_eq!(store.get("k"), None);
}

#[tokio::test]
async fn test_typed_write_of_unencodable_value_fails_before_commit() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());
    let atom = registry.get_or_create("k", json!(0));
    atom.ready().await.unwrap();

    // JSON object keys must be strings
    let value: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
    let result = atom.set_as(&value).await;

    assert!(matches!(result, Err(StoreError::SerializationFailure(_))));
    assert_eq!(atom.value(), json!(0));
    assert_eq!(store.stats().writes, 0);
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_writes_commit_in_program_order() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());
    let atom = registry.get_or_create("k", json!(0));

    let pending: Vec<_> = (1..=20).map(|i| atom.set(json!(i))).collect();
    for result in futures::future::join_all(pending).await {
        result.unwrap();
    }

    assert_eq!(store.get("k"), Some(json!(20)));
    assert_eq!(atom.value(), json!(20));
    assert_eq!(store.stats().writes, 20);

    settle().await;
    // Echoes of earlier writes never moved the atom backwards
    assert_eq!(atom.value(), json!(20));
}

#[tokio::test]
async fn test_last_write_wins_across_contexts() {
    let store = MemStore::new();
    let context_a = AtomRegistry::new(store.connect());
    let context_b = AtomRegistry::new(store.connect());
    let atom_a = context_a.get_or_create("k", json!(0));
    let atom_b = context_b.get_or_create("k", json!(0));
    atom_a.ready().await.unwrap();
    atom_b.ready().await.unwrap();

    atom_a.set(json!("a")).await.unwrap();
    atom_b.set(json!("b")).await.unwrap();

    eventually(|| atom_a.value() == json!("b")).await;
    settle().await;
    assert_eq!(atom_b.value(), json!("b"));
    assert_eq!(store.get("k"), Some(json!("b")));
}

#[tokio::test]
async fn test_own_write_notifies_once() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());
    let atom = registry.get_or_create("k", json!(0));
    atom.ready().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _sub = atom.subscribe(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    atom.set(json!(1)).await.unwrap();
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_write_from_listener_commits_last() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());
    let atom = registry.get_or_create("k", json!(0));
    atom.ready().await.unwrap();

    let writer = atom.clone();
    let _sub = atom.subscribe(move |value, _| {
        if *value == json!(1) {
            drop(writer.set(json!(2)));
        }
    });

    atom.set(json!(1)).await.unwrap();
    eventually(|| store.get("k") == Some(json!(2))).await;
    settle().await;

    assert_eq!(atom.value(), json!(2));
    assert_eq!(store.get("k"), Some(json!(2)));
    assert_eq!(store.stats().writes, 2);
}

#[tokio::test]
async fn test_written_field_removed_elsewhere_shows_lookup_default() {
    let store = MemStore::new();
    let context_a = AtomRegistry::new(store.connect());
    let context_b = AtomRegistry::new(store.connect());
    let ns_a = NamespacedStore::for_namespace(&context_a, keys::WIDGET_STORAGE, Some("w1")).unwrap();
    let ns_b = NamespacedStore::for_namespace(&context_b, keys::WIDGET_STORAGE, Some("w1")).unwrap();

    ns_a.set("count", json!(5)).await.unwrap();
    let written = context_a.get("WidgetStorage.w1.count").unwrap();
    ns_b.remove("count").await.unwrap();
    eventually(|| written.status() == Status::Empty).await;

    let atom = ns_a.get("count", json!(0)).unwrap();
    assert!(atom.ptr_eq(&written));
    assert_eq!(atom.value(), json!(0));
    assert_eq!(atom.status(), Status::Empty);
    assert_eq!(ns_a.document(), json!({"count": 0}));
}

#[tokio::test]
async fn test_removal_propagates_as_default() {
    let store = MemStore::new();
    let context_a = AtomRegistry::new(store.connect());
    let context_b = AtomRegistry::new(store.connect());

    context_a.set("k", json!("v")).await.unwrap();
    let atom_b = context_b.get_or_create("k", json!("dflt"));
    assert_eq!(atom_b.ready().await, Ok(Status::Loaded));

    context_a.remove("k").await.unwrap();
    eventually(|| atom_b.status() == Status::Empty).await;
    assert_eq!(atom_b.value(), json!("dflt"));
}

// ============================================================================
// Lagging change streams
// ============================================================================

/// Commit `k` several times, then enough unrelated commits to push every
/// `k` commit out of a two-slot feed before the observer's pump runs
async fn flood(store: &MemStore) {
    let writer = store.connect();
    for value in 1..=5 {
        writer
            .write_many(HashMap::from([("k".to_string(), json!(value))]))
            .await
            .unwrap();
    }
    for value in 1..=2 {
        writer
            .write_many(HashMap::from([("other".to_string(), json!(value))]))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_lagged_registry_resyncs() {
    init_logging();
    let store = MemStore::with_config(FeedConfig::default().with_capacity(2));
    let registry = AtomRegistry::new(store.connect());
    let atom = registry.get_or_create("k", json!(0));
    atom.ready().await.unwrap();

    flood(&store).await;

    eventually(|| atom.value() == json!(5)).await;
    assert_eq!(atom.status(), Status::Loaded);
}

#[tokio::test]
async fn test_lagged_registry_without_resync_stays_stale() {
    init_logging();
    let store = MemStore::with_config(FeedConfig::default().with_capacity(2));
    let registry = AtomRegistry::with_config(
        store.connect(),
        RegistryConfig::default().with_resync_on_lag(false),
    );
    let atom = registry.get_or_create("k", json!(0));
    atom.ready().await.unwrap();

    flood(&store).await;
    settle().await;

    assert_eq!(atom.value(), json!(0));
    assert_eq!(store.get("k"), Some(json!(5)));
}

// ============================================================================
// Listener release across threads
// ============================================================================

#[tokio::test]
async fn test_no_callback_after_release_returns() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());
    let atom = registry.get_or_create("k", json!(0));
    atom.ready().await.unwrap();

    let released = Arc::new(AtomicBool::new(false));
    let late_calls = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&released);
    let late = Arc::clone(&late_calls);
    let subscription = atom.subscribe(move |_: &Value, _| {
        if flag.load(Ordering::SeqCst) {
            late.fetch_add(1, Ordering::SeqCst);
        }
    });

    let writer_atom = atom.clone();
    let hammer = std::thread::spawn(move || {
        for i in 0..2_000 {
            // The commit is irrelevant here; only the local dispatch matters.
            drop(writer_atom.set(json!(i)));
        }
    });

    std::thread::sleep(Duration::from_millis(1));
    subscription.unsubscribe();
    released.store(true, Ordering::SeqCst);

    hammer.join().unwrap();
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(atom.listener_count(), 0);
}
