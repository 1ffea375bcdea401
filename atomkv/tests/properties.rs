use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atomkv::{keys, AtomRegistry, Binding, MemStore, NamespacedStore, Status, StoreError};
use serde_json::{json, Value};

/// Let spawned tasks (loads, writer, change pumps) run
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

fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value, Status) + Send + Sync + 'static) {
    let calls = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&calls);
    (calls, move |_: &Value, _: Status| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

// --------------------------------------------------------------------
// Defaults
//

#[tokio::test]
async fn test_unwritten_key_is_empty_with_default() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());

    for (key, default) in [("a", json!(0)), ("b", json!({"x": [1, 2]})), ("c", Value::Null)] {
        let atom = registry.get_or_create(key, default.clone());
        assert_eq!(atom.ready().await, Ok(Status::Empty));
        assert_eq!(atom.value(), default);
    }

    // Defaults are never persisted
    assert!(store.is_empty());
    assert_eq!(store.stats().writes, 0);
}

// --------------------------------------------------------------------
// Read-your-write
//

#[tokio::test]
async fn test_read_your_write() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());

    let atom = registry.get_or_create("k", json!(0));
    atom.set(json!("v")).await.unwrap();

    let again = registry.get_or_create("k", json!(0));
    assert_eq!(again.value(), json!("v"));
    assert_eq!(again.status(), Status::Loaded);

    // A fresh context reads the committed value
    let fresh = AtomRegistry::new(store.connect());
    let atom = fresh.get_or_create("k", json!(0));
    assert_eq!(atom.ready().await, Ok(Status::Loaded));
    assert_eq!(atom.value(), json!("v"));
}

// --------------------------------------------------------------------
// Singleton per key
//

#[tokio::test]
async fn test_same_key_yields_same_atom() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());

    let first = registry.get_or_create("k", json!(1));
    let second = registry.get_or_create("k", json!(2));
    assert!(first.ptr_eq(&second));
    assert_eq!(registry.len(), 1);

    let _sub = first.subscribe(|_, _| {});
    assert_eq!(second.listener_count(), 1);

    first.ready().await.unwrap();
    second.ready().await.unwrap();
    // Both lookups happened before the read resolved; only one read was issued
    assert_eq!(store.stats().reads, 1);
    // The first lookup's default wins
    assert_eq!(second.value(), json!(1));
}

// --------------------------------------------------------------------
// Cross-context propagation
//

#[tokio::test]
async fn test_write_reaches_other_context() {
    let store = MemStore::new();
    let context_a = AtomRegistry::new(store.connect());
    let context_b = AtomRegistry::new(store.connect());

    let observed = context_b.get_or_create(keys::ACTIVE_THEME, json!("light"));
    observed.ready().await.unwrap();
    let (_binding, mut changes) = Binding::channel(&observed);

    context_a.set(keys::ACTIVE_THEME, json!("dark")).await.unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("change not delivered")
        .expect("binding closed");
    assert_eq!(snapshot.value, json!("dark"));
    assert_eq!(snapshot.status, Status::Loaded);
    assert_eq!(store.stats().reads, 1);
}

// --------------------------------------------------------------------
// Namespace isolation
//

#[tokio::test]
async fn test_fields_are_isolated() {
    let store = MemStore::new();
    let context_a = AtomRegistry::new(store.connect());
    let context_b = AtomRegistry::new(store.connect());
    let ns_a = NamespacedStore::for_namespace(&context_a, keys::WIDGET_STORAGE, Some("w1")).unwrap();
    let ns_b = NamespacedStore::for_namespace(&context_b, keys::WIDGET_STORAGE, Some("w1")).unwrap();

    let (f2_calls_a, listener_a) = counter();
    let (f2_calls_b, listener_b) = counter();
    let f2_a = ns_a.bind("f2", json!(0), listener_a).unwrap();
    let f2_b = ns_b.bind("f2", json!(0), listener_b).unwrap();
    f2_a.atom().ready().await.unwrap();
    f2_b.atom().ready().await.unwrap();
    let baseline_a = f2_calls_a.load(Ordering::SeqCst);
    let baseline_b = f2_calls_b.load(Ordering::SeqCst);

    let f1_b = ns_b.get("f1", json!(0)).unwrap();
    f1_b.ready().await.unwrap();

    ns_a.set("f1", json!(1)).await.unwrap();
    eventually(|| f1_b.value() == json!(1)).await;
    settle().await;

    assert_eq!(f2_calls_a.load(Ordering::SeqCst), baseline_a);
    assert_eq!(f2_calls_b.load(Ordering::SeqCst), baseline_b);
    assert_eq!(f2_a.snapshot().value, json!(0));
}

// --------------------------------------------------------------------
// Partial patches
//

#[tokio::test]
async fn test_field_writes_compose_into_document() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());
    let ns = NamespacedStore::for_namespace(&registry, keys::WIDGET_STORAGE, Some("widget-42")).unwrap();

    ns.set("title", json!("A")).await.unwrap();
    ns.set("body", json!("hello")).await.unwrap();

    assert_eq!(ns.document(), json!({"title": "A", "body": "hello"}));
    assert_eq!(store.get("WidgetStorage.widget-42.title"), Some(json!("A")));
    assert_eq!(store.get("WidgetStorage.widget-42.body"), Some(json!("hello")));

    // Another context reconstructs the same document
    let other = AtomRegistry::new(store.connect());
    let ns = NamespacedStore::for_namespace(&other, keys::WIDGET_STORAGE, Some("widget-42")).unwrap();
    let document = ns
        .load_document([("title", json!("")), ("body", json!("")), ("footer", json!(null))])
        .await
        .unwrap();
    assert_eq!(document, json!({"title": "A", "body": "hello", "footer": null}));
}

// --------------------------------------------------------------------
// Default, then resolve, then write
//

#[tokio::test]
async fn test_binding_moves_from_loading_to_empty_to_loaded() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());
    let ns = NamespacedStore::for_namespace(&registry, keys::WIDGET_STORAGE, Some("widget-42")).unwrap();

    let (calls, listener) = counter();
    let binding = ns.bind("count", json!(0), listener).unwrap();
    let (value, _, status) = binding.current();
    assert_eq!((value, status), (json!(0), Status::Loading));

    binding.atom().ready().await.unwrap();
    let (value, setter, status) = binding.current();
    assert_eq!((value, status), (json!(0), Status::Empty));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    setter.set(json!(5)).await.unwrap();
    let (value, _, status) = binding.current();
    assert_eq!((value, status), (json!(5), Status::Loaded));
    assert_eq!(binding.value_as::<u32>(), Ok(5));
}

// --------------------------------------------------------------------
// Unsubscribe
//

#[tokio::test]
async fn test_detached_binding_gets_no_callbacks() {
    let store = MemStore::new();
    let context_a = AtomRegistry::new(store.connect());
    let context_b = AtomRegistry::new(store.connect());

    let atom = context_b.get_or_create("k", json!(0));
    atom.ready().await.unwrap();
    let (calls, listener) = counter();
    let binding = Binding::attach(&atom, listener);
    binding.detach();

    context_a.set("k", json!(1)).await.unwrap();
    eventually(|| atom.value() == json!(1)).await;
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(atom.listener_count(), 0);
}

#[tokio::test]
async fn test_missing_identifier_is_fatal() {
    let store = MemStore::new();
    let registry = AtomRegistry::new(store.connect());

    let result = NamespacedStore::for_namespace(&registry, keys::PLUGIN_STORAGE, None);
    assert_eq!(
        result.err(),
        Some(StoreError::NamespaceMissingIdentifier {
            prefix: keys::PLUGIN_STORAGE.to_string()
        })
    );
    assert!(registry.is_empty());
}
