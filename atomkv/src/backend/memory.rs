//! In-memory store shared by several contexts

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::feed::{ChangeFeed, ChangeStream};
use super::types::{Backend, Key, ReadOutcome};
use crate::config::FeedConfig;
use crate::error::StoreError;
use crate::idgen::{ContextId, IdGen};

/// Number of backend calls served by a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub removes: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
}

struct Shared {
    documents: Mutex<HashMap<Key, Value>>,
    feed: ChangeFeed,
    ids: IdGen,
    available: AtomicBool,
    counters: Counters,
}

/// In-memory key/value service
///
/// Plays the role of the durable store that all contexts share. Each call
/// to [`MemStore::connect`] yields the adapter of a new context. Useful for
/// tests and single-process use.
///
/// `set_available(false)` makes every operation fail with
/// `StoreError::StorageUnavailable` until availability is restored.
#[derive(Clone)]
pub struct MemStore {
    shared: Arc<Shared>,
}

impl MemStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(FeedConfig::default())
    }

    #[must_use]
    pub fn with_config(config: FeedConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                documents: Mutex::new(HashMap::new()),
                feed: ChangeFeed::new(config, "memstore"),
                ids: IdGen::new(),
                available: AtomicBool::new(true),
                counters: Counters::default(),
            }),
        }
    }

    /// Connect a new context to the store
    #[must_use]
    pub fn connect(&self) -> MemBackend {
        let context = self.shared.ids.next_context();
        debug!("memstore.connect: {context}");
        MemBackend {
            store: self.clone(),
            context,
        }
    }

    /// Simulate the service going offline or coming back
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    /// Stored value of a key, bypassing any context
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.shared.documents.lock().get(key).cloned()
    }

    /// Stored keys starting with `prefix`, sorted
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<Key> {
        let documents = self.shared.documents.lock();
        let mut keys: Vec<Key> = documents
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.documents.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.documents.lock().is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let counters = &self.shared.counters;
        StoreStats {
            reads: counters.reads.load(Ordering::SeqCst),
            writes: counters.writes.load(Ordering::SeqCst),
            removes: counters.removes.load(Ordering::SeqCst),
        }
    }

    fn check_available(&self, operation: &str) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::unavailable(format!("memstore offline during {operation}")))
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One context's adapter to a [`MemStore`]
pub struct MemBackend {
    store: MemStore,
    context: ContextId,
}

impl MemBackend {
    /// The store this adapter is connected to
    #[must_use]
    pub fn store(&self) -> &MemStore {
        &self.store
    }
}

impl Backend for MemBackend {
    fn context(&self) -> ContextId {
        self.context
    }

    async fn read_many(&self, requests: HashMap<Key, Value>) -> Result<ReadOutcome, StoreError> {
        self.store.check_available("read_many")?;
        let shared = &self.store.shared;
        shared.counters.reads.fetch_add(1, Ordering::SeqCst);

        let documents = shared.documents.lock();
        ReadOutcome::try_merge_with_defaults(requests, |key| Ok(documents.get(key).cloned()))
    }

    async fn write_many(&self, patch: HashMap<Key, Value>) -> Result<(), StoreError> {
        self.store.check_available("write_many")?;
        let shared = &self.store.shared;
        shared.counters.writes.fetch_add(1, Ordering::SeqCst);

        let mut documents = shared.documents.lock();
        for (key, value) in patch {
            shared.feed.publish(self.context, &key, Some(value.clone()));
            documents.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, keys: HashSet<Key>) -> Result<(), StoreError> {
        self.store.check_available("remove")?;
        let shared = &self.store.shared;
        shared.counters.removes.fetch_add(1, Ordering::SeqCst);

        let mut documents = shared.documents.lock();
        for key in keys {
            if documents.remove(&key).is_some() {
                shared.feed.publish(self.context, &key, None);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> ChangeStream {
        self.store.shared.feed.subscribe(self.context)
    }
}
