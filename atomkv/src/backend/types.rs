//! Backend types and traits

use std::collections::{HashMap, HashSet};
use std::future::Future;

use serde_json::Value;

use super::feed::ChangeStream;
use crate::error::StoreError;
use crate::idgen::ContextId;

/// Key of a stored document within the flat backing store
pub type Key = String;

/// Whether a change was committed through the observing context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Committed by the same context that observes it (an echo)
    Local,
    /// Committed by another context
    Remote,
}

/// Notification that the stored value of a key changed
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: Key,
    /// New value, `None` when the key was removed
    pub value: Option<Value>,
    pub origin: Origin,
}

impl ChangeEvent {
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.value.is_none()
    }
}

/// Result of a batched read
///
/// Holds a value for every requested key: the stored one when present,
/// otherwise the caller's default. Keys that were answered with a default
/// are remembered as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOutcome {
    values: HashMap<Key, Value>,
    absent: HashSet<Key>,
}

impl ReadOutcome {
    /// Build an outcome by looking up every requested key
    ///
    /// # Errors
    ///
    /// Returns the first error reported by `lookup`.
    pub fn try_merge_with_defaults<F>(
        requests: HashMap<Key, Value>,
        mut lookup: F,
    ) -> Result<Self, StoreError>
    where
        F: FnMut(&str) -> Result<Option<Value>, StoreError>,
    {
        let mut outcome = Self::default();
        for (key, default) in requests {
            match lookup(&key)? {
                Some(stored) => {
                    outcome.values.insert(key, stored);
                }
                None => {
                    outcome.absent.insert(key.clone());
                    outcome.values.insert(key, default);
                }
            }
        }
        Ok(outcome)
    }

    /// Resolved value for a key (stored value or default)
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether the key had no stored value
    #[must_use]
    pub fn is_absent(&self, key: &str) -> bool {
        self.absent.contains(key)
    }

    /// Remove a key from the outcome, returning its value and whether it was found
    pub fn take(&mut self, key: &str) -> Option<(Value, bool)> {
        let value = self.values.remove(key)?;
        let found = !self.absent.remove(key);
        Some((value, found))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-context adapter to the shared key/value service
///
/// Every operation may fail with `StoreError::StorageUnavailable`.
/// Implementations never write defaults back to the store.
pub trait Backend: Send + Sync + 'static {
    /// Context this adapter commits on behalf of
    fn context(&self) -> ContextId;

    /// Batched read: stored value for each key, or the supplied default.
    fn read_many(
        &self,
        requests: HashMap<Key, Value>,
    ) -> impl Future<Output = Result<ReadOutcome, StoreError>> + Send;

    /// Batched partial write. Keys not in the patch are untouched.
    ///
    /// Callers must not depend on atomicity across keys.
    fn write_many(
        &self,
        patch: HashMap<Key, Value>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete keys. Missing keys are ignored.
    fn remove(&self, keys: HashSet<Key>) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Subscribe to commits of every context.
    ///
    /// Drop the stream to unsubscribe.
    fn subscribe(&self) -> ChangeStream;
}
