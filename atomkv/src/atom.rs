//! Atom - reactive cell caching one stored key
//!
//! An atom holds the last known value of its key, a loading status and a
//! set of listeners. Atoms are created and loaded by the
//! [`AtomRegistry`](crate::AtomRegistry); there is at most one atom per key
//! per registry.
//!
//! # Status transitions
//!
//! ```text
//! uninitialized --(registry lookup)--------------> loading
//! loading -------(read found a value)------------> loaded
//! loading -------(read found nothing)------------> empty    (value = default)
//! loading -------(read failed)-------------------> loading  (error via ready()/load_error())
//! any -----------(set, or change with a value)---> loaded
//! any -----------(remove, or removal change)-----> empty    (value = default)
//! ```
//!
//! # Versions
//!
//! Every local write and every applied change bumps the atom's version.
//! A read result is applied only if the version it was issued against is
//! still current, so a slow read never overwrites newer state.
//!
//! # Listeners
//!
//! Listeners are invoked outside the atom's state lock. Each listener sits
//! in a slot guarded by a reentrant lock that is held for the whole
//! callback; releasing a [`Subscription`] clears the slot under that lock.
//! Once `unsubscribe` (or drop) returns, the listener is never invoked
//! again, even if a dispatch was already in flight on another thread.
//!
//! Every snapshot carries the version that produced it. A listener never
//! sees an older snapshot after a newer one: when a listener writes to the
//! atom from inside its callback, or two threads update the atom at once,
//! the older snapshot is dropped for listeners the newer one has reached.
//!
//! # Echoes
//!
//! A context sees its own commits on the change stream. Such an echo is
//! ignored while the atom still shows the context's latest write, and also
//! when a later local write is still in flight. It is applied only when a
//! remote change was applied after the local write, so the atom ends on
//! whichever commit the backend ordered last.

use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::backend::{ChangeEvent, Key, Origin};
use crate::error::StoreError;

/// Relationship of an atom to the backend's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Uninitialized,
    Loading,
    /// The value came from the store, a local write or a change event
    Loaded,
    /// The store has no value; the atom holds its default
    Empty,
}

impl Status {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Empty => "empty",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value and status of an atom at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub value: Value,
    pub status: Status,
}

/// Callback invoked with the new value and status
pub type Listener = Box<dyn Fn(&Value, Status) + Send + Sync>;

/// Progress of the atom's most recent load
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LoadState {
    Idle,
    Pending,
    Settled,
    Failed(StoreError),
}

// ============================================================================
// Writes
// ============================================================================

/// What the registry's writer task should commit
pub(crate) enum WriteKind {
    Put(Vec<(Atom, Value)>),
    Remove(Vec<Atom>),
}

impl WriteKind {
    /// Mark the local writes carried by this request as no longer in flight
    pub(crate) fn settle(&self) {
        match self {
            Self::Put(patch) => patch.iter().for_each(|(atom, _)| atom.finish_local_write()),
            Self::Remove(atoms) => atoms.iter().for_each(Atom::finish_local_write),
        }
    }
}

pub(crate) struct WriteOp {
    pub(crate) kind: WriteKind,
    pub(crate) reply: oneshot::Sender<Result<(), StoreError>>,
}

/// Queue a write behind all earlier writes of the same context
///
/// The returned future resolves once the backend committed (or rejected)
/// the write. Dropping it does not cancel the write.
pub(crate) fn submit(
    writes: &mpsc::UnboundedSender<WriteOp>,
    kind: WriteKind,
) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
    let (reply, rx) = oneshot::channel();
    let queued = match writes.send(WriteOp { kind, reply }) {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendError(op)) => {
            op.kind.settle();
            Err(StoreError::unavailable("registry writer stopped"))
        }
    };
    async move {
        queued?;
        rx.await
            .unwrap_or_else(|_| Err(StoreError::unavailable("write abandoned by registry")))
    }
}

// ============================================================================
// Atom
// ============================================================================

struct AtomState {
    value: Value,
    status: Status,
    /// `None` until the first lookup supplies one (atoms created by a write)
    default: Option<Value>,
    version: u64,
    /// Values of local writes not yet committed, oldest first (`None` = removal)
    in_flight: VecDeque<Option<Value>>,
    /// A remote change was applied after the latest local write
    overridden: bool,
}

struct ListenerSlot {
    active: ReentrantMutex<Cell<bool>>,
    callback: Listener,
}

impl ListenerSlot {
    fn invoke(&self, notification: &Notification, delivered: &AtomicU64) {
        let active = self.active.lock();
        // Checked under the slot lock: a newer snapshot already reached this
        // listener (or is being delivered) when `delivered` moved past ours.
        if active.get() && delivered.load(Ordering::SeqCst) <= notification.seq {
            (self.callback)(&notification.snapshot.value, notification.snapshot.status);
        }
    }
}

/// Snapshot to deliver, ordered by the atom version that produced it
pub(crate) struct Notification {
    snapshot: Snapshot,
    seq: u64,
}

struct AtomInner {
    key: Key,
    state: Mutex<AtomState>,
    listeners: Mutex<Vec<(u64, Arc<ListenerSlot>)>>,
    next_listener: AtomicU64,
    /// Highest version whose snapshot has started dispatching
    delivered: AtomicU64,
    load: watch::Sender<LoadState>,
    writes: mpsc::UnboundedSender<WriteOp>,
}

/// Reactive cell for one key
///
/// Cheap to clone; clones share the same cell.
#[derive(Clone)]
pub struct Atom {
    inner: Arc<AtomInner>,
}

impl Atom {
    pub(crate) fn new(
        key: Key,
        default: Option<Value>,
        writes: mpsc::UnboundedSender<WriteOp>,
    ) -> Self {
        let (load, _rx) = watch::channel(LoadState::Idle);
        Self {
            inner: Arc::new(AtomInner {
                key,
                state: Mutex::new(AtomState {
                    value: default.clone().unwrap_or(Value::Null),
                    status: Status::Uninitialized,
                    default,
                    version: 0,
                    in_flight: VecDeque::new(),
                    overridden: false,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                delivered: AtomicU64::new(0),
                load,
                writes,
            }),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Value the atom falls back to when the store has none
    ///
    /// `None` for an atom created by a write that no lookup has supplied a
    /// default for yet; such an atom falls back to `null`.
    #[must_use]
    pub fn default_value(&self) -> Option<Value> {
        self.inner.state.lock().default.clone()
    }

    #[must_use]
    pub fn value(&self) -> Value {
        self.inner.state.lock().value.clone()
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.state.lock().status
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        Snapshot {
            value: state.value.clone(),
            status: state.status,
        }
    }

    /// Decode the cached value
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailure` if the value does not match `T`.
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.value())?)
    }

    /// Whether both handles refer to the same cell
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Error of the most recent load, if it failed
    #[must_use]
    pub fn load_error(&self) -> Option<StoreError> {
        match &*self.inner.load.borrow() {
            LoadState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Wait until the pending load settles
    ///
    /// Returns immediately for an atom that was created by a write and
    /// never loaded.
    ///
    /// # Errors
    ///
    /// Returns the load error if the read failed. The atom stays in
    /// `loading` until it is reloaded or overwritten.
    pub async fn ready(&self) -> Result<Status, StoreError> {
        let mut rx = self.inner.load.subscribe();
        let state = rx
            .wait_for(|state| *state != LoadState::Pending)
            .await
            .map_err(|_| StoreError::unavailable("atom dropped while loading"))?
            .clone();
        match state {
            LoadState::Failed(err) => Err(err),
            _ => Ok(self.status()),
        }
    }

    /// Optimistically set the value, then commit it
    ///
    /// The cached value and status change (and listeners run) before this
    /// returns. The future reports the outcome of the commit; a failed
    /// commit does not roll the cached value back.
    pub fn set(&self, value: Value) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let notification = self.stage_local(Some(value.clone()));
        let pending = submit(&self.inner.writes, WriteKind::Put(vec![(self.clone(), value)]));
        // Queued before listeners run, so a write made by a listener commits after this one.
        self.notify(notification);
        pending
    }

    /// Encode and set a typed value
    pub fn set_as<T: Serialize>(
        &self,
        value: &T,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let pending = serde_json::to_value(value)
            .map_err(StoreError::from)
            .map(|value| self.set(value));
        async move { pending?.await }
    }

    /// Optimistically reset to the default, then delete the stored value
    pub fn remove(&self) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let notification = self.stage_local(None);
        let pending = submit(&self.inner.writes, WriteKind::Remove(vec![self.clone()]));
        self.notify(notification);
        pending
    }

    /// Register a listener
    ///
    /// The listener runs after every change of value or status until the
    /// returned subscription is released.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value, Status) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ListenerSlot {
            active: ReentrantMutex::new(Cell::new(true)),
            callback: Box::new(listener),
        });
        self.inner.listeners.lock().push((id, Arc::clone(&slot)));
        Subscription {
            atom: self.clone(),
            id,
            slot: Some(slot),
        }
    }

    // ------------------------------------------------------------------
    // Registry-facing transitions
    // ------------------------------------------------------------------

    pub(crate) fn writes(&self) -> &mpsc::UnboundedSender<WriteOp> {
        &self.inner.writes
    }

    /// Start a load; returns the version the read is issued against
    pub(crate) fn begin_load(&self) -> u64 {
        let version = {
            let mut state = self.inner.state.lock();
            if state.status == Status::Uninitialized {
                state.status = Status::Loading;
            }
            state.version
        };
        self.inner.load.send_replace(LoadState::Pending);
        version
    }

    /// Version the next read would be issued against, if no local write is in flight
    pub(crate) fn quiet_version(&self) -> Option<u64> {
        let state = self.inner.state.lock();
        state.in_flight.is_empty().then_some(state.version)
    }

    pub(crate) fn finish_load(&self, issued: u64, value: Value, found: bool) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.version == issued {
                let status = if found { Status::Loaded } else { Status::Empty };
                Self::replace(&mut state, value, status)
            } else {
                trace!(
                    "atom.load: '{}' discarding stale read (issued at v{issued}, now v{})",
                    self.inner.key,
                    state.version
                );
                None
            }
        };
        self.inner.load.send_replace(LoadState::Settled);
        if let Some(notification) = snapshot {
            debug!("atom.load: '{}' -> {}", self.inner.key, notification.snapshot.status);
            self.dispatch(&notification);
        }
    }

    pub(crate) fn fail_load(&self, issued: u64, err: StoreError) {
        let superseded = self.inner.state.lock().version != issued;
        if superseded {
            self.inner.load.send_replace(LoadState::Settled);
        } else {
            debug!("atom.load: '{}' failed: {err}", self.inner.key);
            self.inner.load.send_replace(LoadState::Failed(err));
        }
    }

    /// Apply a change observed on the backend's change stream
    pub(crate) fn apply_change(&self, event: &ChangeEvent) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            match event.origin {
                Origin::Local => {
                    let superseded = state
                        .in_flight
                        .back()
                        .is_some_and(|latest| *latest != event.value);
                    if superseded || !state.overridden {
                        trace!("atom.change: '{}' skipping own echo", self.inner.key);
                        return;
                    }
                }
                Origin::Remote => state.overridden = true,
            }
            let (value, status) = match &event.value {
                Some(value) => (value.clone(), Status::Loaded),
                None => (Self::fallback(&state), Status::Empty),
            };
            Self::replace(&mut state, value, status)
        };
        self.clear_failure();
        match snapshot {
            Some(notification) => self.dispatch(&notification),
            None => trace!("atom.change: '{}' unchanged, not dispatching", self.inner.key),
        }
    }

    pub(crate) fn finish_local_write(&self) {
        self.inner.state.lock().in_flight.pop_front();
    }

    /// Record a local write in the cache without notifying listeners
    ///
    /// The caller queues the write, then hands the result to [`Atom::notify`].
    pub(crate) fn stage_local(&self, value: Option<Value>) -> Option<Notification> {
        let notification = {
            let mut state = self.inner.state.lock();
            state.in_flight.push_back(value.clone());
            state.overridden = false;
            let (value, status) = match value {
                Some(value) => (value, Status::Loaded),
                None => (Self::fallback(&state), Status::Empty),
            };
            let notification = Self::replace(&mut state, value, status);
            // A write is newer than any read in flight, even if it did not change the value.
            if notification.is_none() {
                state.version += 1;
            }
            notification
        };
        self.clear_failure();
        notification
    }

    pub(crate) fn notify(&self, notification: Option<Notification>) {
        if let Some(notification) = notification {
            self.dispatch(&notification);
        }
    }

    /// Supply the default of an atom that was created by a write
    ///
    /// The first default wins. An atom that is `empty` shows it at once.
    pub(crate) fn adopt_default(&self, default: Value) {
        let notification = {
            let mut state = self.inner.state.lock();
            if state.default.is_some() {
                return;
            }
            state.default = Some(default.clone());
            if state.status == Status::Empty {
                Self::replace(&mut state, default, Status::Empty)
            } else {
                None
            }
        };
        self.notify(notification);
    }

    /// A write or change supersedes a failed load
    fn clear_failure(&self) {
        self.inner.load.send_if_modified(|state| {
            let failed = matches!(state, LoadState::Failed(_));
            if failed {
                *state = LoadState::Settled;
            }
            failed
        });
    }

    fn fallback(state: &AtomState) -> Value {
        state.default.clone().unwrap_or(Value::Null)
    }

    /// Store a new value and status; returns what to dispatch if anything changed
    fn replace(state: &mut AtomState, value: Value, status: Status) -> Option<Notification> {
        if state.value == value && state.status == status {
            return None;
        }
        state.value = value;
        state.status = status;
        state.version += 1;
        Some(Notification {
            snapshot: Snapshot {
                value: state.value.clone(),
                status,
            },
            seq: state.version,
        })
    }

    fn dispatch(&self, notification: &Notification) {
        let delivered = &self.inner.delivered;
        if delivered.fetch_max(notification.seq, Ordering::SeqCst) > notification.seq {
            trace!(
                "atom.dispatch: '{}' v{} superseded before delivery",
                self.inner.key,
                notification.seq
            );
            return;
        }
        let slots: Vec<Arc<ListenerSlot>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in slots {
            slot.invoke(notification, delivered);
        }
    }

    fn remove_listener(&self, id: u64) {
        self.inner.listeners.lock().retain(|(slot_id, _)| *slot_id != id);
    }
}

impl std::fmt::Debug for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Atom")
            .field("key", &self.inner.key)
            .field("status", &state.status)
            .field("version", &state.version)
            .field("in_flight", &state.in_flight.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Registered listener of an atom
///
/// Released exactly once: by [`Subscription::unsubscribe`] or on drop.
/// No callback runs after the release returns.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    atom: Atom,
    id: u64,
    slot: Option<Arc<ListenerSlot>>,
}

impl Subscription {
    /// The atom this subscription listens to
    #[must_use]
    pub fn atom(&self) -> &Atom {
        &self.atom
    }

    /// Release the listener now
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        self.atom.remove_listener(self.id);
        // Waits for a callback running on another thread to finish.
        let active = slot.active.lock();
        active.set(false);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.atom.key())
            .field("id", &self.id)
            .field("active", &self.slot.is_some())
            .finish()
    }
}
