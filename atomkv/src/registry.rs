//! Atom registry - one atom per key per context
//!
//! A context constructs one `AtomRegistry` over its backend adapter and
//! keeps it for its whole lifetime. The registry:
//!
//! - memoizes atoms by key, so every lookup of a key returns the same cell
//!   and only the first lookup issues a read;
//! - owns the context's single change subscription and routes each change
//!   to the atom of the same key (exact key match);
//! - owns the writer task, which commits the context's writes one at a time
//!   in the order they were issued.
//!
//! Dropping the last handle stops the change pump. Writes already queued
//! are still committed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::atom::{submit, Atom, WriteKind, WriteOp};
use crate::backend::{Backend, ChangeEvent, ChangeStream, Key, Notice};
use crate::config::RegistryConfig;
use crate::error::StoreError;
use crate::idgen::ContextId;

/// Why a batch of atoms is being read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadKind {
    /// First read (or explicit reload); failures are reported on the atoms
    Initial,
    /// Catch-up read after the change stream lagged; failures are only logged
    Resync,
}

struct RegistryInner<B: Backend> {
    backend: Arc<B>,
    atoms: Mutex<HashMap<Key, Atom>>,
    writes: mpsc::UnboundedSender<WriteOp>,
    config: RegistryConfig,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> RegistryInner<B> {
    fn route(&self, event: &ChangeEvent) {
        let atom = self.atoms.lock().get(&event.key).cloned();
        match atom {
            Some(atom) => atom.apply_change(event),
            None => trace!("registry.route: no atom for '{}'", event.key),
        }
    }

    fn resync(&self) {
        let batch: Vec<(Atom, u64)> = self
            .atoms
            .lock()
            .values()
            .filter_map(|atom| atom.quiet_version().map(|version| (atom.clone(), version)))
            .collect();
        if batch.is_empty() {
            return;
        }
        debug!(
            "registry.resync: {} re-reading {} keys",
            self.backend.context(),
            batch.len()
        );
        tokio::spawn(load_atoms(Arc::clone(&self.backend), batch, LoadKind::Resync));
    }
}

impl<B: Backend> Drop for RegistryInner<B> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Per-context cache of atoms over one backend adapter
///
/// Cheap to clone; clones share the same atoms.
pub struct AtomRegistry<B: Backend> {
    inner: Arc<RegistryInner<B>>,
}

impl<B: Backend> Clone for AtomRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> AtomRegistry<B> {
    /// Create a registry with default configuration
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, RegistryConfig::default())
    }

    /// Create a registry
    ///
    /// Subscribes to the backend's changes before any atom is read, so no
    /// commit can fall between an atom's read and its subscription.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn with_config(backend: B, config: RegistryConfig) -> Self {
        let backend = Arc::new(backend);
        let stream = backend.subscribe();
        let (writes, write_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&backend), write_rx));

        let inner = Arc::new(RegistryInner {
            backend,
            atoms: Mutex::new(HashMap::new()),
            writes,
            config,
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(run_pump(Arc::downgrade(&inner), stream));
        *inner.pump.lock() = Some(pump);

        debug!("registry.new: {}", inner.backend.context());
        Self { inner }
    }

    /// Context this registry belongs to
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.inner.backend.context()
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Atom for `key`, created and loaded on first lookup
    ///
    /// `default` is used only when this call creates the atom, or when the
    /// atom was created by a write and has no default yet; other lookups
    /// return the existing atom unchanged.
    pub fn get_or_create(&self, key: impl Into<Key>, default: Value) -> Atom {
        let key = key.into();
        let (atom, issued) = {
            let mut atoms = self.inner.atoms.lock();
            match atoms.get(&key) {
                Some(atom) => (atom.clone(), None),
                None => {
                    let atom = Atom::new(key.clone(), Some(default.clone()), self.inner.writes.clone());
                    let issued = atom.begin_load();
                    atoms.insert(key, atom.clone());
                    (atom, Some(issued))
                }
            }
        };
        let Some(issued) = issued else {
            atom.adopt_default(default);
            return atom;
        };
        trace!("registry.get_or_create: loading '{}'", atom.key());
        self.spawn_load(vec![(atom.clone(), issued)]);
        atom
    }

    /// Atoms for several keys; all missing ones are loaded with a single read
    pub fn get_many<K, I>(&self, requests: I) -> Vec<Atom>
    where
        K: Into<Key>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut created = Vec::new();
        let mut existing = Vec::new();
        let atoms: Vec<Atom> = {
            let mut atoms = self.inner.atoms.lock();
            requests
                .into_iter()
                .map(|(key, default)| {
                    let key = key.into();
                    if let Some(atom) = atoms.get(&key) {
                        existing.push((atom.clone(), default));
                        return atom.clone();
                    }
                    let atom = Atom::new(key.clone(), Some(default), self.inner.writes.clone());
                    created.push((atom.clone(), atom.begin_load()));
                    atoms.insert(key, atom.clone());
                    atom
                })
                .collect()
        };
        // Listeners may run here, so the atom map is no longer locked.
        for (atom, default) in existing {
            atom.adopt_default(default);
        }
        if !created.is_empty() {
            self.spawn_load(created);
        }
        atoms
    }

    /// Existing atom for `key`, without creating one
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Atom> {
        self.inner.atoms.lock().get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.atoms.lock().contains_key(key)
    }

    /// Number of atoms in this context
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.atoms.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.atoms.lock().is_empty()
    }

    /// Keys of all atoms, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.inner.atoms.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Set a key, creating its atom if needed (see [`Atom::set`])
    pub fn set(
        &self,
        key: impl Into<Key>,
        value: Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        self.atom_for_write(key.into()).set(value)
    }

    /// Optimistically set several keys and commit them with one batched write
    ///
    /// The backend does not guarantee atomicity across the keys.
    pub fn set_many<K, I>(&self, patch: I) -> impl Future<Output = Result<(), StoreError>> + Send + 'static
    where
        K: Into<Key>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut staged = Vec::new();
        let entries: Vec<(Atom, Value)> = patch
            .into_iter()
            .map(|(key, value)| {
                let atom = self.atom_for_write(key.into());
                staged.push((atom.clone(), atom.stage_local(Some(value.clone()))));
                (atom, value)
            })
            .collect();
        let pending = submit(&self.inner.writes, WriteKind::Put(entries));
        for (atom, notification) in staged {
            atom.notify(notification);
        }
        pending
    }

    /// Remove a key (see [`Atom::remove`])
    pub fn remove(&self, key: impl Into<Key>) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        self.atom_for_write(key.into()).remove()
    }

    /// Re-issue the read of an atom, typically after a failed load
    pub fn reload(&self, atom: &Atom) {
        let issued = atom.begin_load();
        self.spawn_load(vec![(atom.clone(), issued)]);
    }

    /// Existing atom, or a new one that is never read because a write is about to define it
    ///
    /// A new atom has no default until a lookup supplies one.
    fn atom_for_write(&self, key: Key) -> Atom {
        let mut atoms = self.inner.atoms.lock();
        atoms
            .entry(key)
            .or_insert_with_key(|key| Atom::new(key.clone(), None, self.inner.writes.clone()))
            .clone()
    }

    fn spawn_load(&self, batch: Vec<(Atom, u64)>) {
        tokio::spawn(load_atoms(
            Arc::clone(&self.inner.backend),
            batch,
            LoadKind::Initial,
        ));
    }
}

impl<B: Backend> std::fmt::Debug for AtomRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomRegistry")
            .field("context", &self.context())
            .field("atoms", &self.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Read a batch of atoms and apply the results
async fn load_atoms<B: Backend>(backend: Arc<B>, batch: Vec<(Atom, u64)>, kind: LoadKind) {
    let requests: HashMap<Key, Value> = batch
        .iter()
        .map(|(atom, _)| (atom.key().to_string(), atom.default_value().unwrap_or(Value::Null)))
        .collect();

    match backend.read_many(requests).await {
        Ok(mut outcome) => {
            for (atom, issued) in batch {
                match outcome.take(atom.key()) {
                    Some((value, found)) => atom.finish_load(issued, value, found),
                    None if kind == LoadKind::Initial => atom.fail_load(
                        issued,
                        StoreError::unavailable(format!("backend omitted '{}'", atom.key())),
                    ),
                    None => warn!("registry.load: backend omitted '{}'", atom.key()),
                }
            }
        }
        Err(err) => {
            warn!("registry.load: {kind:?} read of {} keys failed: {err}", batch.len());
            if kind == LoadKind::Initial {
                for (atom, issued) in batch {
                    atom.fail_load(issued, err.clone());
                }
            }
        }
    }
}

/// Commit writes one at a time, in the order they were submitted
async fn run_writer<B: Backend>(backend: Arc<B>, mut requests: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = requests.recv().await {
        let result = match &op.kind {
            WriteKind::Put(patch) => {
                let patch: HashMap<Key, Value> = patch
                    .iter()
                    .map(|(atom, value)| (atom.key().to_string(), value.clone()))
                    .collect();
                backend.write_many(patch).await
            }
            WriteKind::Remove(atoms) => {
                let keys = atoms.iter().map(|atom| atom.key().to_string()).collect();
                backend.remove(keys).await
            }
        };
        op.kind.settle();
        if let Err(err) = &result {
            warn!("registry.write: {} commit failed: {err}", backend.context());
        }
        if op.reply.send(result).is_err() {
            trace!("registry.write: caller no longer waiting");
        }
    }
    trace!("registry.write: {} writer stopped", backend.context());
}

/// Route every notice of the context's change stream
async fn run_pump<B: Backend>(registry: Weak<RegistryInner<B>>, mut stream: ChangeStream) {
    while let Some(notice) = stream.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        match notice {
            Notice::Change(event) => inner.route(&event),
            Notice::Lagged(_) if inner.config.resync_on_lag => inner.resync(),
            Notice::Lagged(skipped) => {
                warn!("registry.pump: {skipped} changes lost, resync disabled");
            }
        }
    }
    trace!("registry.pump: {} stopped", stream.context());
}
