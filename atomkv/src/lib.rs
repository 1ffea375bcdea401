//! Reactive per-key cells over a shared asynchronous key/value store
//!
//! Several independently running contexts share one key/value store. Each
//! context builds an [`AtomRegistry`] over its own [`Backend`] adapter and
//! gets a live, cached view of the keys it uses:
//!
//! - [`Atom`]: one reactive cell per key with value, [`Status`] and listeners
//! - [`AtomRegistry`]: one atom and one change subscription per key per context
//! - [`NamespacedStore`]: per-instance fields under `<prefix>.<id>.<field>`
//! - [`Binding`]: listener tied to a consumer's lifetime
//!
//! Consistency across contexts is last-write-wins in backend commit order.
//! There is no versioning or compare-and-swap; callers needing stronger
//! guarantees must build them on top.

pub mod atom;
pub mod backend;
pub mod binding;
pub mod config;
pub mod error;
pub mod idgen;
pub mod keys;
pub mod namespace;
pub mod registry;

// Re-export core types for convenience
pub use atom::{Atom, Listener, Snapshot, Status, Subscription};
pub use binding::{scoped, Binding, Setter};
pub use config::{FeedConfig, RegistryConfig};
pub use error::StoreError;
pub use idgen::{ContextId, IdGen};
pub use namespace::{BoundNamespace, Namespace, NamespacedStore, DELIMITER};
pub use registry::AtomRegistry;

// Re-export backend types for convenience
pub use backend::{
    Backend, ChangeEvent, ChangeFeed, ChangeStream, Key, MemBackend, MemStore, Notice, Origin,
    ReadOutcome, StoreStats,
};
