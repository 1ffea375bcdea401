//! Backend adapter layer
//!
//! Wraps the shared asynchronous key/value service that every context
//! talks to.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  AtomRegistry (one per context)     │
//! │  - one atom per key                 │
//! │  - ordered writer task              │
//! │  - change pump (one subscription)   │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ read_many / write_many / remove / subscribe
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  Backend (per-context adapter)      │
//! │  - merge-with-defaults reads        │
//! │  - tags commits with its ContextId  │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ shares documents + ChangeFeed
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  Store (the durable service)        │
//! │  - last-write-wins by commit order  │
//! │  - broadcasts every commit          │
//! └─────────────────────────────────────┘
//!      ▲                 ▲
//!      │                 │
//!   MemStore         SqliteStore (cli crate)
//! ```

pub mod feed;
pub mod memory;
pub mod types;

pub use feed::{ChangeFeed, ChangeStream, Notice};
pub use memory::{MemBackend, MemStore, StoreStats};
pub use types::{Backend, ChangeEvent, Key, Origin, ReadOutcome};
