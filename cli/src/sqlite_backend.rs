//! SQLite-backed store
//!
//! Documents are kept as JSON text in a single table:
//!
//! ```text
//! documents(key TEXT PRIMARY KEY, value TEXT NOT NULL)
//! ```
//!
//! A [`SqliteStore`] owns one connection and one change feed. Contexts
//! connected to the same store see each other's commits; processes opening
//! the same file share the data but not the notifications.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use atomkv::{
    Backend, ChangeFeed, ChangeStream, ContextId, FeedConfig, IdGen, Key, ReadOutcome, StoreError,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

fn unavailable(operation: &str, err: &rusqlite::Error) -> StoreError {
    StoreError::unavailable(format!("sqlite {operation}: {err}"))
}

struct Shared {
    connection: Mutex<Connection>,
    feed: ChangeFeed,
    ids: IdGen,
}

/// Key/value service persisted in a SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    shared: Arc<Shared>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or the table cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let connection =
            Connection::open(path).map_err(|err| unavailable("open", &err))?;
        debug!("sqlite.open: {}", path.display());
        Self::with_connection(connection, FeedConfig::default())
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    ///
    /// Returns error if the table cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory().map_err(|err| unavailable("open", &err))?;
        Self::with_connection(connection, FeedConfig::default())
    }

    /// Wrap an open connection
    ///
    /// # Errors
    ///
    /// Returns error if the table cannot be created.
    pub fn with_connection(connection: Connection, config: FeedConfig) -> Result<Self, StoreError> {
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS documents (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                [],
            )
            .map_err(|err| unavailable("create table", &err))?;

        Ok(Self {
            shared: Arc::new(Shared {
                connection: Mutex::new(connection),
                feed: ChangeFeed::new(config, "sqlite"),
                ids: IdGen::new(),
            }),
        })
    }

    /// Connect a new context to the store
    #[must_use]
    pub fn connect(&self) -> SqliteBackend {
        let context = self.shared.ids.next_context();
        debug!("sqlite.connect: {context}");
        SqliteBackend {
            store: self.clone(),
            context,
        }
    }

    /// Stored value of a key, bypassing any context
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored text is not JSON.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let connection = self.shared.connection.lock();
        Self::load(&connection, key)
    }

    /// Stored keys starting with `prefix`, sorted
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<Key>, StoreError> {
        let connection = self.shared.connection.lock();
        let mut stmt = connection
            .prepare("SELECT key FROM documents WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .map_err(|err| unavailable("list", &err))?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(|err| unavailable("list", &err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| unavailable("list", &err))?;
        Ok(keys)
    }

    fn load(connection: &Connection, key: &str) -> Result<Option<Value>, StoreError> {
        let text = connection
            .query_row(
                "SELECT value FROM documents WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| unavailable("read", &err))?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

/// One context's adapter to a [`SqliteStore`]
pub struct SqliteBackend {
    store: SqliteStore,
    context: ContextId,
}

impl SqliteBackend {
    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }
}

impl Backend for SqliteBackend {
    fn context(&self) -> ContextId {
        self.context
    }

    async fn read_many(&self, requests: HashMap<Key, Value>) -> Result<ReadOutcome, StoreError> {
        let connection = self.store.shared.connection.lock();
        ReadOutcome::try_merge_with_defaults(requests, |key| SqliteStore::load(&connection, key))
    }

    async fn write_many(&self, patch: HashMap<Key, Value>) -> Result<(), StoreError> {
        let encoded = patch
            .iter()
            .map(|(key, value)| Ok((key.as_str(), serde_json::to_string(value)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        let shared = &self.store.shared;
        let mut connection = shared.connection.lock();
        let tx = connection
            .transaction()
            .map_err(|err| unavailable("begin", &err))?;
        for (key, text) in &encoded {
            tx.execute(
                "INSERT OR REPLACE INTO documents (key, value) VALUES (?1, ?2)",
                params![key, text],
            )
            .map_err(|err| unavailable("write", &err))?;
        }
        tx.commit().map_err(|err| unavailable("commit", &err))?;

        // Still under the connection lock, so feeds see commit order.
        for (key, value) in patch {
            shared.feed.publish(self.context, &key, Some(value));
        }
        Ok(())
    }

    async fn remove(&self, keys: HashSet<Key>) -> Result<(), StoreError> {
        let shared = &self.store.shared;
        let mut connection = shared.connection.lock();
        let tx = connection
            .transaction()
            .map_err(|err| unavailable("begin", &err))?;
        let mut removed = Vec::new();
        for key in keys {
            let rows = tx
                .execute("DELETE FROM documents WHERE key = ?1", params![key])
                .map_err(|err| unavailable("remove", &err))?;
            if rows > 0 {
                removed.push(key);
            }
        }
        tx.commit().map_err(|err| unavailable("commit", &err))?;

        for key in removed {
            shared.feed.publish(self.context, &key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> ChangeStream {
        self.store.shared.feed.subscribe(self.context)
    }
}
