//! Keyed coordinator state store.
//!
//! Each coordinator persists its owned state as a single JSON document under
//! its deterministic key (`tenant_id`, `tenant_id|room_id`,
//! `tenant_id|ledger|0`, ...). A save replaces the whole document in one
//! transaction, which is the atomicity coordinators rely on: either the new
//! `seq`/`head`/windows are all visible or none are.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

/// Errors from the keyed state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored document is not valid JSON.
    #[error("corrupt state document for key '{key}': {message}")]
    Corrupt {
        /// The key whose document failed to parse.
        key: String,
        /// Parser diagnostic.
        message: String,
    },
}

/// A keyed single-writer JSON document store.
///
/// Implementations must make each `save` atomic per key. Callers are the
/// coordinators themselves; the runtime serializes access per key.
pub trait StateStore: Send + Sync {
    /// Loads the document stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt document.
    fn load(&self, key: &str) -> Result<Option<Value>, StateStoreError>;

    /// Atomically replaces the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn save(&self, key: &str, state: &Value) -> Result<(), StateStoreError>;
}

/// In-memory state store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    docs: Mutex<HashMap<String, Value>>,
}

impl MemoryStateStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StateStoreError> {
        Ok(self.docs.lock().unwrap().get(key).cloned())
    }

    fn save(&self, key: &str, state: &Value) -> Result<(), StateStoreError> {
        self.docs
            .lock()
            .unwrap()
            .insert(key.to_string(), state.clone());
        Ok(())
    }
}

/// SQLite-backed state store sharing the index store's database file.
///
/// The `coordinator_state` table is created by the index store schema; this
/// store only reads and writes it.
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Opens the store on an existing database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS coordinator_state (
                key        TEXT PRIMARY KEY,
                state      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Wraps an already-open connection (shared with the index store).
    #[must_use]
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StateStoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM coordinator_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StateStoreError::Corrupt {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    fn save(&self, key: &str, state: &Value) -> Result<(), StateStoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO coordinator_state (key, state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET state = ?2, updated_at = ?3",
            params![key, state.to_string(), crate::atom::now_iso()],
        )?;
        Ok(())
    }
}
