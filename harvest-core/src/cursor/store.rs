use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::sqlite::configure_connection;

use super::error::{StateError, StateResult};
use super::pagination::Cursor;

const STATE_SCHEMA: &str = include_str!("../../../sql/state.sql");

/// Durable key-value storage. Only the cursor lives here.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StateResult<Option<Value>>;
    fn put(&self, key: &str, value: &Value) -> StateResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteStateStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteStateStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteStateStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StateResult<SqliteStateStore> {
        let path = self.path.ok_or(StateError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteStateStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteStateStore {
    pub fn builder() -> SqliteStateStoreBuilder {
        SqliteStateStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StateResult<Self> {
        SqliteStateStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StateResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StateError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StateError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StateResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(STATE_SCHEMA)?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStateStore {
    fn get(&self, key: &str) -> StateResult<Option<Value>> {
        let conn = self.open()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(StateError::from)
    }

    fn put(&self, key: &str, value: &Value) -> StateResult<()> {
        let conn = self.open()?;
        let text = serde_json::to_string(value)?;
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Typed view of the cursor entry in a [`KeyValueStore`].
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl CursorStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Missing entries read as a fresh cursor at page 1.
    pub fn load(&self) -> StateResult<Cursor> {
        match self.store.get(&self.key)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => {
                debug!(key = %self.key, "no stored cursor, starting at page 1");
                Ok(Cursor::initial())
            }
        }
    }

    pub fn save(&self, cursor: &Cursor) -> StateResult<()> {
        let value = serde_json::to_value(cursor)?;
        self.store.put(&self.key, &value)
    }
}
