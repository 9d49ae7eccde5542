// Durable token storage
// Key-value store for session credentials, backed by SQLite

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Key holding the current bearer credential
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Key holding the current refresh credential
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Key holding the user profile returned at login
pub const USER_PROFILE_KEY: &str = "user";

/// Cached profile fields, cleared together with the tokens on sign-out
pub const PROFILE_KEYS: &[&str] = &[USER_PROFILE_KEY];

/// Durable string key-value store.
///
/// Only the session manager writes the token keys. A batch is applied
/// atomically: `Some(value)` sets a key, `None` removes it.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn write_batch(&self, entries: &[(&str, Option<&str>)]) -> Result<()>;

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write_batch(&[(key, Some(value))])
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write_batch(&[(key, None)])
    }
}

/// SQLite-backed store using a single `auth_kv` table
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

impl SqliteTokenStore {
    /// Open (or create) the store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        tracing::debug!("Opening session store: {}", path.display());
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Store that lives only as long as the process
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("Failed to read '{}' from session store", key))
    }

    fn write_batch(&self, entries: &[(&str, Option<&str>)]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("Failed to begin session store transaction")?;

        for (key, value) in entries {
            let written = match value {
                Some(value) => tx.execute(
                    "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                ),
                None => tx.execute("DELETE FROM auth_kv WHERE key = ?", [key]),
            };
            written.with_context(|| format!("Failed to write '{}' to session store", key))?;
        }

        tx.commit()
            .context("Failed to commit session store transaction")
    }
}

/// Process-local store, used by tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with the given entries
    pub fn with_entries(entries: &[(&str, &str)]) -> Self {
        let map = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            entries: Mutex::new(map),
        }
    }

    /// Copy of every stored entry
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write_batch(&self, batch: &[(&str, Option<&str>)]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in batch {
            match value {
                Some(value) => {
                    entries.insert(key.to_string(), value.to_string());
                }
                None => {
                    entries.remove(*key);
                }
            }
        }
        Ok(())
    }
}
