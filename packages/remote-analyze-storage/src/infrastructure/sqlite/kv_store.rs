use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

use crate::domain::KeyValueStore;
use crate::{Result, StorageError};

/// Crash-durable key/value store on a single SQLite table
///
/// Statements are short and run while holding the connection mutex; counters
/// use `BEGIN IMMEDIATE` so concurrent processes serialize on the write lock.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(super::open_file(path.as_ref())?),
        })
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(super::open_memory()?),
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    async fn compare_and_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = match expected {
            None => conn.execute(
                "INSERT OR IGNORE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, new],
            )?,
            Some(expected) => conn.execute(
                "UPDATE kv SET value = ?2 WHERE key = ?1 AND value = ?3",
                params![key, new, expected],
            )?,
        };
        Ok(changed == 1)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;

        let current = match current {
            None => 0,
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| StorageError::corrupted(key, raw.clone()))?,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StorageError::corrupted(key, "counter overflow"))?;

        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, next.to_string()],
        )?;
        tx.commit()?;

        Ok(next)
    }
}
