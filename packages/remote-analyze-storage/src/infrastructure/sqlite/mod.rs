//! SQLite adapters
//!
//! One database file can hold both the key/value table and the work queue.
//! Every adapter owns its own connection; WAL mode plus a busy timeout lets
//! several server processes on one host share the file.

mod kv_store;
mod work_queue;

pub use kv_store::SqliteKvStore;
pub use work_queue::SqliteWorkQueue;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS work_queue (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id       TEXT    NOT NULL,
    part         INTEGER NOT NULL,
    attempt      INTEGER NOT NULL DEFAULT 0,
    leased_until INTEGER,
    available_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_work_queue_lease ON work_queue (leased_until, id);
"#;

/// Open (or create) a database file and make sure the schema exists
pub(crate) fn open_file(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!("Opened SQLite store {} (journal_mode={})", path.display(), mode);

    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Private in-memory database (tests)
pub(crate) fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}
