use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use crate::domain::{Delivery, QueueEntry, WorkQueue};
use crate::Result;

/// Crash-durable FIFO queue
///
/// A row stays in the table until it is acknowledged. `leased_until` holds the
/// lease deadline in epoch milliseconds; a row with a past deadline is
/// deliverable again, so a worker that dies mid-part causes redelivery.
/// `available_at` holds back a nacked row until its retry delay has passed.
pub struct SqliteWorkQueue {
    conn: Mutex<Connection>,
}

impl SqliteWorkQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(super::open_file(path.as_ref())?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(super::open_memory()?),
        })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn push(&self, entry: QueueEntry) -> Result<u64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO work_queue (job_id, part) VALUES (?1, ?2)",
            params![entry.job_id, entry.part as i64],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>> {
        let now = now_millis();
        let deadline = now.saturating_add(duration_millis(lease));

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(i64, String, i64, i64)> = tx
            .query_row(
                "SELECT id, job_id, part, attempt FROM work_queue \
                 WHERE (leased_until IS NULL AND available_at <= ?1) \
                    OR leased_until <= ?1 \
                 ORDER BY id LIMIT 1",
                params![now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((id, job_id, part, attempt)) = row else {
            return Ok(None);
        };

        let attempt = attempt + 1;
        tx.execute(
            "UPDATE work_queue SET attempt = ?2, leased_until = ?3 WHERE id = ?1",
            params![id, attempt, deadline],
        )?;
        tx.commit()?;

        Ok(Some(Delivery {
            id: id as u64,
            attempt: attempt as u32,
            entry: QueueEntry::new(job_id, part as u64),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM work_queue \
             WHERE id = ?1 AND attempt = ?2 AND leased_until IS NOT NULL",
            params![delivery.id as i64, delivery.attempt as i64],
        )?;
        Ok(removed == 1)
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool> {
        let available_at = now_millis().saturating_add(duration_millis(delay));
        let conn = self.conn.lock();
        let released = conn.execute(
            "UPDATE work_queue SET leased_until = NULL, available_at = ?3 \
             WHERE id = ?1 AND attempt = ?2 AND leased_until IS NOT NULL",
            params![delivery.id as i64, delivery.attempt as i64, available_at],
        )?;
        Ok(released == 1)
    }

    async fn pending(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM work_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
