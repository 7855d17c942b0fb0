//! In-memory adapters
//!
//! Same contracts as the SQLite adapters, minus durability. Used by tests and
//! by single-process deployments that accept losing state on restart.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::domain::{Delivery, KeyValueStore, QueueEntry, WorkQueue};
use crate::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// MemoryKvStore
// ═══════════════════════════════════════════════════════════════════════════

/// Lock-free key/value store on top of `DashMap`
///
/// Per-key atomicity comes from the shard lock held by the entry API.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, String>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|value| value.value().clone()))
    }

    async fn compare_and_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match expected {
                Some(expected) if occupied.get() == expected => {
                    occupied.insert(new.to_string());
                    true
                }
                _ => false,
            },
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(new.to_string());
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| "0".to_string());

        let current = match slot.value().parse::<i64>() {
            Ok(current) => current,
            Err(_) => return Err(StorageError::corrupted(key, slot.value().clone())),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StorageError::corrupted(key, "counter overflow"))?;

        *slot.value_mut() = next.to_string();
        Ok(next)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MemoryWorkQueue
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct Ready {
    entry: QueueEntry,
    attempt: u32,
    /// Hidden from `dequeue` until this instant
    not_before: Option<Instant>,
}

#[derive(Debug)]
struct Lease {
    entry: QueueEntry,
    attempt: u32,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    // Keyed by queue id, so iteration order is arrival order.
    ready: BTreeMap<u64, Ready>,
    leased: HashMap<u64, Lease>,
}

impl QueueState {
    /// Move every lease past its deadline back to the ready set
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                tracing::debug!(
                    "Lease expired for queue entry {} ({}#{}), redelivering",
                    id,
                    lease.entry.job_id,
                    lease.entry.part
                );
                self.ready.insert(
                    id,
                    Ready {
                        entry: lease.entry,
                        attempt: lease.attempt,
                        not_before: None,
                    },
                );
            }
        }
    }

    /// Oldest ready entry whose delay has passed
    fn next_deliverable(&self, now: Instant) -> Option<u64> {
        self.ready
            .iter()
            .find(|(_, ready)| ready.not_before.map_or(true, |at| at <= now))
            .map(|(id, _)| *id)
    }
}

/// Process-local FIFO queue with lease/ack semantics
#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    state: Mutex<QueueState>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn push(&self, entry: QueueEntry) -> Result<u64> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.ready.insert(
            id,
            Ready {
                entry,
                attempt: 0,
                not_before: None,
            },
        );
        Ok(id)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.reclaim_expired(now);

        let Some(id) = state.next_deliverable(now) else {
            return Ok(None);
        };
        let Some(ready) = state.ready.remove(&id) else {
            return Ok(None);
        };

        let attempt = ready.attempt + 1;
        state.leased.insert(
            id,
            Lease {
                entry: ready.entry.clone(),
                attempt,
                deadline: now + lease,
            },
        );

        Ok(Some(Delivery {
            id,
            attempt,
            entry: ready.entry,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let mut state = self.state.lock();
        match state.leased.get(&delivery.id) {
            Some(lease) if lease.attempt == delivery.attempt => {
                state.leased.remove(&delivery.id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool> {
        let not_before = (!delay.is_zero()).then(|| Instant::now() + delay);
        let mut state = self.state.lock();
        match state.leased.get(&delivery.id) {
            Some(lease) if lease.attempt == delivery.attempt => {
                if let Some(lease) = state.leased.remove(&delivery.id) {
                    state.ready.insert(
                        delivery.id,
                        Ready {
                            entry: lease.entry,
                            attempt: lease.attempt,
                            not_before,
                        },
                    );
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending(&self) -> Result<usize> {
        let state = self.state.lock();
        Ok(state.ready.len() + state.leased.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compare_and_set_absent_then_present() {
        let store = MemoryKvStore::new();

        assert!(store.compare_and_set("k", None, "a").await.unwrap());
        assert!(!store.compare_and_set("k", None, "b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        assert!(!store.compare_and_set("k", Some("x"), "b").await.unwrap());
        assert!(store.compare_and_set("k", Some("a"), "b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_compare_and_set_expected_on_missing_key() {
        let store = MemoryKvStore::new();
        assert!(!store.compare_and_set("k", Some("a"), "b").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_from_missing_key() {
        let store = MemoryKvStore::new();
        assert_eq!(store.increment("n", 1).await.unwrap(), 1);
        assert_eq!(store.increment("n", 2).await.unwrap(), 3);
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_increment_corrupted_value() {
        let store = MemoryKvStore::new();
        store.compare_and_set("n", None, "abc").await.unwrap();

        let err = store.increment("n", 1).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Corrupted);
        // Value untouched
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_queue_fifo_and_ack() {
        let queue = MemoryWorkQueue::new();
        queue.push(QueueEntry::new("a", 1)).await.unwrap();
        queue.push(QueueEntry::new("b", 1)).await.unwrap();

        let first = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.entry, QueueEntry::new("a", 1));
        assert_eq!(first.attempt, 1);

        assert!(queue.ack(&first).await.unwrap());
        assert!(!queue.ack(&first).await.unwrap());
        assert_eq!(queue.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_nack_keeps_position() {
        let queue = MemoryWorkQueue::new();
        queue.push(QueueEntry::new("a", 1)).await.unwrap();
        queue.push(QueueEntry::new("a", 2)).await.unwrap();

        let first = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert!(queue.nack(&first, Duration::ZERO).await.unwrap());

        let again = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_queue_delayed_nack_lets_later_entries_through() {
        let queue = MemoryWorkQueue::new();
        queue.push(QueueEntry::new("a", 1)).await.unwrap();
        queue.push(QueueEntry::new("b", 1)).await.unwrap();

        let lease = Duration::from_secs(60);
        let first = queue.dequeue(lease).await.unwrap().unwrap();
        assert!(queue.nack(&first, Duration::from_millis(50)).await.unwrap());
        // A nacked delivery is no longer leased
        assert!(!queue.ack(&first).await.unwrap());

        let next = queue.dequeue(lease).await.unwrap().unwrap();
        assert_eq!(next.entry, QueueEntry::new("b", 1));
        assert!(queue.dequeue(lease).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let again = queue.dequeue(lease).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempt, 2);
        assert_eq!(queue.pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_queue_expired_lease_is_redelivered_and_stale_ack_rejected() {
        let queue = MemoryWorkQueue::new();
        queue.push(QueueEntry::new("a", 1)).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        assert!(!queue.ack(&first).await.unwrap());
        assert!(queue.ack(&second).await.unwrap());
        assert_eq!(queue.pending().await.unwrap(), 0);
    }
}
