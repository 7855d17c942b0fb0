use async_trait::async_trait;
use std::time::Duration;

use super::models::{Delivery, QueueEntry};
use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: KeyValueStore
// ═══════════════════════════════════════════════════════════════════════════

/// Durable key/value store shared by every server instance
///
/// The interface is deliberately narrow. Every higher level guarantee (atomic
/// part allocation, monotonic job state, never-forget blob index) is built from
/// these three primitives, each of which must be serializable per key.
///
/// # Implementations
///
/// - `MemoryKvStore`: process-local, for tests and single-node setups
/// - `SqliteKvStore`: crash-durable, can be shared by processes on one host
///
/// # Examples
///
/// ```rust,ignore
/// use remote_analyze_storage::domain::KeyValueStore;
///
/// async fn example(store: impl KeyValueStore) -> Result<()> {
///     // Create only if absent
///     assert!(store.compare_and_set("job:abc:state", None, "ID_PROVIDED").await?);
///
///     // Atomic counter
///     assert_eq!(store.increment("job:abc:allocated_parts", 1).await?, 1);
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the current value of a key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value of `key` with `new` if it currently equals `expected`
    ///
    /// `expected == None` means "only if the key is absent".
    ///
    /// # Returns
    ///
    /// `true` if the write happened, `false` if the current value did not match
    async fn compare_and_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool>;

    /// Atomically add `delta` to an integer counter and return the new value
    ///
    /// A missing key counts as `0`.
    ///
    /// # Errors
    ///
    /// Returns a `Corrupted` error if the stored value is not an integer
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Point lookups for several keys, in input order
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: WorkQueue
// ═══════════════════════════════════════════════════════════════════════════

/// FIFO work queue with at-least-once delivery
///
/// # Delivery contract
///
/// 1. `push` appends an entry; order is global arrival order
/// 2. `dequeue` leases the oldest deliverable entry for `lease`
/// 3. `ack` removes a leased entry for good
/// 4. `nack`, or the lease running out, makes the entry deliverable again at
///    its original position; a `nack` with a delay hides it until the delay
///    has passed
///
/// A consumer that crashes before `ack` therefore causes redelivery, so
/// consumers must be idempotent per `(job_id, part)`.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append an entry, returning its queue id
    async fn push(&self, entry: QueueEntry) -> Result<u64>;

    /// Lease the next deliverable entry, if any
    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery
    ///
    /// # Returns
    ///
    /// `false` if the lease was lost (expired and redelivered, or already acked)
    async fn ack(&self, delivery: &Delivery) -> Result<bool>;

    /// Give a delivery back without completing it
    ///
    /// The entry is not delivered again before `delay` has passed.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool>;

    /// Entries not yet acknowledged (ready + leased)
    async fn pending(&self) -> Result<usize>;
}
