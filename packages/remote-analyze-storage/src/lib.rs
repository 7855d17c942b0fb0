//! Remote Analyze Storage - durable state behind the analysis service
//!
//! ## Core Principles
//!
//! 1. **Narrow store**: job state, counters and the blob index are all built on
//!    `get` / `compare_and_set` / `increment`
//! 2. **Monotonic facts**: nothing this crate writes for a digest is ever removed
//! 3. **At-least-once queue**: entries leave the queue only on explicit `ack`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use remote_analyze_storage::{KeyValueStore, MemoryKvStore, MemoryWorkQueue, QueueEntry, WorkQueue};
//! use std::time::Duration;
//!
//! let store = MemoryKvStore::new();
//! let part = store.increment("job:abc:allocated_parts", 1).await?;
//!
//! let queue = MemoryWorkQueue::new();
//! queue.push(QueueEntry::new("abc", part as u64)).await?;
//! if let Some(delivery) = queue.dequeue(Duration::from_secs(60)).await? {
//!     // ... process ...
//!     queue.ack(&delivery).await?;
//! }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{Delivery, Digest, JobId, KeyValueStore, QueueEntry, WorkQueue};
pub use infrastructure::{MemoryKvStore, MemoryWorkQueue};

#[cfg(feature = "sqlite")]
pub use infrastructure::{SqliteKvStore, SqliteWorkQueue};
