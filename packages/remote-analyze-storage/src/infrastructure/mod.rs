//! Infrastructure layer - Storage adapters
//!
//! - `memory`: process-local adapters (tests, single node)
//! - `sqlite`: crash-durable adapters

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryKvStore, MemoryWorkQueue};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteKvStore, SqliteWorkQueue};
