//! Domain layer for the remote analyze store
//!
//! # Domain Models
//!
//! - `JobId`: server-issued job identifier (UUID v4, simple form)
//! - `Digest`: SHA-256 content digest of a source file
//! - `QueueEntry` / `Delivery`: work queue payload and a leased delivery of it
//!
//! # Port Traits
//!
//! - `KeyValueStore`: narrow durable store (`get`, `compare_and_set`, `increment`)
//! - `WorkQueue`: FIFO, at-least-once queue with lease/ack/nack

pub mod models;
pub mod ports;

pub use models::{Delivery, Digest, JobId, QueueEntry};
pub use ports::{KeyValueStore, WorkQueue};
