/*
 * Remote Analyze Orchestration - job lifecycle and source cache server
 *
 * Clients ship the sources of a compilation unit, minus the files the server
 * already has, and poll for the analysis result.
 *
 * Architecture:
 * - Job Store (state machine over the KeyValueStore port)
 * - Blob index + blob store (content-addressed dedup)
 * - Submission handler and status/result gateway (service)
 * - Work queue consumers (worker pool + analyzer)
 * - Framed msgpack RPC over TCP (protocol + server)
 */

// Public modules
pub mod analyzer;
pub mod blob;
pub mod bundle;
pub mod config;
pub mod error;
pub mod job;
pub mod job_store;
pub mod keys;
pub mod protocol;
pub mod server;
pub mod service;
pub mod worker;
pub mod workspace;

// Re-exports
pub use analyzer::CommandAnalyzer;
pub use blob::{BlobIndex, BlobStore};
pub use bundle::{Bundle, BundleBuilder, BundleLimits, BundleMetadata};
pub use config::{ServerConfig, StoreBackend};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use job::{Job, JobState, Transition};
pub use job_store::JobStore;
pub use keys::JobKeys;
pub use protocol::{Request, Response, WireErrorKind, DEFAULT_MAX_FRAME_BYTES};
pub use server::Server;
pub use service::AnalyzeService;
pub use worker::{
    Analyzer, PartContext, RoundRobinSlots, Slot, SlotScheduler, WorkerConfig, WorkerPool,
};
pub use workspace::Workspace;
