/*
 * Remote Analyze Client
 *
 * For each compilation unit: collect its dependencies, hash them, ask the
 * server which digests it lacks, and ship only those in the bundle.
 *
 * Architecture:
 * - Content hasher (parallel SHA-256 over dependency files)
 * - Dependency collector (external tool, one path per line)
 * - Cache negotiation + bundle packing
 * - Framed msgpack RPC client
 */

pub mod client;
pub mod collector;
pub mod compile_db;
pub mod config;
pub mod error;
pub mod hasher;
pub mod negotiator;
pub mod submission;

pub use client::RemoteAnalyzeClient;
pub use collector::{CommandCollector, DependencyCollector};
pub use compile_db::{load_compile_database, parse_compile_database, CompileUnit};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use hasher::{hash_files, HashedFile, HashedFiles};
pub use negotiator::{prepare_bundle, PreparedBundle};
pub use submission::{wait_for_completion, SubmissionReport, Submitter};
