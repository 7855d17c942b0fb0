use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════
// Job identifier
// ═══════════════════════════════════════════════════════════════════════════

/// Maximum accepted length of a job identifier on the wire.
const MAX_JOB_ID_LEN: usize = 64;

/// Server-issued job identifier
///
/// Generated from 122 bits of UUID v4 randomness, rendered without hyphens.
/// Identifiers double as workspace directory names, so anything parsed from
/// the outside is restricted to `[A-Za-z0-9_-]`.
///
/// # Examples
///
/// ```rust
/// use remote_analyze_storage::domain::JobId;
///
/// let id = JobId::generate();
/// assert_eq!(id.as_str().len(), 32);
/// assert!(JobId::parse("../etc").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parse an identifier received from a client
    ///
    /// Returns `None` for empty, over-long or path-unsafe input.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_JOB_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Content digest
// ═══════════════════════════════════════════════════════════════════════════

/// SHA-256 content digest, lowercase hex
///
/// Two files with the same digest are treated as the same blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Length of the hex rendering
    pub const HEX_LEN: usize = 64;

    /// Hash an in-memory buffer
    pub fn compute(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Hash everything a reader yields
    pub fn from_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha256::new();

        let mut buffer = [0u8; 8192];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    /// Hash a file's content
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    /// Wrap a digest string received from a peer
    ///
    /// No validation happens here: an unknown string is simply a digest the
    /// server has never seen.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for a well-formed 64 character lowercase hex digest
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == Self::HEX_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Work queue payloads
// ═══════════════════════════════════════════════════════════════════════════

/// One unit of analysis work: a stored part of a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub part: u64,
}

impl QueueEntry {
    pub fn new(job_id: impl Into<String>, part: u64) -> Self {
        Self {
            job_id: job_id.into(),
            part,
        }
    }
}

/// A leased delivery of a queue entry
///
/// `attempt` is bumped on every redelivery and acts as the lease token: an
/// acknowledgment carrying an older attempt is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub attempt: u32,
    pub entry: QueueEntry,
}
