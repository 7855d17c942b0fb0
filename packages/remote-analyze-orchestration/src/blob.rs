//! Content-addressed source cache
//!
//! `BlobIndex` is the global existence index used for dedup decisions.
//! `BlobStore` keeps the bytes behind each known digest so workers can
//! materialize files a client only referenced.

use remote_analyze_storage::{Digest, KeyValueStore};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::keys::blob_key;
use crate::workspace::write_atomic;

/// Global digest → known index
///
/// Monotonic: a digest is never unmarked.
#[derive(Clone)]
pub struct BlobIndex {
    store: Arc<dyn KeyValueStore>,
}

impl BlobIndex {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Digests in `digests` not recorded as known
    ///
    /// Set semantics: duplicates collapse and input order is irrelevant. Pure
    /// read; nothing is marked.
    pub async fn missing(&self, digests: &[Digest]) -> Result<BTreeSet<Digest>> {
        let unique: Vec<Digest> = digests
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Ok(BTreeSet::new());
        }

        let keys: Vec<String> = unique.iter().map(blob_key).collect();
        let found = self.store.get_many(&keys).await?;

        Ok(unique
            .into_iter()
            .zip(found)
            .filter(|(_, value)| value.is_none())
            .map(|(digest, _)| digest)
            .collect())
    }

    /// Record `digest` as known
    ///
    /// Returns `true` if this call was the first to mark it.
    pub async fn mark_known(&self, digest: &Digest) -> Result<bool> {
        Ok(self
            .store
            .compare_and_set(&blob_key(digest), None, "1")
            .await?)
    }
}

/// Blob bytes on disk, `<root>/<first two hex>/<digest>`
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, digest: &Digest) -> Result<PathBuf> {
        if !digest.is_well_formed() {
            return Err(OrchestratorError::InvalidBundle(format!(
                "Malformed digest: {}",
                digest
            )));
        }
        let hex = digest.as_str();
        Ok(self.root.join(&hex[..2]).join(hex))
    }

    /// Store `bytes` under `digest`
    ///
    /// Content addressing makes an existing file final; it is left untouched.
    pub async fn put(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(digest)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OrchestratorError::storage_failure("create blob dir", e))?;
        }
        write_atomic(&path, bytes)
            .await
            .map_err(|e| OrchestratorError::storage_failure("write blob", e))
    }

    pub async fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(digest)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestratorError::storage_failure("read blob", e)),
        }
    }

    /// Copy the blob to `dest`, creating parent directories
    ///
    /// Returns `false` if the blob is not present.
    pub async fn copy_to(&self, digest: &Digest, dest: &Path) -> Result<bool> {
        let path = self.path_for(digest)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(&path, dest).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OrchestratorError::storage_failure("copy blob", e)),
        }
    }
}
