//! Server-side operations: id issuance, cache negotiation, submission, sealing
//! and the status/result gateway

use remote_analyze_storage::{Digest, JobId, KeyValueStore, QueueEntry, WorkQueue};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::blob::{BlobIndex, BlobStore};
use crate::bundle::{Bundle, BundleLimits};
use crate::error::{OrchestratorError, Result};
use crate::job::JobState;
use crate::job_store::JobStore;
use crate::worker::finalize_if_complete;
use crate::workspace::{write_atomic, Workspace};

/// Attempts at finding an unused job id before giving up
const MAX_ID_ATTEMPTS: usize = 8;

pub struct AnalyzeService {
    jobs: JobStore,
    blobs: BlobIndex,
    blob_store: BlobStore,
    queue: Arc<dyn WorkQueue>,
    workspace: Workspace,
    limits: BundleLimits,
}

impl AnalyzeService {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queue: Arc<dyn WorkQueue>,
        workspace: Workspace,
        blob_store: BlobStore,
    ) -> Self {
        Self {
            jobs: JobStore::new(store.clone()),
            blobs: BlobIndex::new(store),
            blob_store,
            queue,
            workspace,
            limits: BundleLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: BundleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn limits(&self) -> BundleLimits {
        self.limits
    }

    /// Issue a fresh job id in `ID_PROVIDED` with an empty workspace
    pub async fn get_id(&self) -> Result<JobId> {
        self.workspace
            .ensure_root()
            .await
            .map_err(|e| OrchestratorError::storage_failure("create workspace root", e))?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = JobId::generate();

            let fresh_dir = self
                .workspace
                .create_job_dir(&id)
                .await
                .map_err(|e| OrchestratorError::storage_failure("create job directory", e))?;
            if !fresh_dir {
                warn!("Job directory for {} already exists, regenerating id", id);
                continue;
            }

            if !self.jobs.create(&id).await? {
                warn!("Job id {} already recorded, regenerating id", id);
                continue;
            }

            info!("Issued job id {}", id);
            return Ok(id);
        }

        Err(OrchestratorError::StorageFailure(format!(
            "no unused job id after {} attempts",
            MAX_ID_ATTEMPTS
        )))
    }

    /// Digests the server has never stored
    pub async fn check_uploaded_files(&self, digests: &[Digest]) -> Result<BTreeSet<Digest>> {
        let missing = self.blobs.missing(digests).await?;
        debug!(
            "Cache check: {} digests asked, {} missing",
            digests.len(),
            missing.len()
        );
        Ok(missing)
    }

    /// Store one bundle as the next part of `id` and queue it for analysis
    ///
    /// Nothing is queued and the state is untouched unless the part archive
    /// was written in full. A sealed job accepts no further parts.
    pub async fn submit(&self, id: &JobId, bundle_bytes: Vec<u8>) -> Result<u64> {
        self.jobs.require_state(id).await?;
        if self.jobs.expected_parts(id).await?.is_some() {
            return Err(OrchestratorError::Sealed(id.to_string()));
        }

        let limits = self.limits;
        let (bundle, bundle_bytes) = tokio::task::spawn_blocking(move || {
            Bundle::parse(&bundle_bytes, limits).map(|bundle| (bundle, bundle_bytes))
        })
        .await
        .map_err(|e| OrchestratorError::Other(e.into()))??;

        let part = self.jobs.allocate_part(id).await?;
        let archive = self.workspace.part_archive(id, part);

        if let Err(e) = write_atomic(&archive, &bundle_bytes).await {
            error!(
                "Failed to store part {} of job {} at {}: {}",
                part,
                id,
                archive.display(),
                e
            );
            return Err(OrchestratorError::storage_failure("store part", e));
        }

        self.jobs.advance(id, JobState::Queued).await?;
        self.jobs.record_stored_part(id).await?;
        self.queue.push(QueueEntry::new(id.as_str(), part)).await?;

        info!(
            "Stored part {} of job {} ({} files, {} cached)",
            part,
            id,
            bundle.files.len(),
            bundle.metadata.cached_files.len()
        );

        self.remember_blobs(&bundle).await;
        Ok(part)
    }

    /// Keep the bytes of every transmitted file and mark its digest known
    ///
    /// Failures only cost a future re-upload, so they are logged, not returned.
    async fn remember_blobs(&self, bundle: &Bundle) {
        for file in &bundle.files {
            let digest = file.digest();

            if let Err(e) = self.blob_store.put(&digest, &file.bytes).await {
                error!("Failed to store blob {} ({}): {}", digest, file.relative_path, e);
                continue;
            }
            if let Err(e) = self.blobs.mark_known(&digest).await {
                error!("Failed to mark blob {} known: {}", digest, e);
            }
        }
    }

    /// Declare the submission of `id` finished
    ///
    /// The job completes once the parts stored so far are analyzed; if they
    /// already are, it completes here.
    pub async fn seal(&self, id: &JobId) -> Result<u64> {
        let parts = self.jobs.seal(id).await?;
        info!("Job {} sealed with {} parts", id, parts);
        finalize_if_complete(&self.jobs, &self.workspace, id).await?;
        Ok(parts)
    }

    pub async fn get_status(&self, id: &JobId) -> Result<JobState> {
        self.jobs.require_state(id).await
    }

    /// Result archive of a completed job
    pub async fn get_results(&self, id: &JobId) -> Result<Vec<u8>> {
        let state = self.jobs.require_state(id).await?;
        if state != JobState::AnalyzeCompleted {
            return Err(OrchestratorError::NotCompleted {
                job_id: id.to_string(),
                state: state.to_string(),
            });
        }

        let path = self.workspace.output_archive(id);
        tokio::fs::read(&path).await.map_err(|e| {
            error!("Failed to read results of job {} at {}: {}", id, path.display(), e);
            OrchestratorError::storage_failure("read results", e)
        })
    }
}
