//! Analysis workers
//!
//! The pool leases queue entries, one per free slot, and runs the configured
//! [`Analyzer`] on the part's sources. Handling an entry is idempotent per
//! `(job_id, part)`: redelivery re-runs the analysis at most, it never counts a
//! part twice.
//!
//! # Flow per entry
//!
//! ```text
//! dequeue → state IN_PROGRESS → extract part_<n>.zip → materialize cached blobs
//!   → analyze → mark part done → (sealed, all parts done) → output.zip → COMPLETED
//! ```
//!
//! A retryable failure goes back to the queue with a growing delay. Once an
//! entry has used up `max_attempts` it is finished like a permanent failure,
//! so one broken part cannot hold its job open forever.

use async_trait::async_trait;
use remote_analyze_storage::{Delivery, JobId, QueueEntry, WorkQueue};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::blob::BlobStore;
use crate::bundle::{Bundle, BundleLimits, BundleMetadata, SOURCES_ROOT};
use crate::error::{OrchestratorError, Result};
use crate::job::JobState;
use crate::job_store::JobStore;
use crate::service::AnalyzeService;
use crate::workspace::{write_atomic, Workspace};

/// Name of the note written into a part's output when its analysis failed
pub const FAILURE_NOTE: &str = "analysis_failed.txt";

// ═══════════════════════════════════════════════════════════════════════════
// Analyzer
// ═══════════════════════════════════════════════════════════════════════════

/// Everything an analyzer needs to process one part
#[derive(Debug, Clone)]
pub struct PartContext {
    pub job_id: JobId,
    pub part: u64,
    /// Worker slot the part runs in
    pub slot: usize,
    /// Root the part's sources were extracted to (original paths below it)
    pub sources_dir: PathBuf,
    /// Where the analyzer puts its results
    pub output_dir: PathBuf,
    /// The compiled source file inside `sources_dir`
    pub source_file: PathBuf,
    pub metadata: BundleMetadata,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze one part, writing results below `ctx.output_dir`
    ///
    /// A retryable error hands the entry back to the queue; any other error
    /// finishes the part with a failure note.
    async fn analyze(&self, ctx: &PartContext) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Slot scheduling
// ═══════════════════════════════════════════════════════════════════════════

/// A held worker slot; released on drop
#[derive(Debug)]
pub struct Slot {
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Hands out ready worker slots
#[async_trait]
pub trait SlotScheduler: Send + Sync {
    /// Wait for a free slot
    async fn acquire(&self) -> Result<Slot>;

    fn capacity(&self) -> usize;
}

/// Fixed number of local slots, assigned round-robin
pub struct RoundRobinSlots {
    permits: Arc<Semaphore>,
    next: AtomicUsize,
    capacity: usize,
}

impl RoundRobinSlots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            next: AtomicUsize::new(0),
            capacity,
        }
    }
}

#[async_trait]
impl SlotScheduler for RoundRobinSlots {
    async fn acquire(&self) -> Result<Slot> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| OrchestratorError::Other(e.into()))?;
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.capacity;
        Ok(Slot {
            index,
            _permit: permit,
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker pool
// ═══════════════════════════════════════════════════════════════════════════

/// Upper bound of the retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a leased entry stays invisible to other workers
    pub lease: Duration,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Deliveries of one entry before a retryable failure is final
    pub max_attempts: u32,
    /// Delay before the first retry; doubles with every further attempt
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Delay before redelivering an entry that failed on `attempt`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1 << doublings)
            .min(MAX_RETRY_DELAY)
    }
}

pub struct WorkerPool {
    jobs: JobStore,
    queue: Arc<dyn WorkQueue>,
    workspace: Workspace,
    blob_store: BlobStore,
    limits: BundleLimits,
    analyzer: Arc<dyn Analyzer>,
    scheduler: Arc<dyn SlotScheduler>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        service: &AnalyzeService,
        analyzer: Arc<dyn Analyzer>,
        scheduler: Arc<dyn SlotScheduler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs: service.jobs().clone(),
            queue: service.queue().clone(),
            workspace: service.workspace().clone(),
            blob_store: service.blob_store().clone(),
            limits: service.limits(),
            analyzer,
            scheduler,
            config,
        }
    }

    /// Consume the queue until `shutdown` fires, then wait for running parts
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("Worker pool started with {} slots", self.scheduler.capacity());
        let mut running = JoinSet::new();

        loop {
            let slot = tokio::select! {
                _ = shutdown.cancelled() => break,
                slot = self.scheduler.acquire() => slot?,
            };

            let delivery = match self.queue.dequeue(self.config.lease).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(slot);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
                Err(e) => {
                    error!("Dequeue failed: {}", e);
                    drop(slot);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
            };

            let pool = self.clone();
            running.spawn(async move { pool.handle_delivery(delivery, slot).await });

            while let Some(finished) = running.try_join_next() {
                if let Err(e) = finished {
                    error!("Worker task panicked: {}", e);
                }
            }
        }

        info!("Worker pool stopping, waiting for {} running parts", running.len());
        while let Some(finished) = running.join_next().await {
            if let Err(e) = finished {
                error!("Worker task panicked: {}", e);
            }
        }
        Ok(())
    }

    /// Process one delivery and settle it with the queue
    pub async fn handle_delivery(&self, delivery: Delivery, slot: Slot) {
        let entry = &delivery.entry;
        let outcome = self.process(entry, slot.index()).await;
        drop(slot);

        let attempts_left = delivery.attempt < self.config.max_attempts;
        let settled = match outcome {
            Ok(()) => self.queue.ack(&delivery).await,
            Err(e) if e.category().is_retryable() && attempts_left => {
                let delay = self.config.retry_delay(delivery.attempt);
                warn!(
                    "Part {} of job {} failed ({}) on attempt {}, retrying in {:?}: {}",
                    entry.part,
                    entry.job_id,
                    e.category(),
                    delivery.attempt,
                    delay,
                    e
                );
                self.queue.nack(&delivery, delay).await
            }
            Err(e) => {
                error!(
                    "Giving up on part {} of job {} after {} attempt(s): {}",
                    entry.part, entry.job_id, delivery.attempt, e
                );
                if let Err(abandon) = self.abandon(entry, &e).await {
                    error!(
                        "Failed to finish abandoned part {} of job {}: {}",
                        entry.part, entry.job_id, abandon
                    );
                }
                self.queue.ack(&delivery).await
            }
        };

        match settled {
            Ok(true) => {}
            Ok(false) => warn!(
                "Lease on part {} of job {} was lost before it was settled",
                entry.part, entry.job_id
            ),
            Err(e) => error!(
                "Failed to settle part {} of job {}: {}",
                entry.part, entry.job_id, e
            ),
        }
    }

    /// Finish a part that will not be retried: note the failure, count it
    async fn abandon(&self, entry: &QueueEntry, error: &OrchestratorError) -> Result<()> {
        let Some(id) = JobId::parse(&entry.job_id) else {
            return Ok(());
        };
        if self.jobs.state(&id).await?.is_none() {
            return Ok(());
        }

        self.write_failure_note(&id, entry.part, error).await?;
        self.jobs.mark_part_completed(&id, entry.part).await?;
        finalize_if_complete(&self.jobs, &self.workspace, &id).await?;
        Ok(())
    }

    /// Handle one queue entry
    ///
    /// `Ok` means the entry is finished with (analyzed, or unusable and
    /// dropped). On `Err` the caller decides between another delivery and
    /// giving up on the part.
    pub async fn process(&self, entry: &QueueEntry, slot: usize) -> Result<()> {
        let Some(id) = JobId::parse(&entry.job_id) else {
            warn!("Queue entry with invalid job id {:?}, dropping", entry.job_id);
            return Ok(());
        };
        if self.jobs.state(&id).await?.is_none() {
            warn!("Queue entry for unknown job {}, dropping", id);
            return Ok(());
        }

        self.jobs.advance(&id, JobState::AnalyzeInProgress).await?;

        match self.analyze_part(&id, entry.part, slot).await {
            Ok(()) => debug!("Part {} of job {} analyzed in slot {}", entry.part, id, slot),
            Err(e) if e.category().is_retryable() => return Err(e),
            Err(e) => {
                error!("Analysis of part {} of job {} failed: {}", entry.part, id, e);
                self.write_failure_note(&id, entry.part, &e).await?;
            }
        }

        if let Some(completed) = self.jobs.mark_part_completed(&id, entry.part).await? {
            debug!("Job {}: {} parts completed", id, completed);
        }

        finalize_if_complete(&self.jobs, &self.workspace, &id).await?;
        Ok(())
    }

    async fn analyze_part(&self, id: &JobId, part: u64, slot: usize) -> Result<()> {
        let archive = self.workspace.part_archive(id, part);
        let part_dir = self.workspace.part_dir(id, part);
        let sources_dir = part_dir.join(SOURCES_ROOT);
        let output_dir = part_dir.join("output");

        let bytes = tokio::fs::read(&archive)
            .await
            .map_err(|e| OrchestratorError::storage_failure("read part archive", e))?;

        let limits = self.limits;
        let extract_to = part_dir.clone();
        let bundle = tokio::task::spawn_blocking(move || -> Result<Bundle> {
            let bundle = Bundle::parse(&bytes, limits)?;
            // A redelivered part starts from a clean directory.
            if extract_to.exists() {
                std::fs::remove_dir_all(&extract_to)?;
            }
            bundle.write_sources(&extract_to.join(SOURCES_ROOT))?;
            Ok(bundle)
        })
        .await
        .map_err(|e| OrchestratorError::Other(e.into()))??;

        for (digest, original) in &bundle.metadata.cached_files {
            let Some(dest) = Bundle::resolve(&sources_dir, original) else {
                warn!("Cached file with unusable path {:?} in job {}", original, id);
                continue;
            };
            if !self.blob_store.copy_to(digest, &dest).await? {
                warn!(
                    "Cached file {} ({}) of job {} is not in the blob store",
                    original, digest, id
                );
            }
        }

        let source_file =
            Bundle::resolve(&sources_dir, &bundle.metadata.file_path).ok_or_else(|| {
                OrchestratorError::InvalidBundle(format!(
                    "unusable file_path {:?}",
                    bundle.metadata.file_path
                ))
            })?;

        tokio::fs::create_dir_all(&output_dir).await?;

        let ctx = PartContext {
            job_id: id.clone(),
            part,
            slot,
            sources_dir,
            output_dir,
            source_file,
            metadata: bundle.metadata,
        };
        self.analyzer.analyze(&ctx).await
    }

    async fn write_failure_note(&self, id: &JobId, part: u64, error: &OrchestratorError) -> Result<()> {
        let output_dir = self.workspace.part_dir(id, part).join("output");
        tokio::fs::create_dir_all(&output_dir).await?;
        write_atomic(&output_dir.join(FAILURE_NOTE), error.to_string().as_bytes()).await?;
        Ok(())
    }

}

/// Build `output.zip` and complete the job once it is sealed and every part
/// it was sealed with is done
///
/// Runs after each finished part and after sealing, whichever comes last
/// completes the job. Returns `true` if the job is completed afterwards.
pub async fn finalize_if_complete(
    jobs: &JobStore,
    workspace: &Workspace,
    id: &JobId,
) -> Result<bool> {
    let Some(job) = jobs.load(id, workspace).await? else {
        return Err(OrchestratorError::JobNotFound(id.to_string()));
    };
    if job.state == JobState::AnalyzeCompleted {
        return Ok(true);
    }
    if !job.all_parts_completed() {
        return Ok(false);
    }

    // Part numbers, not the stored count: a failed write leaves a gap.
    let last_part = job.allocated_parts;
    let job_dir = job.workspace.clone();
    let archive = tokio::task::spawn_blocking(move || aggregate_outputs(&job_dir, last_part))
        .await
        .map_err(|e| OrchestratorError::Other(e.into()))??;

    let output = workspace.output_archive(id);
    write_atomic(&output, &archive)
        .await
        .map_err(|e| OrchestratorError::storage_failure("write output archive", e))?;

    jobs.advance(id, JobState::AnalyzeCompleted).await?;
    info!(
        "Job {} completed with {} parts ({} bytes of results)",
        id,
        job.completed_parts,
        archive.len()
    );
    Ok(true)
}

/// Zip the `output/` tree of parts 1..=parts as `part_<n>/...`
pub fn aggregate_outputs(job_dir: &Path, parts: u64) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for part in 1..=parts {
        let output_dir = job_dir.join(format!("part_{}", part)).join("output");
        if !output_dir.is_dir() {
            continue;
        }

        let walker = WalkDir::new(&output_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file());

        for entry in walker {
            let Ok(relative) = entry.path().strip_prefix(&output_dir) else {
                continue;
            };
            let relative: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let name = format!("part_{}/{}", part, relative.join("/"));

            writer.start_file(name, options)?;
            writer.write_all(&std::fs::read(entry.path())?)?;
        }
    }

    Ok(writer.finish()?.into_inner())
}
