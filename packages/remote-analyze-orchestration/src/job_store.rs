//! Durable job records on top of the `KeyValueStore` port
//!
//! Every mutation is one store primitive: part numbers come from `increment`,
//! state moves through a compare-and-set loop, per-part completion is a
//! create-if-absent marker, sealing is a create-if-absent write of the part
//! count. Nothing here holds a lock across I/O.

use chrono::{DateTime, Utc};
use remote_analyze_storage::{JobId, KeyValueStore};
use std::sync::Arc;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobState, Transition};
use crate::keys::JobKeys;
use crate::workspace::Workspace;

#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn KeyValueStore>,
}

fn parse_counter(key: &str, raw: Option<String>) -> Result<u64> {
    match raw {
        None => Ok(0),
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| OrchestratorError::parse(format!("Invalid counter at {}: {}", key, raw))),
    }
}

impl JobStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Create the job record in `ID_PROVIDED`
    ///
    /// Returns `false` if a record with this id already exists.
    pub async fn create(&self, id: &JobId) -> Result<bool> {
        let keys = JobKeys::new(id);
        let created = self
            .store
            .compare_and_set(&keys.state(), None, JobState::IdProvided.as_str())
            .await?;

        if created {
            self.store
                .compare_and_set(&keys.created_at(), None, &Utc::now().to_rfc3339())
                .await?;
        }
        Ok(created)
    }

    /// Current state, `None` for an unknown job
    pub async fn state(&self, id: &JobId) -> Result<Option<JobState>> {
        let raw = self.store.get(&JobKeys::new(id).state()).await?;
        raw.as_deref().map(JobState::from_str).transpose()
    }

    /// Current state, `JobNotFound` for an unknown job
    pub async fn require_state(&self, id: &JobId) -> Result<JobState> {
        self.state(id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))
    }

    /// Snapshot of the whole record
    pub async fn load(&self, id: &JobId, workspace: &Workspace) -> Result<Option<Job>> {
        let keys = JobKeys::new(id);
        let lookup = vec![
            keys.state(),
            keys.parts(),
            keys.completed_parts(),
            keys.allocated_parts(),
            keys.expected_parts(),
            keys.created_at(),
        ];
        let mut values = self.store.get_many(&lookup).await?.into_iter();

        let Some(state) = values.next().flatten() else {
            return Ok(None);
        };
        let state = JobState::from_str(&state)?;
        let parts = parse_counter(&lookup[1], values.next().flatten())?;
        let completed_parts = parse_counter(&lookup[2], values.next().flatten())?;
        let allocated_parts = parse_counter(&lookup[3], values.next().flatten())?;
        let expected_parts = values
            .next()
            .flatten()
            .map(|raw| parse_counter(&lookup[4], Some(raw)))
            .transpose()?;
        let created_at = values
            .next()
            .flatten()
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc));

        Ok(Some(Job {
            id: id.clone(),
            state,
            parts,
            completed_parts,
            allocated_parts,
            expected_parts,
            workspace: workspace.job_dir(id),
            created_at,
        }))
    }

    /// Reserve the next part number (1, 2, ...)
    ///
    /// A single atomic increment; concurrent callers always get distinct numbers.
    pub async fn allocate_part(&self, id: &JobId) -> Result<u64> {
        let next = self
            .store
            .increment(&JobKeys::new(id).allocated_parts(), 1)
            .await?;
        Ok(next as u64)
    }

    /// Count one more durably stored part
    pub async fn record_stored_part(&self, id: &JobId) -> Result<u64> {
        let parts = self.store.increment(&JobKeys::new(id).parts(), 1).await?;
        Ok(parts as u64)
    }

    /// Stored and completed part counts
    pub async fn part_counts(&self, id: &JobId) -> Result<(u64, u64)> {
        let keys = JobKeys::new(id);
        let lookup = vec![keys.parts(), keys.completed_parts()];
        let mut values = self.store.get_many(&lookup).await?.into_iter();

        let parts = parse_counter(&lookup[0], values.next().flatten())?;
        let completed = parse_counter(&lookup[1], values.next().flatten())?;
        Ok((parts, completed))
    }

    /// Part count the job was sealed with, `None` while it is still open
    pub async fn expected_parts(&self, id: &JobId) -> Result<Option<u64>> {
        let key = JobKeys::new(id).expected_parts();
        let raw = self.store.get(&key).await?;
        raw.map(|raw| parse_counter(&key, Some(raw))).transpose()
    }

    /// Fix the job's part count at the number of parts stored so far
    ///
    /// Sealing twice is harmless: the second call returns the count fixed by
    /// the first.
    pub async fn seal(&self, id: &JobId) -> Result<u64> {
        self.require_state(id).await?;

        let (parts, _) = self.part_counts(id).await?;
        if parts == 0 {
            return Err(OrchestratorError::NothingToSeal(id.to_string()));
        }

        let key = JobKeys::new(id).expected_parts();
        if self
            .store
            .compare_and_set(&key, None, &parts.to_string())
            .await?
        {
            debug!("Job {} sealed with {} parts", id, parts);
            return Ok(parts);
        }

        self.expected_parts(id)
            .await?
            .ok_or_else(|| OrchestratorError::parse(format!("Seal of job {} vanished", id)))
    }

    /// Move the job forward to `target`
    ///
    /// A no-op when the job is already at or past `target`. Returns the state
    /// the job is in afterwards.
    pub async fn advance(&self, id: &JobId, target: JobState) -> Result<JobState> {
        let key = JobKeys::new(id).state();

        loop {
            let current = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;
            let state = JobState::from_str(&current)?;

            match state.transition_to(target)? {
                Transition::NoOp => return Ok(state),
                Transition::Advance => {
                    if self
                        .store
                        .compare_and_set(&key, Some(&current), target.as_str())
                        .await?
                    {
                        debug!("Job {} state: {} -> {}", id, state, target);
                        return Ok(target);
                    }
                    // Lost the race; re-read and decide again.
                }
            }
        }
    }

    /// Record that `part` has been analyzed
    ///
    /// Returns the new completed count, or `None` if this part was already
    /// counted (redelivery).
    pub async fn mark_part_completed(&self, id: &JobId, part: u64) -> Result<Option<u64>> {
        let keys = JobKeys::new(id);
        let first = self
            .store
            .compare_and_set(&keys.part_done(part), None, "1")
            .await?;

        if !first {
            debug!("Part {} of job {} already counted", part, id);
            return Ok(None);
        }

        let completed = self.store.increment(&keys.completed_parts(), 1).await?;
        Ok(Some(completed as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_analyze_storage::MemoryKvStore;
    use std::path::PathBuf;

    fn job_store() -> JobStore {
        JobStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_create_once() {
        let jobs = job_store();
        let id = JobId::generate();

        assert!(jobs.create(&id).await.unwrap());
        assert!(!jobs.create(&id).await.unwrap());
        assert_eq!(jobs.state(&id).await.unwrap(), Some(JobState::IdProvided));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let jobs = job_store();
        let id = JobId::generate();

        assert_eq!(jobs.state(&id).await.unwrap(), None);
        assert!(matches!(
            jobs.require_state(&id).await,
            Err(OrchestratorError::JobNotFound(_))
        ));
        assert!(matches!(
            jobs.advance(&id, JobState::Queued).await,
            Err(OrchestratorError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_advance_is_forward_only() {
        let jobs = job_store();
        let id = JobId::generate();
        jobs.create(&id).await.unwrap();

        assert_eq!(jobs.advance(&id, JobState::Queued).await.unwrap(), JobState::Queued);
        assert_eq!(jobs.advance(&id, JobState::Queued).await.unwrap(), JobState::Queued);
        assert_eq!(
            jobs.advance(&id, JobState::AnalyzeInProgress).await.unwrap(),
            JobState::AnalyzeInProgress
        );
        // Late re-queue does not move the job back
        assert_eq!(
            jobs.advance(&id, JobState::Queued).await.unwrap(),
            JobState::AnalyzeInProgress
        );
    }

    #[tokio::test]
    async fn test_advance_rejects_skip() {
        let jobs = job_store();
        let id = JobId::generate();
        jobs.create(&id).await.unwrap();

        let result = jobs.advance(&id, JobState::AnalyzeCompleted).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidStateTransition { .. })
        ));
        assert_eq!(jobs.state(&id).await.unwrap(), Some(JobState::IdProvided));
    }

    #[tokio::test]
    async fn test_allocation_is_separate_from_stored_count() {
        let jobs = job_store();
        let id = JobId::generate();
        jobs.create(&id).await.unwrap();

        assert_eq!(jobs.allocate_part(&id).await.unwrap(), 1);
        assert_eq!(jobs.allocate_part(&id).await.unwrap(), 2);
        assert_eq!(jobs.record_stored_part(&id).await.unwrap(), 1);

        let job = jobs.load(&id, &Workspace::new("/w")).await.unwrap().unwrap();
        assert_eq!(job.allocated_parts, 2);
        assert_eq!(job.parts, 1);
        assert_eq!(job.completed_parts, 0);
        assert_eq!(job.expected_parts, None);
        assert!(job.created_at.is_some());
        assert_eq!(job.workspace, PathBuf::from("/w").join(id.as_str()));
    }

    #[tokio::test]
    async fn test_mark_part_completed_counts_once() {
        let jobs = job_store();
        let id = JobId::generate();
        jobs.create(&id).await.unwrap();

        assert_eq!(jobs.mark_part_completed(&id, 1).await.unwrap(), Some(1));
        assert_eq!(jobs.mark_part_completed(&id, 1).await.unwrap(), None);
        assert_eq!(jobs.mark_part_completed(&id, 2).await.unwrap(), Some(2));
        assert_eq!(jobs.part_counts(&id).await.unwrap(), (0, 2));
    }

    #[tokio::test]
    async fn test_seal_fixes_stored_part_count() {
        let jobs = job_store();
        let id = JobId::generate();
        jobs.create(&id).await.unwrap();

        assert!(matches!(
            jobs.seal(&id).await,
            Err(OrchestratorError::NothingToSeal(_))
        ));
        assert_eq!(jobs.expected_parts(&id).await.unwrap(), None);

        jobs.allocate_part(&id).await.unwrap();
        jobs.record_stored_part(&id).await.unwrap();
        jobs.allocate_part(&id).await.unwrap();
        jobs.record_stored_part(&id).await.unwrap();
        assert_eq!(jobs.seal(&id).await.unwrap(), 2);

        // A late stored part does not move the seal
        jobs.record_stored_part(&id).await.unwrap();
        assert_eq!(jobs.seal(&id).await.unwrap(), 2);

        let job = jobs.load(&id, &Workspace::new("/w")).await.unwrap().unwrap();
        assert_eq!(job.expected_parts, Some(2));
        assert_eq!(job.parts, 3);
    }

    #[tokio::test]
    async fn test_seal_unknown_job() {
        let jobs = job_store();
        assert!(matches!(
            jobs.seal(&JobId::generate()).await,
            Err(OrchestratorError::JobNotFound(_))
        ));
    }
}
