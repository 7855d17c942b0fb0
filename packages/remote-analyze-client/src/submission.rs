//! Submitting compilation units and waiting for the job

use remote_analyze_orchestration::JobState;
use remote_analyze_storage::JobId;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::client::RemoteAnalyzeClient;
use crate::collector::DependencyCollector;
use crate::compile_db::CompileUnit;
use crate::error::{ClientError, ClientResult};
use crate::hasher::hash_files;
use crate::negotiator::prepare_bundle;

/// Outcome of submitting a set of units
#[derive(Debug, Default)]
pub struct SubmissionReport {
    /// Part numbers assigned by the server, in submission order
    pub parts: Vec<u64>,
    /// Units whose dependencies could not be collected
    pub skipped: Vec<(PathBuf, String)>,
}

pub struct Submitter {
    collector: Arc<dyn DependencyCollector>,
}

impl Submitter {
    pub fn new(collector: Arc<dyn DependencyCollector>) -> Self {
        Self { collector }
    }

    /// Collect, hash, negotiate and submit one unit
    pub async fn submit_unit(
        &self,
        client: &mut RemoteAnalyzeClient,
        job_id: &JobId,
        unit: &CompileUnit,
    ) -> ClientResult<u64> {
        let collector = self.collector.clone();
        let to_hash = unit.clone();
        let hashed = tokio::task::spawn_blocking(move || {
            let mut dependencies = collector.collect(&to_hash)?;
            let source = to_hash.source().to_path_buf();
            if !dependencies.contains(&source) {
                dependencies.insert(0, source);
            }
            Ok::<_, ClientError>(hash_files(&dependencies))
        })
        .await
        .map_err(|e| ClientError::Bundle(format!("hashing task failed: {}", e)))??;

        let missing = client.check_uploaded_files(&hashed.digests()).await?;
        debug!(
            "{}: {} of {} files missing on the server",
            unit.source().display(),
            missing.len(),
            hashed.len()
        );

        let build_command = unit.build_command();
        let source = unit.source().to_path_buf();
        let prepared = tokio::task::spawn_blocking(move || {
            prepare_bundle(&hashed, &missing, &build_command, &source)
        })
        .await
        .map_err(|e| ClientError::Bundle(format!("bundling task failed: {}", e)))??;

        let (uploaded, cached) = (prepared.uploaded, prepared.cached);
        let part = client.analyze(job_id, prepared.bytes).await?;
        info!(
            "Submitted {} as part {} ({} uploaded, {} cached)",
            unit.source().display(),
            part,
            uploaded,
            cached
        );
        Ok(part)
    }

    /// Submit every unit; a unit whose collector fails is skipped
    pub async fn submit_all(
        &self,
        client: &mut RemoteAnalyzeClient,
        job_id: &JobId,
        units: &[CompileUnit],
    ) -> ClientResult<SubmissionReport> {
        let mut report = SubmissionReport::default();
        for unit in units {
            match self.submit_unit(client, job_id, unit).await {
                Ok(part) => report.parts.push(part),
                Err(e @ ClientError::CollectorFailure { .. }) => {
                    warn!("Skipping {}: {}", unit.source().display(), e);
                    report
                        .skipped
                        .push((unit.source().to_path_buf(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

/// Poll until the job is completed or `timeout` elapses
pub async fn wait_for_completion(
    client: &mut RemoteAnalyzeClient,
    job_id: &JobId,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> ClientResult<()> {
    let started = Instant::now();
    loop {
        let state = client.get_status(job_id).await?;
        debug!("Job {} is {}", job_id, state.as_str());
        if state == JobState::AnalyzeCompleted {
            return Ok(());
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                return Err(ClientError::timeout(format!(
                    "job {} still {} after {:?}",
                    job_id,
                    state.as_str(),
                    limit
                )));
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}
