use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use remote_analyze_storage::JobId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Job state, in lifecycle order
///
/// The derived `Ord` is the lifecycle order; the stored state only ever moves
/// forward along it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    IdProvided,
    Queued,
    AnalyzeInProgress,
    AnalyzeCompleted,
}

/// Outcome of asking for a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state moves forward to the target
    Advance,
    /// The state is already at or past the target; nothing to write
    NoOp,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::IdProvided,
        JobState::Queued,
        JobState::AnalyzeInProgress,
        JobState::AnalyzeCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::IdProvided => "ID_PROVIDED",
            JobState::Queued => "QUEUED",
            JobState::AnalyzeInProgress => "ANALYZE_IN_PROGRESS",
            JobState::AnalyzeCompleted => "ANALYZE_COMPLETED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "ID_PROVIDED" => Ok(JobState::IdProvided),
            "QUEUED" => Ok(JobState::Queued),
            "ANALYZE_IN_PROGRESS" => Ok(JobState::AnalyzeInProgress),
            "ANALYZE_COMPLETED" => Ok(JobState::AnalyzeCompleted),
            _ => Err(OrchestratorError::parse(format!("Invalid job state: {}", s))),
        }
    }

    /// The only state a forward move into `self` may start from
    fn predecessor(&self) -> Option<JobState> {
        match self {
            JobState::IdProvided => None,
            JobState::Queued => Some(JobState::IdProvided),
            JobState::AnalyzeInProgress => Some(JobState::Queued),
            JobState::AnalyzeCompleted => Some(JobState::AnalyzeInProgress),
        }
    }

    /// Decide how a request to move from `self` to `target` is applied
    ///
    /// - `target <= self`: no-op, a state never moves backward
    /// - `self` is the direct predecessor of `target`: advance
    /// - anything else (skipping a state): error
    pub fn transition_to(&self, target: JobState) -> Result<Transition> {
        if target <= *self {
            return Ok(Transition::NoOp);
        }

        if target.predecessor() == Some(*self) {
            Ok(Transition::Advance)
        } else {
            Err(OrchestratorError::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job model (a snapshot of the stored record)
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    /// Parts durably stored
    pub parts: u64,
    /// Parts acknowledged by workers
    pub completed_parts: u64,
    /// Part numbers handed out, including ones whose write failed
    pub allocated_parts: u64,
    /// Set once the job is sealed; no part is accepted afterwards
    pub expected_parts: Option<u64>,
    pub workspace: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The job is sealed and every part it was sealed with has been analyzed
    pub fn all_parts_completed(&self) -> bool {
        match self.expected_parts {
            Some(expected) => expected > 0 && self.completed_parts >= expected,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_job_state_roundtrip() {
        for state in &JobState::ALL {
            let s = state.as_str();
            let parsed = JobState::from_str(s).unwrap();
            assert_eq!(*state, parsed);
        }
    }

    #[test]
    fn test_job_state_invalid() {
        assert!(JobState::from_str("RUNNING").is_err());
        assert!(JobState::from_str("queued").is_err());
    }

    #[test]
    fn test_job_state_serde_uses_wire_names() {
        let json = serde_json::to_string(&JobState::AnalyzeInProgress).unwrap();
        assert_eq!(json, "\"ANALYZE_IN_PROGRESS\"");
    }

    #[test]
    fn test_job_state_transition_id_provided_to_queued() {
        assert_eq!(
            JobState::IdProvided.transition_to(JobState::Queued).unwrap(),
            Transition::Advance
        );
    }

    #[test]
    fn test_job_state_requeue_is_noop() {
        assert_eq!(
            JobState::Queued.transition_to(JobState::Queued).unwrap(),
            Transition::NoOp
        );
        assert_eq!(
            JobState::AnalyzeCompleted
                .transition_to(JobState::Queued)
                .unwrap(),
            Transition::NoOp
        );
    }

    #[test]
    fn test_job_state_cannot_skip_queued() {
        let result = JobState::IdProvided.transition_to(JobState::AnalyzeInProgress);
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_job_state_running_to_completed() {
        assert_eq!(
            JobState::AnalyzeInProgress
                .transition_to(JobState::AnalyzeCompleted)
                .unwrap(),
            Transition::Advance
        );
    }

    #[test]
    fn test_all_parts_completed() {
        let mut job = Job {
            id: JobId::generate(),
            state: JobState::Queued,
            parts: 0,
            completed_parts: 0,
            allocated_parts: 0,
            expected_parts: None,
            workspace: PathBuf::from("/tmp/x"),
            created_at: None,
        };
        assert!(!job.all_parts_completed());

        job.parts = 2;
        job.completed_parts = 1;
        assert!(!job.all_parts_completed());

        // Every stored part done, but more may still arrive
        job.completed_parts = 2;
        assert!(!job.all_parts_completed());

        job.expected_parts = Some(3);
        assert!(!job.all_parts_completed());

        job.expected_parts = Some(2);
        assert!(job.all_parts_completed());
    }

    fn any_state() -> impl Strategy<Value = JobState> {
        prop::sample::select(JobState::ALL.to_vec())
    }

    proptest! {
        /// Applying any request sequence never moves the state backward
        #[test]
        fn prop_state_never_moves_backward(targets in prop::collection::vec(any_state(), 0..20)) {
            let mut state = JobState::IdProvided;
            for target in targets {
                let before = state;
                if let Ok(Transition::Advance) = state.transition_to(target) {
                    state = target;
                }
                prop_assert!(state >= before);
            }
        }
    }
}
