use remote_analyze_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] StorageError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Analysis of job {job_id} is not completed (state: {state})")]
    NotCompleted { job_id: String, state: String },

    #[error("Job {0} is sealed, no further parts are accepted")]
    Sealed(String),

    #[error("Job {0} has no stored parts to seal")]
    NothingToSeal(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Local write/read failure while persisting a part or serving a result
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Analyzer failed: {0}")]
    AnalyzerFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn storage_failure<E: std::fmt::Display>(context: &str, e: E) -> Self {
        Self::StorageFailure(format!("{}: {}", context, e))
    }

    /// Classify for retry decisions in the worker loop
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Store(_) | OrchestratorError::Timeout(_) => ErrorCategory::Transient,
            OrchestratorError::StorageFailure(_) | OrchestratorError::Io(_) => {
                ErrorCategory::Infrastructure
            }
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, store busy)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, parse error)
    Permanent,
    /// Infrastructure error - alert ops (e.g., disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    /// Should the queue entry be handed back for another attempt?
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_names() {
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
        assert_eq!(ErrorCategory::Permanent.as_str(), "permanent");
        assert_eq!(ErrorCategory::Infrastructure.as_str(), "infrastructure");
        assert!(ErrorCategory::Infrastructure.is_retryable());
    }

    #[test]
    fn test_categorize_errors() {
        let store = OrchestratorError::Store(StorageError::database("locked"));
        assert_eq!(store.category(), ErrorCategory::Transient);

        let disk = OrchestratorError::storage_failure("write part", "disk full");
        assert_eq!(disk.category(), ErrorCategory::Infrastructure);
        assert!(disk.to_string().contains("write part: disk full"));

        let bundle = OrchestratorError::InvalidBundle("no build_command".to_string());
        assert_eq!(bundle.category(), ErrorCategory::Permanent);
        assert!(!bundle.category().is_retryable());
    }

    #[test]
    fn test_not_completed_message() {
        let err = OrchestratorError::NotCompleted {
            job_id: "abc".to_string(),
            state: "QUEUED".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Analysis of job abc is not completed (state: QUEUED)"
        );
    }
}
