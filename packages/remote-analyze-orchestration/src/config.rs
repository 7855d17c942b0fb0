//! Server configuration
//!
//! Precedence, lowest to highest: built-in defaults, YAML file,
//! `REMOTE_ANALYZE_*` environment variables, command line flags.
//!
//! ```yaml
//! bind: 0.0.0.0:9090
//! workspace_root: /srv/remote-analyze/jobs
//! data_root: /srv/remote-analyze/data
//! store:
//!   backend: sqlite
//! worker_slots: 4
//! max_attempts: 5
//! retry_backoff_ms: 1000
//! analyzer:
//!   program: CodeChecker
//!   args: [check]
//! ```

use remote_analyze_storage::{KeyValueStore, MemoryKvStore, MemoryWorkQueue, WorkQueue};
use remote_analyze_storage::{SqliteKvStore, SqliteWorkQueue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::analyzer::CommandAnalyzer;
use crate::blob::BlobStore;
use crate::error::{OrchestratorError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::worker::WorkerConfig;
use crate::workspace::Workspace;

const ENV_PREFIX: &str = "REMOTE_ANALYZE_";

/// Smallest frame limit that still fits a request envelope
const MIN_FRAME_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; state is lost on restart
    Memory,
    /// SQLite files under `data_root` (or `path`)
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            _ => Err(OrchestratorError::config(format!(
                "Unknown store backend '{}'. Valid backends: memory, sqlite",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file; defaults to `<data_root>/state.db`
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            program: "CodeChecker".to_string(),
            args: vec!["check".to_string()],
            timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub workspace_root: PathBuf,
    pub data_root: PathBuf,
    pub store: StoreConfig,
    pub worker_slots: usize,
    pub lease_secs: u64,
    pub poll_interval_ms: u64,
    /// Deliveries of a part before a retryable failure is final
    pub max_attempts: u32,
    /// First retry delay, doubled per further attempt
    pub retry_backoff_ms: u64,
    pub max_frame_bytes: usize,
    pub analyzer: AnalyzerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9090".to_string(),
            workspace_root: PathBuf::from("workspace"),
            data_root: PathBuf::from("data"),
            store: StoreConfig::default(),
            worker_slots: num_cpus::get(),
            lease_secs: 600,
            poll_interval_ms: 500,
            max_attempts: 5,
            retry_backoff_ms: 1000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            analyzer: AnalyzerConfig::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| OrchestratorError::config(format!("{}{}={:?}: {}", ENV_PREFIX, name, raw, e)))
}

impl ServerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(OrchestratorError::config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply `REMOTE_ANALYZE_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(std::env::vars())
    }

    /// Apply `REMOTE_ANALYZE_*` overrides from `vars`; other names are ignored
    pub fn apply_env_from<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "BIND" => self.bind = value,
                "WORKSPACE_ROOT" => self.workspace_root = PathBuf::from(value),
                "DATA_ROOT" => self.data_root = PathBuf::from(value),
                "STORE" => self.store.backend = value.parse()?,
                "STORE_PATH" => self.store.path = Some(PathBuf::from(value)),
                "WORKER_SLOTS" => self.worker_slots = parse_env(name, &value)?,
                "LEASE_SECS" => self.lease_secs = parse_env(name, &value)?,
                "POLL_INTERVAL_MS" => self.poll_interval_ms = parse_env(name, &value)?,
                "MAX_ATTEMPTS" => self.max_attempts = parse_env(name, &value)?,
                "RETRY_BACKOFF_MS" => self.retry_backoff_ms = parse_env(name, &value)?,
                "MAX_FRAME_BYTES" => self.max_frame_bytes = parse_env(name, &value)?,
                "ANALYZER" => self.analyzer.program = value,
                "ANALYZER_TIMEOUT_SECS" => self.analyzer.timeout_secs = parse_env(name, &value)?,
                // Client-side settings share the prefix
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(OrchestratorError::config("bind address must not be empty"));
        }
        if self.worker_slots == 0 {
            return Err(OrchestratorError::config("worker_slots must be at least 1"));
        }
        if self.lease_secs == 0 {
            return Err(OrchestratorError::config("lease_secs must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(OrchestratorError::config("max_attempts must be at least 1"));
        }
        if self.max_frame_bytes < MIN_FRAME_BYTES || self.max_frame_bytes > u32::MAX as usize {
            return Err(OrchestratorError::config(format!(
                "max_frame_bytes must be in {}..={}",
                MIN_FRAME_BYTES,
                u32::MAX
            )));
        }
        if self.analyzer.program.trim().is_empty() {
            return Err(OrchestratorError::config("analyzer.program must not be empty"));
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_root.join("state.db"))
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(&self.workspace_root)
    }

    pub fn blob_store(&self) -> BlobStore {
        BlobStore::new(self.data_root.join("blobs"))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            lease: Duration::from_secs(self.lease_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn analyzer(&self) -> CommandAnalyzer {
        CommandAnalyzer::new(
            self.analyzer.program.clone(),
            self.analyzer.args.clone(),
            Duration::from_secs(self.analyzer.timeout_secs),
        )
    }

    /// Open the key/value store and work queue for the configured backend
    pub fn open_backends(&self) -> Result<(Arc<dyn KeyValueStore>, Arc<dyn WorkQueue>)> {
        match self.store.backend {
            StoreBackend::Memory => Ok((
                Arc::new(MemoryKvStore::new()),
                Arc::new(MemoryWorkQueue::new()),
            )),
            StoreBackend::Sqlite => {
                let path = self.store_path();
                Ok((
                    Arc::new(SqliteKvStore::open(&path)?),
                    Arc::new(SqliteWorkQueue::open(&path)?),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store_path(), PathBuf::from("data/state.db"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ServerConfig::from_yaml_str(
            "bind: 127.0.0.1:7000\nstore:\n  backend: memory\nanalyzer:\n  program: clang-tidy\n",
        )
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1:7000");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.analyzer.program, "clang-tidy");
        assert_eq!(config.analyzer.args, vec!["check".to_string()]);
        assert_eq!(config.lease_secs, 600);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ServerConfig::from_yaml_str("bindd: 127.0.0.1:7000\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env_from(vec![
                ("REMOTE_ANALYZE_WORKER_SLOTS".to_string(), "3".to_string()),
                ("REMOTE_ANALYZE_STORE".to_string(), "memory".to_string()),
                ("REMOTE_ANALYZE_MAX_ATTEMPTS".to_string(), "2".to_string()),
                ("REMOTE_ANALYZE_RETRY_BACKOFF_MS".to_string(), "250".to_string()),
                ("REMOTE_ANALYZE_SERVER".to_string(), "ignored:1".to_string()),
                ("PATH".to_string(), "/bin".to_string()),
            ])
            .unwrap();

        assert_eq!(config.worker_slots, 3);
        assert_eq!(config.store.backend, StoreBackend::Memory);

        let workers = config.worker_config();
        assert_eq!(workers.max_attempts, 2);
        assert_eq!(workers.retry_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_from(vec![(
                "REMOTE_ANALYZE_LEASE_SECS".to_string(),
                "soon".to_string(),
            )])
            .unwrap_err();
        assert!(err.to_string().contains("REMOTE_ANALYZE_LEASE_SECS"));
    }

    #[test]
    fn test_validate_rejects_zero_slots() {
        let config = ServerConfig {
            worker_slots: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_attempts: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_open_sqlite_backends() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            data_root: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };

        let (store, queue) = config.open_backends().unwrap();
        assert_eq!(store.increment("n", 1).await.unwrap(), 1);
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert!(dir.path().join("state.db").exists());
    }
}
