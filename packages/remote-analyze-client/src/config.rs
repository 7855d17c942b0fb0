//! Client configuration: defaults, then `REMOTE_ANALYZE_*` variables, then flags

use remote_analyze_orchestration::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;

use crate::collector::CommandCollector;
use crate::error::{ClientError, ClientResult};

const ENV_PREFIX: &str = "REMOTE_ANALYZE_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `host:port` of the server
    pub server: String,
    pub collector_program: String,
    pub collector_args: Vec<String>,
    pub poll_interval_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9090".to_string(),
            collector_program: "tu_collector".to_string(),
            collector_args: Vec::new(),
            poll_interval_ms: 1000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> ClientResult<Self> {
        let mut config = Self::default();
        config.apply_env_from(std::env::vars())?;
        Ok(config)
    }

    /// Apply `REMOTE_ANALYZE_*` overrides from `vars`; server-side names are ignored
    pub fn apply_env_from<I>(&mut self, vars: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "SERVER" => self.server = value,
                "COLLECTOR" => self.collector_program = value,
                "POLL_INTERVAL_MS" => {
                    self.poll_interval_ms = value.parse().map_err(|e| {
                        ClientError::config(format!("{}{}={:?}: {}", ENV_PREFIX, name, value, e))
                    })?
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn collector(&self) -> CommandCollector {
        CommandCollector::new(self.collector_program.clone(), self.collector_args.clone())
    }
}
