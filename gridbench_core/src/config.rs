//! File based configuration.
//!
//! Every section is optional; missing keys take the section's defaults.
//!
//! ```toml
//! [transport]
//! max_reconnect_attempts = 5
//!
//! [coordinator]
//! run_duration_ms = 30000
//! output_dir = "results"
//!
//! [agent]
//! monitor_interval_ms = 250
//! ```

use crate::agent_runtime::AgentConfig;
use crate::coordinator::CoordinatorConfig;
use crate::streamer::StreamerConfig;
use crate::worker_runtime::WorkerConfig;
use gridbench_env::TransportConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Parse(String),
}

/// All tunables of a deployment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub transport: TransportConfig,
    pub coordinator: CoordinatorConfig,
    pub agent: AgentConfig,
    pub worker: WorkerConfig,
    pub streamer: StreamerConfig,
}

impl GridConfig {
    /// Loads a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = GridConfig::from_toml_str("").unwrap();
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.coordinator.phase_timeout(), Duration::from_secs(300));
        assert_eq!(config.coordinator.run_duration(), Duration::from_secs(60));
        assert_eq!(config.worker.performance_interval(), Duration::from_secs(1));
        assert_eq!(config.agent.forward_timeout(), Duration::from_secs(30));
        assert_eq!(config.streamer.concurrency, 1000);
        assert_eq!(config.streamer.await_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = GridConfig::from_toml_str(
            r#"
            [coordinator]
            run_duration_ms = 2500
            output_dir = "out"

            [streamer]
            concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.coordinator.run_duration(), Duration::from_millis(2500));
        assert_eq!(config.coordinator.phase_timeout_ms, 300_000);
        assert_eq!(config.coordinator.output_dir, Some(PathBuf::from("out")));
        assert_eq!(config.streamer.concurrency, 8);
        assert_eq!(config.streamer.await_timeout_ms, 120_000);
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let err = GridConfig::from_toml_str("[coordinator]\nrun_duration_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nresponse_timeout_ms = 1500").unwrap();
        let config = GridConfig::load(file.path()).unwrap();
        assert_eq!(config.transport.response_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_missing_file() {
        let err = GridConfig::load(Path::new("/nonexistent/gridbench.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
