//! Environment configuration

use crate::fault::TraceConvention;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings for one hosted environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Name of the engine thread spawned by `Environment::spawn`.
    pub thread_name: String,
    /// Initial capacity of the dispatcher's writer and reader queues.
    pub queue_capacity: usize,
    /// Keep the engine's call stack on engine faults.
    pub capture_engine_stacks: bool,
    /// Syntax used when rendering merged traces for this environment.
    pub trace_convention: TraceConvention,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            thread_name: "tether-engine".to_string(),
            queue_capacity: 64,
            capture_engine_stacks: true,
            trace_convention: TraceConvention::Native,
        }
    }
}

impl EnvConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            EnvConfig::from_json_str(r#"{ "thread_name": "js", "trace_convention": "engine" }"#)
                .unwrap();
        assert_eq!(config.thread_name, "js");
        assert_eq!(config.trace_convention, TraceConvention::Engine);
        assert_eq!(config.queue_capacity, EnvConfig::default().queue_capacity);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = EnvConfig::load("/nonexistent/tether.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tether.json"));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(matches!(
            EnvConfig::from_json_str("{ queue_capacity: }"),
            Err(ConfigError::Parse(_))
        ));
    }
}
