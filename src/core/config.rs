//! Engine configuration: state location, concurrency bound, journal toggle.
//!
//! Passed explicitly to the state store and scheduler; there is no
//! process-wide home directory.

use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// File name of the persisted graph inside the state directory.
pub const STATE_FILE: &str = "state.json";

/// File name of the run journal inside the state directory.
pub const JOURNAL_FILE: &str = "events.jsonl";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the state file and run journal
    pub state_dir: PathBuf,

    /// Maximum provider calls in flight at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Append run events to the JSONL journal
    #[serde(default = "default_true")]
    pub journal: bool,
}

fn default_max_in_flight() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            max_in_flight: default_max_in_flight(),
            journal: true,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_journal(mut self, journal: bool) -> Self {
        self.journal = journal;
        self
    }

    /// Parse a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "state_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn journal_file(&self) -> PathBuf {
        self.state_dir.join(JOURNAL_FILE)
    }
}
