//! Crash-recovery state persistence.
//!
//! A single pretty-printed JSON document holding the active-agent snapshot,
//! the daily-spend counter, and the queued tasks. Written synchronously via
//! a temp-file-and-rename swap so a crash mid-write cannot corrupt the
//! previous snapshot. The manager is the only writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::ActiveAgent;
use crate::queue::QueueEntry;

/// Errors writing the state file. Reads never fail: a missing or corrupt
/// file resets to defaults.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize runner state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerState {
    pub active_agents: HashMap<String, ActiveAgent>,
    pub daily_spend_usd: f64,
    /// UTC date (`YYYY-MM-DD`) the spend counter belongs to.
    pub daily_spend_date: String,
    pub queued_tasks: Vec<QueueEntry>,
}

/// Reads and writes the state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve the state path: `$STATE_PATH`, or
    /// `<cwd>/state/runner-state.json`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("STATE_PATH") {
            return PathBuf::from(path);
        }
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("state")
            .join("runner-state.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. A missing file yields defaults silently; a
    /// corrupt file yields defaults with one warning.
    pub fn load(&self) -> RunnerState {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return RunnerState::default(),
        };
        match serde_json::from_str(&contents) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "state file is corrupt, resetting to defaults"
                );
                RunnerState::default()
            }
        }
    }

    /// Persist the state: create the parent directory if missing, write a
    /// temp file, then rename it over the target.
    pub fn save(&self, state: &RunnerState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let contents = serde_json::to_string_pretty(state)?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents).map_err(|source| StateError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;

        Ok(())
    }
}
