//! Orchestrator configuration.
//!
//! Loaded once at startup from a TOML file with camelCase keys. Every
//! `[agent]` knob has a default so a minimal config only names the tracker
//! workspace and at least one project.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub plane: PlaneConfig,
    /// Keyed by project identifier (e.g. `HQ`). Matching is
    /// case-insensitive; keys are upper-cased on load.
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Tracker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaneConfig {
    pub base_url: String,
    pub workspace_slug: String,
}

/// Per-project repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Local checkout the agents work against.
    pub repo_path: PathBuf,
    /// Remote URL, used in prompts so agents open pull requests against
    /// the right repository.
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// CI checks the implementation agent is told to wait for.
    #[serde(default)]
    pub ci_checks: Vec<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Scheduler and budget knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub max_concurrent: usize,
    pub max_budget_per_task: f64,
    pub max_daily_budget: f64,
    pub max_turns: u32,
    pub poll_interval_ms: u64,
    pub spawn_delay_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub label_name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_budget_per_task: 5.0,
            max_daily_budget: 20.0,
            max_turns: 200,
            poll_interval_ms: 30_000,
            spawn_delay_ms: 15_000,
            max_retries: 2,
            retry_base_delay_ms: 60_000,
            label_name: "agent".to_string(),
        }
    }
}

impl Config {
    /// Read and parse a config file, upper-casing project keys.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;

        config.projects = config
            .projects
            .into_iter()
            .map(|(key, value)| (key.to_uppercase(), value))
            .collect();

        Ok(config)
    }

    /// Look up a project by identifier, case-insensitively.
    pub fn project(&self, identifier: &str) -> Option<&ProjectConfig> {
        self.projects.get(&identifier.to_uppercase())
    }
}
