//! Shared domain records: the scheduling task, agent phases, and the active
//! agent entry carried through spawn, completion, and persistence.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A unit of work pulled from the tracker. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Opaque tracker issue id.
    pub issue_id: String,
    pub project_id: String,
    /// Per-project prefix, upper-cased (e.g. `HQ`).
    pub project_identifier: String,
    pub sequence_id: u64,
    pub title: String,
    #[serde(default)]
    pub description_html: String,
    /// The workflow state the issue was in when discovered (its `todo`
    /// state). Used to reset the issue when a lease is abandoned.
    pub state_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

impl Task {
    /// Human-readable slug: `<PROJECT>-<seq>`, e.g. `HQ-42`.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.project_identifier, self.sequence_id)
    }
}

/// Which half of the two-phase lifecycle an agent run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Implementation,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planning => write!(f, "planning"),
            Phase::Implementation => write!(f, "implementation"),
        }
    }
}

/// Lifecycle status of an active agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    /// The agent asked a question and is waiting on a human.
    Blocked,
    Completed,
    Errored,
}

/// An agent currently (or, in a persisted snapshot, formerly) driving a task.
///
/// Owned exclusively by the agent manager for the task's issue id; created
/// on spawn and removed on terminal completion or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAgent {
    pub task: Task,
    pub phase: Phase,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub branch_name: Option<String>,
    /// Epoch milliseconds.
    pub started_at: i64,
    pub status: AgentStatus,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub alerted_stale: bool,
    #[serde(default)]
    pub retry_count: u32,
}

/// Classified non-success outcome of an agent run.
///
/// A crash (the runner returning `Err`) is deliberately not a variant here:
/// it carries an arbitrary error and is handled on the `Result` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorType {
    RateLimited,
    BudgetExceeded,
    MaxTurns,
    Unknown,
}

impl AgentErrorType {
    /// Whether the manager should schedule a backoff retry for this outcome.
    pub fn is_retryable(self) -> bool {
        matches!(self, AgentErrorType::RateLimited | AgentErrorType::Unknown)
    }
}

impl std::fmt::Display for AgentErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentErrorType::RateLimited => write!(f, "rate_limited"),
            AgentErrorType::BudgetExceeded => write!(f, "budget_exceeded"),
            AgentErrorType::MaxTurns => write!(f, "max_turns"),
            AgentErrorType::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_task(issue_id: &str, seq: u64) -> Task {
        Task {
            issue_id: issue_id.to_string(),
            project_id: "p-1".to_string(),
            project_identifier: "HQ".to_string(),
            sequence_id: seq,
            title: format!("Task {seq}"),
            description_html: "<p>do the thing</p>".to_string(),
            state_id: "s-todo".to_string(),
            label_ids: vec!["l-agent".to_string()],
        }
    }

    #[test]
    fn slug_joins_identifier_and_sequence() {
        assert_eq!(test_task("i-1", 42).slug(), "HQ-42");
    }

    #[test]
    fn retryable_error_types() {
        assert!(AgentErrorType::RateLimited.is_retryable());
        assert!(AgentErrorType::Unknown.is_retryable());
        assert!(!AgentErrorType::BudgetExceeded.is_retryable());
        assert!(!AgentErrorType::MaxTurns.is_retryable());
    }

    #[test]
    fn active_agent_round_trips_as_camel_case_json() {
        let agent = ActiveAgent {
            task: test_task("i-1", 7),
            phase: Phase::Implementation,
            worktree_path: Some(PathBuf::from("/repo/.worktrees/agent-HQ-7")),
            branch_name: Some("agent/HQ-7".to_string()),
            started_at: 1_000,
            status: AgentStatus::Running,
            cost_usd: Some(0.25),
            alerted_stale: false,
            retry_count: 1,
        };

        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["phase"], "implementation");
        assert_eq!(json["status"], "running");
        assert!(json["worktreePath"].is_string());
        assert_eq!(json["retryCount"], 1);

        let back: ActiveAgent = serde_json::from_value(json).unwrap();
        assert_eq!(back, agent);
    }
}
