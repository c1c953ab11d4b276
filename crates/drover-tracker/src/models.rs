//! Wire types for the tracker API.
//!
//! Only the fields the orchestrator actually consumes are deserialized;
//! unknown fields are ignored so tracker-side additions do not break us.

use serde::{Deserialize, Serialize};

/// A project in the tracker workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Short per-project prefix used in issue slugs (e.g. `HQ` in `HQ-42`).
    pub identifier: String,
}

/// Workflow state group, as classified by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateGroup {
    Backlog,
    Unstarted,
    Started,
    Completed,
    Cancelled,
    Triage,
    /// Forward compatibility: groups this client does not know about.
    #[serde(other)]
    Unknown,
}

/// A workflow state within a project (e.g. "Todo", "In Progress").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub name: String,
    pub group: StateGroup,
}

/// An issue label within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

/// An issue as returned by the tracker's list/get endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    /// Issue title. The tracker calls this field `name`.
    pub name: String,
    pub sequence_id: u64,
    /// Current workflow state id.
    pub state: String,
    /// Label ids attached to this issue.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub description_html: Option<String>,
}

/// A comment on an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: String,
    #[serde(default)]
    pub comment_html: String,
}

/// Partial issue update. `None` fields are omitted from the PATCH body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IssuePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

impl IssuePatch {
    /// Patch that moves an issue to the given workflow state.
    pub fn state(state_id: impl Into<String>) -> Self {
        Self {
            state: Some(state_id.into()),
            labels: None,
        }
    }
}

/// List responses arrive either as a bare array or wrapped in a paginated
/// envelope with a `results` field, depending on the endpoint.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ListResponse<T> {
    Paginated { results: Vec<T> },
    Bare(Vec<T>),
}

impl<T> ListResponse<T> {
    pub(crate) fn into_items(self) -> Vec<T> {
        match self {
            ListResponse::Paginated { results } => results,
            ListResponse::Bare(items) => items,
        }
    }
}
