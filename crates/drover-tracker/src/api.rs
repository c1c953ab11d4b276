//! The `TrackerApi` trait -- the tracker surface the orchestrator depends on.
//!
//! Object-safe so it can be injected as `Arc<dyn TrackerApi>` into the
//! poller, manager, and runner, and replaced with an in-memory fake in
//! tests.

use async_trait::async_trait;

use crate::TrackerError;
use crate::models::{Issue, IssueComment, IssuePatch, Label, Project, WorkflowState};

/// Everything the orchestrator needs from the tracker.
#[async_trait]
pub trait TrackerApi: Send + Sync {
    /// List all projects in the workspace.
    async fn list_projects(&self) -> Result<Vec<Project>, TrackerError>;

    /// List the workflow states of a project.
    async fn list_states(&self, project_id: &str) -> Result<Vec<WorkflowState>, TrackerError>;

    /// List the labels of a project.
    async fn list_labels(&self, project_id: &str) -> Result<Vec<Label>, TrackerError>;

    /// List open issues of a project, optionally filtered by state id.
    ///
    /// The server-side filter is a hint only; callers must re-verify the
    /// state of every returned issue.
    async fn list_issues(
        &self,
        project_id: &str,
        state_id: Option<&str>,
    ) -> Result<Vec<Issue>, TrackerError>;

    /// Fetch a single issue.
    async fn get_issue(&self, project_id: &str, issue_id: &str) -> Result<Issue, TrackerError>;

    /// Partially update an issue (state and/or labels).
    async fn update_issue(
        &self,
        project_id: &str,
        issue_id: &str,
        patch: &IssuePatch,
    ) -> Result<(), TrackerError>;

    /// List the comments on an issue, oldest first.
    async fn list_comments(
        &self,
        project_id: &str,
        issue_id: &str,
    ) -> Result<Vec<IssueComment>, TrackerError>;

    /// Post an HTML comment on an issue.
    async fn create_comment(
        &self,
        project_id: &str,
        issue_id: &str,
        comment_html: &str,
    ) -> Result<(), TrackerError>;

    /// Attach an external link (e.g. a pull request) to an issue.
    async fn create_link(
        &self,
        project_id: &str,
        issue_id: &str,
        title: &str,
        url: &str,
    ) -> Result<(), TrackerError>;
}

// Compile-time assertion: TrackerApi must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TrackerApi) {}
};
