//! Per-project resolution of the tracker ids the scheduler needs: the
//! agent label and the workflow states addressed by role (`todo`,
//! `in_progress`, and the optional review/done states).
//!
//! Resolution happens once at startup. A project that cannot be fully
//! resolved (missing project, label, or either required state) is skipped
//! with a warning and never polled.

use anyhow::{Context, Result};
use tracing::warn;

use drover_tracker::TrackerApi;
use drover_tracker::models::{Label, Project, StateGroup, WorkflowState};

use crate::config::Config;

/// Resolved ids for one configured project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEntry {
    pub project: Project,
    pub agent_label_id: String,
    pub todo_state_id: String,
    pub in_progress_state_id: String,
    pub plan_review_state_id: Option<String>,
    pub in_review_state_id: Option<String>,
    pub done_state_id: Option<String>,
}

/// The resolved projects, in configuration order.
#[derive(Debug, Default)]
pub struct ProjectCache {
    entries: Vec<ProjectEntry>,
}

impl ProjectCache {
    /// Resolve every configured project against the tracker.
    ///
    /// Failing to list the workspace's projects is fatal; any per-project
    /// problem (not found, missing label or required state, listing error)
    /// skips that project only.
    pub async fn initialize(tracker: &dyn TrackerApi, config: &Config) -> Result<Self> {
        let projects = tracker
            .list_projects()
            .await
            .context("failed to list tracker projects")?;

        let mut entries = Vec::new();

        for identifier in config.projects.keys() {
            let Some(project) = projects
                .iter()
                .find(|p| p.identifier.eq_ignore_ascii_case(identifier))
            else {
                warn!(project = %identifier, "project not found in tracker, skipping");
                continue;
            };

            let labels = match tracker.list_labels(&project.id).await {
                Ok(labels) => labels,
                Err(e) => {
                    warn!(project = %identifier, error = %e, "failed to list labels, skipping");
                    continue;
                }
            };
            let states = match tracker.list_states(&project.id).await {
                Ok(states) => states,
                Err(e) => {
                    warn!(project = %identifier, error = %e, "failed to list states, skipping");
                    continue;
                }
            };

            match resolve_entry(project.clone(), &labels, &states, &config.agent.label_name) {
                Some(entry) => entries.push(entry),
                None => {
                    warn!(
                        project = %identifier,
                        label = %config.agent.label_name,
                        "missing agent label or required workflow states, skipping"
                    );
                }
            }
        }

        Ok(Self { entries })
    }

    /// Look up a project by identifier, case-insensitively.
    pub fn get(&self, identifier: &str) -> Option<&ProjectEntry> {
        self.entries
            .iter()
            .find(|e| e.project.identifier.eq_ignore_ascii_case(identifier))
    }

    /// Resolved projects in configuration order.
    pub fn entries(&self) -> &[ProjectEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[doc(hidden)]
    pub fn from_entries(entries: Vec<ProjectEntry>) -> Self {
        Self { entries }
    }
}

/// Pure resolution of one project's ids. Returns `None` when the agent
/// label or a required state is missing.
fn resolve_entry(
    project: Project,
    labels: &[Label],
    states: &[WorkflowState],
    label_name: &str,
) -> Option<ProjectEntry> {
    let agent_label_id = labels
        .iter()
        .find(|l| l.name.eq_ignore_ascii_case(label_name))?
        .id
        .clone();

    let todo_state_id = find_state(states, StateGroup::Unstarted, None, None)?;
    let in_progress_state_id = find_state(states, StateGroup::Started, None, None)?;
    let plan_review_state_id = find_state(states, StateGroup::Started, Some("plan"), None);
    let in_review_state_id = find_state(states, StateGroup::Started, Some("review"), Some("plan"));
    let done_state_id = find_state(states, StateGroup::Completed, None, None);

    Some(ProjectEntry {
        project,
        agent_label_id,
        todo_state_id,
        in_progress_state_id,
        plan_review_state_id,
        in_review_state_id,
        done_state_id,
    })
}

/// First state in `group` whose name contains `contains` (if given) and
/// does not contain `excludes` (if given). Name matching is
/// case-insensitive.
fn find_state(
    states: &[WorkflowState],
    group: StateGroup,
    contains: Option<&str>,
    excludes: Option<&str>,
) -> Option<String> {
    states
        .iter()
        .filter(|s| s.group == group)
        .find(|s| {
            let name = s.name.to_lowercase();
            contains.is_none_or(|needle| name.contains(needle))
                && excludes.is_none_or(|needle| !name.contains(needle))
        })
        .map(|s| s.id.clone())
}
