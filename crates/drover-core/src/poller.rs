//! Task discovery and leasing.
//!
//! The poller lists each cached project's `todo` issues carrying the agent
//! label, filters out issues it has already claimed, and leases chosen
//! issues by transitioning them to `in_progress` in the tracker. The
//! in-memory claimed set is the authoritative lease while an issue is
//! queued or active; the tracker state also changes, but its visibility
//! may lag.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use drover_tracker::TrackerApi;
use drover_tracker::models::IssuePatch;

use crate::model::Task;
use crate::project::ProjectCache;

/// Polls the tracker for work and manages the claimed-issue lease set.
pub struct TaskPoller {
    tracker: Arc<dyn TrackerApi>,
    cache: Arc<ProjectCache>,
    claimed: Mutex<HashSet<String>>,
}

impl TaskPoller {
    pub fn new(tracker: Arc<dyn TrackerApi>, cache: Arc<ProjectCache>) -> Self {
        Self {
            tracker,
            cache,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Discover up to `max_tasks` claimable tasks across all projects, in
    /// project configuration order, first-come.
    ///
    /// The server-side state filter is treated as a hint: every returned
    /// issue is re-verified locally to be in the `todo` state and to carry
    /// the agent label. Errors from one project are logged and swallowed so
    /// the others still poll.
    pub async fn poll_for_tasks(&self, max_tasks: usize) -> Vec<Task> {
        let mut tasks = Vec::new();

        for entry in self.cache.entries() {
            if tasks.len() >= max_tasks {
                break;
            }

            let issues = match self
                .tracker
                .list_issues(&entry.project.id, Some(&entry.todo_state_id))
                .await
            {
                Ok(issues) => issues,
                Err(e) => {
                    warn!(
                        project = %entry.project.identifier,
                        error = %e,
                        "failed to list issues, skipping project this cycle"
                    );
                    continue;
                }
            };

            for issue in issues {
                if tasks.len() >= max_tasks {
                    break;
                }
                if issue.state != entry.todo_state_id {
                    continue;
                }
                if !issue.labels.iter().any(|l| l == &entry.agent_label_id) {
                    continue;
                }
                if self.is_claimed(&issue.id) {
                    debug!(issue = %issue.id, "already claimed, skipping");
                    continue;
                }

                tasks.push(Task {
                    issue_id: issue.id,
                    project_id: entry.project.id.clone(),
                    project_identifier: entry.project.identifier.to_uppercase(),
                    sequence_id: issue.sequence_id,
                    title: issue.name,
                    description_html: issue.description_html.unwrap_or_default(),
                    state_id: entry.todo_state_id.clone(),
                    label_ids: issue.labels,
                });
            }
        }

        tasks
    }

    /// Lease a task: transition it to `in_progress` in the tracker and add
    /// it to the claimed set. Returns `false` (and claims nothing) when the
    /// tracker update fails.
    pub async fn claim_task(&self, task: &Task) -> bool {
        let Some(entry) = self.cache.get(&task.project_identifier) else {
            warn!(task = %task.slug(), "no cached project for task, cannot claim");
            return false;
        };

        let patch = IssuePatch::state(entry.in_progress_state_id.clone());
        match self
            .tracker
            .update_issue(&task.project_id, &task.issue_id, &patch)
            .await
        {
            Ok(()) => {
                self.claimed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(task.issue_id.clone());
                info!(task = %task.slug(), "claimed");
                true
            }
            Err(e) => {
                warn!(task = %task.slug(), error = %e, "failed to claim");
                false
            }
        }
    }

    /// Release a lease. Idempotent.
    pub fn release_task(&self, issue_id: &str) {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(issue_id);
    }

    pub fn is_claimed(&self, issue_id: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(issue_id)
    }

    /// Number of currently held leases.
    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
