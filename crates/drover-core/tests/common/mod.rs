//! Shared test doubles: an in-memory tracker, a recording notifier, and a
//! scriptable agent driver, plus harness wiring for the scheduler tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use drover_core::clock::ManualClock;
use drover_core::config::{AgentConfig, Config, PlaneConfig, ProjectConfig};
use drover_core::driver::{
    AgentDriver, AgentInvocation, AgentMessage, AgentMessageStream, AgentResult,
};
use drover_core::manager::{AgentManager, ManagerDeps};
use drover_core::model::Task;
use drover_core::notify::Notifier;
use drover_core::poller::TaskPoller;
use drover_core::project::{ProjectCache, ProjectEntry};
use drover_core::state::StateStore;
use drover_core::worktree::WorktreeManager;
use drover_tracker::models::{
    Issue, IssueComment, IssuePatch, Label, Project, StateGroup, WorkflowState,
};
use drover_tracker::{TrackerApi, TrackerError};

// ---------------------------------------------------------------------------
// Fake tracker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTracker {
    pub projects: Vec<Project>,
    pub labels: HashMap<String, Vec<Label>>,
    pub states: HashMap<String, Vec<WorkflowState>>,
    pub issues: Mutex<HashMap<String, Vec<Issue>>>,
    pub comments: Mutex<HashMap<String, Vec<IssueComment>>>,
    /// Every PATCH received, as `(issue_id, patch)`.
    pub patches: Mutex<Vec<(String, IssuePatch)>>,
    /// Every link created, as `(issue_id, title, url)`.
    pub links: Mutex<Vec<(String, String, String)>>,
    /// When set, `update_issue` fails (used to make claims fail).
    pub fail_updates: AtomicBool,
    /// Project ids whose `list_issues` calls fail.
    pub fail_issue_lists: Mutex<Vec<String>>,
}

impl FakeTracker {
    pub fn seed_comment(&self, issue_id: &str, html: &str) {
        let mut comments = self.comments.lock().unwrap();
        let list = comments.entry(issue_id.to_string()).or_default();
        list.push(IssueComment {
            id: format!("c-{}", list.len() + 1),
            comment_html: html.to_string(),
        });
    }

    pub fn comments_for(&self, issue_id: &str) -> Vec<IssueComment> {
        self.comments
            .lock()
            .unwrap()
            .get(issue_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn patches_for(&self, issue_id: &str) -> Vec<IssuePatch> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == issue_id)
            .map(|(_, patch)| patch.clone())
            .collect()
    }

    fn injected_error(&self) -> TrackerError {
        TrackerError::Api {
            status: 500,
            url: "fake://tracker".to_string(),
            body: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl TrackerApi for FakeTracker {
    async fn list_projects(&self) -> Result<Vec<Project>, TrackerError> {
        Ok(self.projects.clone())
    }

    async fn list_states(&self, project_id: &str) -> Result<Vec<WorkflowState>, TrackerError> {
        Ok(self.states.get(project_id).cloned().unwrap_or_default())
    }

    async fn list_labels(&self, project_id: &str) -> Result<Vec<Label>, TrackerError> {
        Ok(self.labels.get(project_id).cloned().unwrap_or_default())
    }

    async fn list_issues(
        &self,
        project_id: &str,
        state_id: Option<&str>,
    ) -> Result<Vec<Issue>, TrackerError> {
        if self
            .fail_issue_lists
            .lock()
            .unwrap()
            .iter()
            .any(|p| p == project_id)
        {
            return Err(self.injected_error());
        }
        let issues = self.issues.lock().unwrap();
        let all = issues.get(project_id).cloned().unwrap_or_default();
        Ok(match state_id {
            Some(state_id) => all.into_iter().filter(|i| i.state == state_id).collect(),
            None => all,
        })
    }

    async fn get_issue(&self, project_id: &str, issue_id: &str) -> Result<Issue, TrackerError> {
        self.issues
            .lock()
            .unwrap()
            .get(project_id)
            .and_then(|issues| issues.iter().find(|i| i.id == issue_id).cloned())
            .ok_or_else(|| self.injected_error())
    }

    async fn update_issue(
        &self,
        project_id: &str,
        issue_id: &str,
        patch: &IssuePatch,
    ) -> Result<(), TrackerError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(self.injected_error());
        }
        self.patches
            .lock()
            .unwrap()
            .push((issue_id.to_string(), patch.clone()));
        if let Some(new_state) = &patch.state {
            let mut issues = self.issues.lock().unwrap();
            if let Some(list) = issues.get_mut(project_id) {
                if let Some(issue) = list.iter_mut().find(|i| i.id == issue_id) {
                    issue.state = new_state.clone();
                }
            }
        }
        Ok(())
    }

    async fn list_comments(
        &self,
        _project_id: &str,
        issue_id: &str,
    ) -> Result<Vec<IssueComment>, TrackerError> {
        Ok(self.comments_for(issue_id))
    }

    async fn create_comment(
        &self,
        _project_id: &str,
        issue_id: &str,
        comment_html: &str,
    ) -> Result<(), TrackerError> {
        self.seed_comment(issue_id, comment_html);
        Ok(())
    }

    async fn create_link(
        &self,
        _project_id: &str,
        issue_id: &str,
        title: &str,
        url: &str,
    ) -> Result<(), TrackerError> {
        self.links.lock().unwrap().push((
            issue_id.to_string(),
            title.to_string(),
            url.to_string(),
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeNotifier {
    pub messages: Mutex<Vec<String>>,
}

impl FakeNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages()
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send_message(&self, text: &str, _reply_to: Option<&str>) -> Option<String> {
        let mut messages = self.messages.lock().unwrap();
        messages.push(text.to_string());
        Some(format!("m-{}", messages.len()))
    }
}

// ---------------------------------------------------------------------------
// Scriptable driver
// ---------------------------------------------------------------------------

/// What the next agent run should do.
pub enum ScriptedRun {
    /// Yield this result message, then end.
    Finish(AgentResult),
    /// Break the stream with a transport error.
    Crash(String),
    /// End the stream without a result message (process died).
    Die,
    /// Never yield anything (a long-running agent).
    Hang,
}

#[derive(Default)]
pub struct FakeDriver {
    script: Mutex<VecDeque<ScriptedRun>>,
    pub invocations: Mutex<Vec<AgentInvocation>>,
}

impl FakeDriver {
    pub fn push(&self, run: ScriptedRun) {
        self.script.lock().unwrap().push_back(run);
    }

    pub fn success(cost: f64) -> AgentResult {
        AgentResult {
            subtype: "success".to_string(),
            errors: vec![],
            total_cost_usd: Some(cost),
            text: Some("done".to_string()),
        }
    }

    pub fn failure(subtype: &str, errors: &[&str], cost: f64) -> AgentResult {
        AgentResult {
            subtype: subtype.to_string(),
            errors: errors.iter().map(|e| e.to_string()).collect(),
            total_cost_usd: Some(cost),
            text: None,
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self, invocation: &AgentInvocation) -> anyhow::Result<AgentMessageStream> {
        self.invocations.lock().unwrap().push(invocation.clone());

        let run = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedRun::Finish(Self::success(0.0)));

        Ok(match run {
            ScriptedRun::Finish(result) => Box::pin(futures::stream::iter(vec![Ok(
                AgentMessage::Result(result),
            )])),
            ScriptedRun::Crash(message) => Box::pin(futures::stream::iter(vec![Err(
                anyhow::anyhow!(message),
            )])),
            ScriptedRun::Die => Box::pin(futures::stream::empty()),
            ScriptedRun::Hang => Box::pin(futures::stream::pending()),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness wiring
// ---------------------------------------------------------------------------

pub const PROJECT_ID: &str = "p-1";
pub const TODO_STATE: &str = "s-todo";
pub const IN_PROGRESS_STATE: &str = "s-prog";
pub const AGENT_LABEL: &str = "l-agent";

pub fn project_entry() -> ProjectEntry {
    ProjectEntry {
        project: Project {
            id: PROJECT_ID.to_string(),
            name: "Headquarters".to_string(),
            identifier: "HQ".to_string(),
        },
        agent_label_id: AGENT_LABEL.to_string(),
        todo_state_id: TODO_STATE.to_string(),
        in_progress_state_id: IN_PROGRESS_STATE.to_string(),
        plan_review_state_id: None,
        in_review_state_id: Some("s-review".to_string()),
        done_state_id: Some("s-done".to_string()),
    }
}

pub fn task(issue_id: &str, seq: u64) -> Task {
    Task {
        issue_id: issue_id.to_string(),
        project_id: PROJECT_ID.to_string(),
        project_identifier: "HQ".to_string(),
        sequence_id: seq,
        title: format!("Task {seq}"),
        description_html: "<p>do the thing</p>".to_string(),
        state_id: TODO_STATE.to_string(),
        label_ids: vec![AGENT_LABEL.to_string()],
    }
}

pub fn issue(issue_id: &str, seq: u64, state: &str, labels: &[&str]) -> Issue {
    Issue {
        id: issue_id.to_string(),
        name: format!("Task {seq}"),
        sequence_id: seq,
        state: state.to_string(),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        description_html: Some("<p>do the thing</p>".to_string()),
    }
}

pub fn todo_states() -> Vec<WorkflowState> {
    vec![
        WorkflowState {
            id: TODO_STATE.to_string(),
            name: "Todo".to_string(),
            group: StateGroup::Unstarted,
        },
        WorkflowState {
            id: IN_PROGRESS_STATE.to_string(),
            name: "In Progress".to_string(),
            group: StateGroup::Started,
        },
    ]
}

/// Fully wired scheduler over fakes. `repo_path` defaults to an empty temp
/// directory; point it at a real git repo for implementation-phase tests.
pub struct Harness {
    pub manager: AgentManager,
    pub tracker: Arc<FakeTracker>,
    pub notifier: Arc<FakeNotifier>,
    pub driver: Arc<FakeDriver>,
    pub clock: Arc<ManualClock>,
    pub poller: Arc<TaskPoller>,
    pub cache: Arc<ProjectCache>,
    pub worktrees: Arc<WorktreeManager>,
    pub store: StateStore,
    pub config: Arc<Config>,
    pub tmp: tempfile::TempDir,
}

/// Epoch ms for 2024-03-01T12:00:00Z; far enough from a UTC midnight that
/// small advances do not roll the budget date by accident.
pub const BASE_MS: i64 = 1_709_294_400_000;

pub struct HarnessOptions {
    pub agent: AgentConfig,
    pub repo_path: Option<std::path::PathBuf>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            agent: AgentConfig {
                max_concurrent: 2,
                max_budget_per_task: 5.0,
                max_daily_budget: 20.0,
                max_turns: 20,
                poll_interval_ms: 30_000,
                spawn_delay_ms: 15_000,
                max_retries: 2,
                retry_base_delay_ms: 60_000,
                label_name: "agent".to_string(),
            },
            repo_path: None,
        }
    }
}

pub fn harness(options: HarnessOptions) -> Harness {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let repo_path = options
        .repo_path
        .unwrap_or_else(|| tmp.path().join("repo"));
    std::fs::create_dir_all(&repo_path).ok();

    let config = Arc::new(Config {
        plane: PlaneConfig {
            base_url: "https://plane.test".to_string(),
            workspace_slug: "acme".to_string(),
        },
        projects: [(
            "HQ".to_string(),
            ProjectConfig {
                repo_path,
                repo_url: "https://github.com/acme/hq".to_string(),
                default_branch: "main".to_string(),
                ci_checks: vec![],
            },
        )]
        .into_iter()
        .collect(),
        agent: options.agent,
    });

    let tracker = Arc::new(FakeTracker::default());
    let notifier = Arc::new(FakeNotifier::default());
    let driver = Arc::new(FakeDriver::default());
    let clock = Arc::new(ManualClock::at(BASE_MS));
    let cache = Arc::new(ProjectCache::from_entries(vec![project_entry()]));
    let poller = Arc::new(TaskPoller::new(tracker.clone(), cache.clone()));
    let worktrees = Arc::new(WorktreeManager::new());
    let store = StateStore::new(tmp.path().join("state").join("runner-state.json"));

    let manager = AgentManager::new(ManagerDeps {
        tracker: tracker.clone(),
        notifier: notifier.clone(),
        driver: driver.clone(),
        worktrees: worktrees.clone(),
        poller: poller.clone(),
        cache: cache.clone(),
        store: store.clone(),
        clock: clock.clone(),
        config: config.clone(),
    });

    Harness {
        manager,
        tracker,
        notifier,
        driver,
        clock,
        poller,
        cache,
        worktrees,
        store,
        config,
        tmp,
    }
}

/// Poll an async condition until it holds, failing after two seconds.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Build a git repo with a pushed `main` on a local bare origin; returns
/// the clone path (the TempDir must stay alive in the caller).
pub fn git_repo_with_origin(base: &std::path::Path) -> std::path::PathBuf {
    let origin = base.join("origin.git");
    let repo = base.join("repo");

    let run = |cwd: &std::path::Path, args: &[&str]| {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    std::fs::create_dir_all(&origin).unwrap();
    run(&origin, &["init", "--bare"]);

    std::fs::create_dir_all(&repo).unwrap();
    run(&repo, &["init", "-b", "main"]);
    run(&repo, &["config", "user.email", "test@drover.dev"]);
    run(&repo, &["config", "user.name", "Drover Test"]);
    std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
    run(&repo, &["add", "."]);
    run(&repo, &["commit", "-m", "Initial commit"]);
    run(
        &repo,
        &["remote", "add", "origin", origin.to_string_lossy().as_ref()],
    );
    run(&repo, &["push", "-u", "origin", "main"]);

    repo
}
