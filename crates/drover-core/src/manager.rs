//! The agent manager: owns the active set and the ready queue, enforces
//! the daily budget, spawns runs, and routes every outcome to completion,
//! retry, or terminal failure.
//!
//! All shared scheduling state (queue, active agents, spend counters) lives
//! behind one async mutex so discovery, processing, and run completions
//! cannot interleave partial updates. Tracker and notifier calls are never
//! made while that mutex is held. The manager is also the single writer of
//! the persisted state file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use drover_tracker::TrackerApi;
use drover_tracker::models::IssuePatch;

use crate::clock::Clock;
use crate::config::Config;
use crate::driver::AgentDriver;
use crate::model::{ActiveAgent, AgentStatus, Phase, Task};
use crate::notify::Notifier;
use crate::phase::detect_phase;
use crate::poller::TaskPoller;
use crate::project::ProjectCache;
use crate::queue::{QueueEntry, ReadyQueue};
use crate::runner::{self, AgentRunOutcome, RunnerDeps, find_pr_url};
use crate::state::{RunnerState, StateStore};
use crate::worktree::WorktreeManager;

/// A running agent is considered stale after this long without finishing.
const STALE_AFTER_MS: i64 = 6 * 60 * 60 * 1000;

/// Outcome of a spawn attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnResult {
    /// The run was registered and launched; completion arrives later.
    Started,
    Rejected(SpawnRejection),
}

/// Why a spawn did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnRejection {
    /// No configuration for the task's project; the caller releases the
    /// lease and resets the tracker state.
    NoProjectConfig,
    /// Admitting this run could blow the daily budget; the lease has been
    /// released and the caller should park the task for later.
    BudgetExceeded,
    /// Spawn preparation failed (worktree creation or a tracker fetch);
    /// the lease has been released and the tracker state reset.
    Failed,
}

/// Everything the manager needs injected.
pub struct ManagerDeps {
    pub tracker: Arc<dyn TrackerApi>,
    pub notifier: Arc<dyn Notifier>,
    pub driver: Arc<dyn AgentDriver>,
    pub worktrees: Arc<WorktreeManager>,
    pub poller: Arc<TaskPoller>,
    pub cache: Arc<ProjectCache>,
    pub store: StateStore,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

struct Shared {
    queue: ReadyQueue,
    active: HashMap<String, ActiveAgent>,
    daily_spend_usd: f64,
    daily_spend_date: String,
}

struct Inner {
    deps: ManagerDeps,
    shared: Mutex<Shared>,
}

/// Handle to the manager; cheap to clone into spawned completion tasks.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<Inner>,
}

impl AgentManager {
    pub fn new(deps: ManagerDeps) -> Self {
        let queue = ReadyQueue::new(
            deps.clock.clone(),
            deps.config.agent.retry_base_delay_ms,
        );
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue,
                    active: HashMap::new(),
                    daily_spend_usd: 0.0,
                    daily_spend_date: String::new(),
                }),
                deps,
            }),
        }
    }

    // -- queue access (serialised with the active set) ----------------------

    /// Enqueue a freshly claimed task. Refuses tasks that are already
    /// queued or active, preserving the exclusive-lease invariant.
    pub async fn enqueue_task(&self, task: Task) -> bool {
        let mut shared = self.inner.shared.lock().await;
        if shared.active.contains_key(&task.issue_id) {
            return false;
        }
        let inserted = shared.queue.enqueue(task);
        if inserted {
            self.persist(&shared);
        }
        inserted
    }

    /// Park a budget-blocked task: back in the queue at retry 0, not ready
    /// again until a poll interval has passed.
    pub async fn park_budget_blocked(&self, task: Task) -> bool {
        let delay_ms = self.inner.deps.config.agent.poll_interval_ms as i64;
        let mut shared = self.inner.shared.lock().await;
        let inserted = shared.queue.enqueue_delayed(task, delay_ms);
        if inserted {
            self.persist(&shared);
        }
        inserted
    }

    /// Pop the first ready queue entry, if any.
    pub async fn dequeue_ready(&self) -> Option<QueueEntry> {
        let mut shared = self.inner.shared.lock().await;
        let entry = shared.queue.dequeue();
        if entry.is_some() {
            self.persist(&shared);
        }
        entry
    }

    /// Whether an issue is currently queued or active.
    pub async fn is_tracked(&self, issue_id: &str) -> bool {
        let shared = self.inner.shared.lock().await;
        shared.queue.contains(issue_id) || shared.active.contains_key(issue_id)
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.shared.lock().await.queue.len()
    }

    // -- queries ------------------------------------------------------------

    pub async fn active_count(&self) -> usize {
        self.inner.shared.lock().await.active.len()
    }

    pub async fn is_task_active(&self, issue_id: &str) -> bool {
        self.inner.shared.lock().await.active.contains_key(issue_id)
    }

    pub async fn active_agents(&self) -> Vec<ActiveAgent> {
        self.inner
            .shared
            .lock()
            .await
            .active
            .values()
            .cloned()
            .collect()
    }

    pub async fn daily_spend(&self) -> f64 {
        self.inner.shared.lock().await.daily_spend_usd
    }

    pub fn daily_budget(&self) -> f64 {
        self.inner.deps.config.agent.max_daily_budget
    }

    // -- recovery -----------------------------------------------------------

    /// Restore persisted state after a restart.
    ///
    /// Queued tasks are rehydrated as-is. Every persisted active agent that
    /// was `running` or `blocked` is an orphan: it is re-enqueued at retry
    /// count 0 and returned so the caller can reset its tracker state back
    /// to `todo`. Terminal statuses are dropped.
    pub async fn recover(&self, saved: RunnerState) -> Vec<Task> {
        let mut orphans = Vec::new();
        {
            let mut shared = self.inner.shared.lock().await;
            shared.daily_spend_usd = saved.daily_spend_usd;
            shared.daily_spend_date = saved.daily_spend_date;
            shared.queue.hydrate(saved.queued_tasks);

            for (issue_id, agent) in saved.active_agents {
                match agent.status {
                    AgentStatus::Running | AgentStatus::Blocked => {
                        info!(task = %agent.task.slug(), "re-enqueueing orphaned agent");
                        // May return false when a retry entry for the same
                        // issue survived in the queue; the tracker state is
                        // reset either way.
                        shared.queue.enqueue(agent.task.clone());
                        orphans.push(agent.task);
                    }
                    AgentStatus::Completed | AgentStatus::Errored => {
                        info!(issue = %issue_id, status = ?agent.status, "dropping finished persisted agent");
                    }
                }
            }

            self.persist(&shared);
        }
        orphans
    }

    // -- spawning -----------------------------------------------------------

    /// Start an agent for a task. Returns [`SpawnResult::Started`] once the
    /// run is registered and launched; the run itself completes in the
    /// background and is routed through the retry policy.
    pub async fn spawn_agent(&self, task: Task, retry_count: u32) -> SpawnResult {
        let slug = task.slug();
        let deps = &self.inner.deps;

        let Some(project_cfg) = deps.config.project(&task.project_identifier) else {
            warn!(task = %slug, "no project configuration, rejecting spawn");
            return SpawnResult::Rejected(SpawnRejection::NoProjectConfig);
        };
        let project_cfg = project_cfg.clone();

        // Budget admission, with the date rollover applied first.
        {
            let mut shared = self.inner.shared.lock().await;
            self.roll_daily(&mut shared);
            let projected = shared.daily_spend_usd + deps.config.agent.max_budget_per_task;
            if projected > deps.config.agent.max_daily_budget {
                let spent = shared.daily_spend_usd;
                drop(shared);
                warn!(task = %slug, spent, "daily budget would be exceeded, deferring");
                deps.notifier
                    .send_message(
                        &format!(
                            "Budget limit reached: ${spent:.2} spent today; deferring {slug} \
                             until the daily budget allows another run."
                        ),
                        None,
                    )
                    .await;
                deps.poller.release_task(&task.issue_id);
                return SpawnResult::Rejected(SpawnRejection::BudgetExceeded);
            }
        }

        // Phase detection needs the comment history.
        let comments = match deps
            .tracker
            .list_comments(&task.project_id, &task.issue_id)
            .await
        {
            Ok(comments) => comments,
            Err(e) => {
                warn!(task = %slug, error = %e, "failed to fetch comments, abandoning spawn");
                self.abandon_spawn(&task, &format!("failed to fetch comments: {e}"))
                    .await;
                return SpawnResult::Rejected(SpawnRejection::Failed);
            }
        };
        let phase = detect_phase(&comments);

        // Planning explores the repo in place; implementation gets an
        // isolated worktree.
        let (working_dir, branch_name): (PathBuf, Option<String>) = match phase {
            Phase::Planning => (project_cfg.repo_path.clone(), None),
            Phase::Implementation => {
                match self.prepare_worktree(&project_cfg.repo_path, &slug, &project_cfg.default_branch, retry_count) {
                    Ok((path, branch)) => (path, Some(branch)),
                    Err(e) => {
                        warn!(task = %slug, error = %e, "worktree preparation failed");
                        self.abandon_spawn(&task, &format!("{e:#}")).await;
                        return SpawnResult::Rejected(SpawnRejection::Failed);
                    }
                }
            }
        };

        // Register the active agent and persist before launching, so a
        // crash between here and completion is recoverable.
        {
            let mut shared = self.inner.shared.lock().await;
            shared.active.insert(
                task.issue_id.clone(),
                ActiveAgent {
                    task: task.clone(),
                    phase,
                    worktree_path: match phase {
                        Phase::Implementation => Some(working_dir.clone()),
                        Phase::Planning => None,
                    },
                    branch_name: branch_name.clone(),
                    started_at: deps.clock.now_ms(),
                    status: AgentStatus::Running,
                    cost_usd: None,
                    alerted_stale: false,
                    retry_count,
                },
            );
            self.persist(&shared);
        }

        info!(task = %slug, phase = %phase, retry_count, "spawning agent");

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .drive(task, phase, project_cfg, working_dir, branch_name, comments, retry_count)
                .await;
        });

        SpawnResult::Started
    }

    /// Pick the worktree strategy: a fresh strict create for first
    /// attempts, the resume-friendly variant when retrying or when a
    /// crashed run left its worktree behind.
    fn prepare_worktree(
        &self,
        repo_path: &std::path::Path,
        slug: &str,
        default_branch: &str,
        retry_count: u32,
    ) -> anyhow::Result<(PathBuf, String)> {
        let worktrees = &self.inner.deps.worktrees;

        let leftover = WorktreeManager::worktree_path(repo_path, slug).exists();
        if retry_count > 0 || leftover {
            let resumed = worktrees.get_or_create_worktree(repo_path, slug, default_branch)?;
            if resumed.is_existing {
                info!(
                    task = %slug,
                    last_commit = resumed.last_commit.as_deref().unwrap_or("(none)"),
                    "resuming existing worktree"
                );
            }
            Ok((resumed.handle.worktree_path, resumed.handle.branch_name))
        } else {
            let handle = worktrees.create_worktree(repo_path, slug, default_branch)?;
            Ok((handle.worktree_path, handle.branch_name))
        }
    }

    /// Give up on a spawn before the agent started: notify, release the
    /// lease, and reset the tracker state so the task is rediscoverable.
    async fn abandon_spawn(&self, task: &Task, reason: &str) {
        let deps = &self.inner.deps;
        deps.notifier
            .agent_errored(&task.slug(), &task.title, reason)
            .await;
        deps.poller.release_task(&task.issue_id);
        self.reset_tracker_state(task).await;
    }

    /// Best-effort transition of an issue back to the `todo` state it was
    /// discovered in.
    pub async fn reset_tracker_state(&self, task: &Task) {
        let patch = IssuePatch::state(task.state_id.clone());
        if let Err(e) = self
            .inner
            .deps
            .tracker
            .update_issue(&task.project_id, &task.issue_id, &patch)
            .await
        {
            error!(task = %task.slug(), error = %e, "failed to reset tracker state");
        }
    }

    // -- run completion -----------------------------------------------------

    async fn drive(
        &self,
        task: Task,
        phase: Phase,
        project_cfg: crate::config::ProjectConfig,
        working_dir: PathBuf,
        branch_name: Option<String>,
        comments: Vec<drover_tracker::models::IssueComment>,
        retry_count: u32,
    ) {
        let deps = &self.inner.deps;
        let runner_deps = RunnerDeps {
            tracker: deps.tracker.as_ref(),
            notifier: deps.notifier.as_ref(),
            driver: deps.driver.as_ref(),
            agent_config: &deps.config.agent,
            project: &project_cfg,
        };

        let result = runner::run_agent(
            &runner_deps,
            &task,
            phase,
            &working_dir,
            branch_name.as_deref(),
            &comments,
        )
        .await;

        match result {
            Ok(outcome) => {
                self.on_outcome(task, phase, &project_cfg.repo_path, retry_count, outcome)
                    .await;
            }
            Err(e) => {
                self.on_crash(task, retry_count, e).await;
            }
        }
    }

    async fn on_outcome(
        &self,
        task: Task,
        phase: Phase,
        repo_path: &std::path::Path,
        retry_count: u32,
        outcome: AgentRunOutcome,
    ) {
        let deps = &self.inner.deps;
        let slug = task.slug();
        let max_retries = deps.config.agent.max_retries;

        // Spend is accounted on completion, never speculatively.
        {
            let mut shared = self.inner.shared.lock().await;
            self.roll_daily(&mut shared);
            shared.daily_spend_usd += outcome.cost_usd;
            info!(
                task = %slug,
                cost_usd = outcome.cost_usd,
                daily_spend_usd = shared.daily_spend_usd,
                "recorded run cost"
            );
            self.persist(&shared);
        }

        if let Some(error) = outcome.error {
            if error.is_retryable() && retry_count < max_retries {
                self.schedule_retry(task, retry_count, &error.to_string())
                    .await;
                return;
            }
        }

        // Terminal: success or non-retryable failure (or retries exhausted).
        let status = match outcome.error {
            None => AgentStatus::Completed,
            Some(_) => AgentStatus::Errored,
        };

        {
            let mut shared = self.inner.shared.lock().await;
            if let Some(agent) = shared.active.get_mut(&task.issue_id) {
                agent.status = status;
                agent.cost_usd = Some(outcome.cost_usd);
            }
            self.persist(&shared);
        }

        if phase == Phase::Implementation {
            deps.worktrees.remove_worktree(repo_path, &slug);
        }

        if status == AgentStatus::Completed {
            if phase == Phase::Implementation {
                if let Some(url) = outcome.result_text.as_deref().and_then(find_pr_url) {
                    if let Err(e) = deps
                        .tracker
                        .create_link(&task.project_id, &task.issue_id, "Pull request", url)
                        .await
                    {
                        warn!(task = %slug, error = %e, "failed to attach pull-request link");
                    }
                }
            }

            // Hand the issue to its human review state, when the project
            // has one. Best-effort, like every other tracker write here.
            let review_state = deps.cache.get(&task.project_identifier).and_then(|entry| {
                match phase {
                    Phase::Planning => entry.plan_review_state_id.clone(),
                    Phase::Implementation => entry.in_review_state_id.clone(),
                }
            });
            if let Some(state_id) = review_state {
                let patch = IssuePatch::state(state_id);
                if let Err(e) = deps
                    .tracker
                    .update_issue(&task.project_id, &task.issue_id, &patch)
                    .await
                {
                    warn!(task = %slug, error = %e, "failed to move issue to review state");
                }
            }
        }

        {
            let mut shared = self.inner.shared.lock().await;
            shared.active.remove(&task.issue_id);
            self.persist(&shared);
        }
        deps.poller.release_task(&task.issue_id);

        match outcome.error {
            None => info!(task = %slug, phase = %phase, "agent run complete"),
            Some(error) => {
                warn!(task = %slug, error = %error, "agent run failed terminally")
            }
        }
    }

    async fn on_crash(&self, task: Task, retry_count: u32, error: anyhow::Error) {
        let deps = &self.inner.deps;
        let slug = task.slug();

        error!(task = %slug, error = %format!("{error:#}"), "agent run crashed");

        if retry_count < deps.config.agent.max_retries {
            // The worktree is deliberately left in place: it lets the retry
            // resume and a human inspect the wreckage.
            self.schedule_retry(task, retry_count, "crash").await;
            return;
        }

        {
            let mut shared = self.inner.shared.lock().await;
            shared.active.remove(&task.issue_id);
            self.persist(&shared);
        }
        deps.poller.release_task(&task.issue_id);
        deps.notifier
            .agent_errored(&slug, &task.title, "crashed with no retries left")
            .await;
    }

    /// Common retry path: remove from the active set, requeue with backoff,
    /// reset the tracker state to `todo`, release the lease.
    async fn schedule_retry(&self, task: Task, retry_count: u32, reason: &str) {
        let deps = &self.inner.deps;
        let slug = task.slug();
        let next_retry = retry_count + 1;
        let delay_ms = deps.config.agent.retry_base_delay_ms.saturating_mul(1 << retry_count);

        {
            let mut shared = self.inner.shared.lock().await;
            shared.active.remove(&task.issue_id);
            shared.queue.requeue(task.clone(), next_retry);
            self.persist(&shared);
        }

        deps.notifier
            .send_message(
                &format!(
                    "Retrying {slug} after {reason} (attempt {next_retry}/{max}) in {delay}s",
                    max = deps.config.agent.max_retries,
                    delay = delay_ms / 1000,
                ),
                None,
            )
            .await;

        // Best-effort: a tracker hiccup must not cancel the retry.
        self.reset_tracker_state(&task).await;
        deps.poller.release_task(&task.issue_id);
    }

    // -- stale detection ----------------------------------------------------

    /// Alert once for every running agent older than the stale threshold.
    pub async fn check_stale_agents(&self) {
        let deps = &self.inner.deps;
        let now = deps.clock.now_ms();

        let stale: Vec<(String, i64)> = {
            let mut shared = self.inner.shared.lock().await;
            let mut found = Vec::new();
            for agent in shared.active.values_mut() {
                if agent.status == AgentStatus::Running
                    && !agent.alerted_stale
                    && now - agent.started_at > STALE_AFTER_MS
                {
                    agent.alerted_stale = true;
                    found.push((agent.task.slug(), now - agent.started_at));
                }
            }
            if !found.is_empty() {
                self.persist(&shared);
            }
            found
        };

        for (slug, age_ms) in stale {
            let hours = age_ms / (60 * 60 * 1000);
            warn!(task = %slug, hours, "stale agent detected");
            deps.notifier
                .send_message(
                    &format!("Stale agent: {slug} has been running for {hours}h"),
                    None,
                )
                .await;
        }
    }

    /// Force a persistence pass (used on shutdown).
    pub async fn persist_now(&self) {
        let shared = self.inner.shared.lock().await;
        self.persist(&shared);
    }

    // -- internals ----------------------------------------------------------

    /// Reset the spend counter when the UTC date has rolled over.
    fn roll_daily(&self, shared: &mut Shared) {
        let today = self.inner.deps.clock.today_utc();
        if shared.daily_spend_date != today {
            if !shared.daily_spend_date.is_empty() {
                info!(
                    previous = %shared.daily_spend_date,
                    spent = shared.daily_spend_usd,
                    "daily budget rolled over"
                );
            }
            shared.daily_spend_usd = 0.0;
            shared.daily_spend_date = today;
        }
    }

    /// Snapshot and write the persisted state. Called with the shared lock
    /// held so writes cannot interleave; failures are logged, not fatal.
    fn persist(&self, shared: &Shared) {
        let state = RunnerState {
            active_agents: shared.active.clone(),
            daily_spend_usd: shared.daily_spend_usd,
            daily_spend_date: shared.daily_spend_date.clone(),
            queued_tasks: shared.queue.entries(),
        };
        if let Err(e) = self.inner.deps.store.save(&state) {
            error!(error = %e, "failed to persist runner state");
        }
    }
}
