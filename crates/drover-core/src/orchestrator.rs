//! The top-level loop: two independent timers driving discovery (poll the
//! tracker, claim, enqueue) and processing (dequeue, spawn), plus startup
//! recovery and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::manager::{AgentManager, SpawnRejection, SpawnResult};
use crate::notify::Notifier;
use crate::poller::TaskPoller;
use crate::project::ProjectCache;
use crate::state::StateStore;
use crate::worktree::WorktreeManager;

/// Wiring for the orchestrator.
pub struct OrchestratorDeps {
    pub manager: AgentManager,
    pub poller: Arc<TaskPoller>,
    pub cache: Arc<ProjectCache>,
    pub notifier: Arc<dyn Notifier>,
    pub worktrees: Arc<WorktreeManager>,
    pub store: StateStore,
    pub config: Arc<Config>,
}

/// Owns the discovery and processing timers and the recovery/shutdown
/// sequences.
pub struct Orchestrator {
    deps: OrchestratorDeps,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self { deps }
    }

    pub fn manager(&self) -> &AgentManager {
        &self.deps.manager
    }

    /// Startup: gitignore the worktree directories, load the persisted
    /// state, rehydrate the queue, and recover orphaned agents (re-enqueue
    /// plus a best-effort tracker reset to `todo`).
    pub async fn start(&self) -> Result<()> {
        let deps = &self.deps;

        for (identifier, project) in &deps.config.projects {
            if let Err(e) = deps.worktrees.ensure_worktree_gitignore(&project.repo_path) {
                warn!(project = %identifier, error = %e, "could not update .gitignore");
            }
        }

        let saved = deps.store.load();
        let orphans = deps.manager.recover(saved).await;
        for task in &orphans {
            deps.manager.reset_tracker_state(task).await;
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "recovered orphaned agents into the queue");
        }

        Ok(())
    }

    /// One discovery tick: stale check, poll, claim, enqueue.
    pub async fn discovery_cycle(&self) {
        let deps = &self.deps;

        deps.manager.check_stale_agents().await;

        let max_tasks = deps.config.agent.max_concurrent * 2;
        let tasks = deps.poller.poll_for_tasks(max_tasks).await;

        for task in tasks {
            if deps.manager.is_tracked(&task.issue_id).await {
                continue;
            }
            if deps.cache.get(&task.project_identifier).is_none() {
                warn!(task = %task.slug(), "discovered task for unknown project, skipping");
                continue;
            }
            // The claim (tracker lease) and the enqueue form one logical
            // step: nothing between them can spawn the task.
            if deps.poller.claim_task(&task).await {
                deps.manager.enqueue_task(task).await;
            }
        }
    }

    /// One processing tick: spawn at most one ready task if capacity
    /// allows.
    pub async fn processing_cycle(&self) {
        let deps = &self.deps;

        if deps.manager.active_count().await >= deps.config.agent.max_concurrent {
            return;
        }
        let Some(entry) = deps.manager.dequeue_ready().await else {
            return;
        };

        match deps
            .manager
            .spawn_agent(entry.task.clone(), entry.retry_count)
            .await
        {
            SpawnResult::Started => {}
            SpawnResult::Rejected(SpawnRejection::BudgetExceeded) => {
                // Parked until the budget clears (the lease was released by
                // the manager; rediscovery is harmless thanks to queue
                // uniqueness).
                deps.manager.park_budget_blocked(entry.task).await;
            }
            SpawnResult::Rejected(SpawnRejection::NoProjectConfig) => {
                deps.poller.release_task(&entry.task.issue_id);
                deps.manager.reset_tracker_state(&entry.task).await;
            }
            SpawnResult::Rejected(SpawnRejection::Failed) => {
                // The manager already released the lease and reset the
                // tracker state; the task returns via rediscovery.
            }
        }
    }

    /// Run until cancelled, then shut down gracefully.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.start().await?;

        let mut discovery =
            tokio::time::interval(Duration::from_millis(self.deps.config.agent.poll_interval_ms));
        let mut processing =
            tokio::time::interval(Duration::from_millis(self.deps.config.agent.spawn_delay_ms));
        discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        processing.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.deps.config.agent.poll_interval_ms,
            spawn_delay_ms = self.deps.config.agent.spawn_delay_ms,
            "orchestrator running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = discovery.tick() => self.discovery_cycle().await,
                _ = processing.tick() => self.processing_cycle().await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Persist state and announce which agents are being orphaned. Running
    /// children are not interrupted; recovery picks their tasks up on the
    /// next start.
    async fn shutdown(&self) {
        let deps = &self.deps;

        deps.manager.persist_now().await;

        let running: Vec<String> = deps
            .manager
            .active_agents()
            .await
            .iter()
            .map(|a| a.task.slug())
            .collect();

        let message = if running.is_empty() {
            "Orchestrator shutting down; no agents were running.".to_string()
        } else {
            format!(
                "Orchestrator shutting down; still-running agents will be recovered on restart: {}",
                running.join(", ")
            )
        };
        info!(still_running = running.len(), "shutting down");
        deps.notifier.send_message(&message, None).await;
    }
}
