//! `drover run`: wire the components and run the orchestrator until
//! SIGINT/SIGTERM.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drover_core::clock::SystemClock;
use drover_core::config::Config;
use drover_core::driver::ClaudeCodeDriver;
use drover_core::manager::{AgentManager, ManagerDeps};
use drover_core::notify::{NoopNotifier, Notifier, SlackNotifier};
use drover_core::orchestrator::{Orchestrator, OrchestratorDeps};
use drover_core::poller::TaskPoller;
use drover_core::project::ProjectCache;
use drover_core::state::StateStore;
use drover_core::worktree::WorktreeManager;
use drover_tracker::{PlaneClient, TrackerApi};

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

pub async fn run_orchestrator(config_path: &Path) -> Result<()> {
    let config = Arc::new(Config::load(config_path)?);

    let plane_api_key = require_env("PLANE_API_KEY")?;
    // The agent subprocess authenticates with this; fail fast rather than
    // spawning agents that cannot talk to the provider.
    require_env("ANTHROPIC_API_KEY")?;
    require_env("GITHUB_TOKEN")?;

    let tracker: Arc<dyn TrackerApi> = Arc::new(PlaneClient::new(
        config.plane.base_url.clone(),
        config.plane.workspace_slug.clone(),
        plane_api_key,
    ));

    let notifier: Arc<dyn Notifier> = match SlackNotifier::from_env() {
        Some(slack) => Arc::new(slack),
        None => {
            info!("no notifier credentials; notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    let cache = Arc::new(ProjectCache::initialize(tracker.as_ref(), &config).await?);
    if cache.is_empty() {
        warn!("no projects resolved against the tracker; discovery will find nothing");
    }

    let store = StateStore::new(StateStore::default_path());
    info!(state_path = %store.path().display(), "using state file");

    let poller = Arc::new(TaskPoller::new(tracker.clone(), cache.clone()));
    let worktrees = Arc::new(WorktreeManager::new());

    let manager = AgentManager::new(ManagerDeps {
        tracker: tracker.clone(),
        notifier: notifier.clone(),
        driver: Arc::new(ClaudeCodeDriver::new()),
        worktrees: worktrees.clone(),
        poller: poller.clone(),
        cache: cache.clone(),
        store: store.clone(),
        clock: Arc::new(SystemClock),
        config: config.clone(),
    });

    let orchestrator = Orchestrator::new(OrchestratorDeps {
        manager,
        poller,
        cache,
        notifier,
        worktrees,
        store,
        config,
    });

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    orchestrator.run(cancel).await
}

/// Cancel the token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt");
        }

        cancel.cancel();
    });
}
