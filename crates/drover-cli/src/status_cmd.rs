//! `drover status`: print the persisted scheduler state.

use anyhow::Result;

use drover_core::clock::{Clock, SystemClock};
use drover_core::state::StateStore;

pub fn run_status() -> Result<()> {
    let store = StateStore::new(StateStore::default_path());
    let state = store.load();
    let now = SystemClock.now_ms();

    println!("State file: {}", store.path().display());
    println!(
        "Daily spend: ${:.2} ({})",
        state.daily_spend_usd,
        if state.daily_spend_date.is_empty() {
            "no spend recorded"
        } else {
            &state.daily_spend_date
        }
    );
    println!();

    if state.active_agents.is_empty() {
        println!("No active agents.");
    } else {
        println!("Active agents:");
        let mut agents: Vec<_> = state.active_agents.values().collect();
        agents.sort_by_key(|a| a.started_at);
        for agent in agents {
            let minutes = (now - agent.started_at).max(0) / 60_000;
            println!(
                "  {:<12} {:<15} {:?}  running {}m  cost {}",
                agent.task.slug(),
                agent.phase.to_string(),
                agent.status,
                minutes,
                agent
                    .cost_usd
                    .map(|c| format!("${c:.2}"))
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
    }
    println!();

    if state.queued_tasks.is_empty() {
        println!("Queue is empty.");
    } else {
        println!("Queued tasks:");
        for entry in &state.queued_tasks {
            let wait_ms = entry.next_attempt_at - now;
            let readiness = if wait_ms <= 0 {
                "ready".to_string()
            } else {
                format!("ready in {}s", wait_ms / 1000)
            };
            println!(
                "  {:<12} retries={} {}",
                entry.task.slug(),
                entry.retry_count,
                readiness,
            );
        }
    }

    Ok(())
}
