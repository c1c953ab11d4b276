//! `drover init`: write a commented starter config.

use std::path::Path;

use anyhow::{Context, Result, bail};

const CONFIG_TEMPLATE: &str = r#"[plane]
baseUrl = "https://api.plane.so"
workspaceSlug = "your-workspace"

# One section per project the orchestrator should work. The key is the
# tracker's project identifier (the slug prefix, e.g. HQ in HQ-42).
[projects.HQ]
repoPath = "/srv/repos/hq"
repoUrl = "https://github.com/your-org/hq"
defaultBranch = "main"
# ciChecks = ["build", "test"]

[agent]
maxConcurrent = 2
maxBudgetPerTask = 5.0
maxDailyBudget = 20.0
maxTurns = 200
pollIntervalMs = 30000
spawnDelayMs = 15000
maxRetries = 2
retryBaseDelayMs = 60000
labelName = "agent"
"#;

pub fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    println!("Wrote starter config to {}", path.display());
    println!("Edit it, export PLANE_API_KEY / ANTHROPIC_API_KEY / GITHUB_TOKEN, then run `drover run`.");
    Ok(())
}
