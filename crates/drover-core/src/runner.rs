//! One agent run: launch the subprocess for a task in a phase, surface
//! progress to the notifier and the tracker, and classify the terminal
//! result.
//!
//! The runner returns `Ok` with a typed outcome for every run that reached
//! a result message -- success or classified failure -- and `Err` only for
//! crashes (transport errors, or the process dying without a result). The
//! manager decides retries from that distinction.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Result, anyhow};
use futures::StreamExt;
use tracing::{debug, info, warn};

use drover_tracker::TrackerApi;
use drover_tracker::models::IssueComment;

use crate::config::{AgentConfig, ProjectConfig};
use crate::driver::{AgentDriver, AgentInvocation, AgentMessage, AgentResult};
use crate::model::{AgentErrorType, Phase, Task};
use crate::notify::Notifier;
use crate::phase::{PLAN_MARKER, find_plan};

/// Planning runs are short, read-only explorations; their limits are fixed
/// rather than configurable.
const PLANNING_MAX_TURNS: u32 = 50;
const PLANNING_MAX_BUDGET_USD: f64 = 1.0;

/// Tools available during read-only planning.
const PLANNING_TOOLS: &[&str] = &["Read", "Glob", "Grep"];
/// Tools available during implementation (includes shell access for
/// committing, pushing, and watching CI).
const IMPLEMENTATION_TOOLS: &[&str] = &["Bash", "Read", "Edit", "Write", "Glob", "Grep"];

/// Dependencies for a run, injected so tests can fake each seam.
pub struct RunnerDeps<'a> {
    pub tracker: &'a dyn TrackerApi,
    pub notifier: &'a dyn Notifier,
    pub driver: &'a dyn AgentDriver,
    pub agent_config: &'a AgentConfig,
    pub project: &'a ProjectConfig,
}

/// Outcome of a run that produced a result message.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRunOutcome {
    pub cost_usd: f64,
    /// `None` on success.
    pub error: Option<AgentErrorType>,
    /// Final result text, used for the plan comment and PR-link scan.
    pub result_text: Option<String>,
}

/// Classify a non-success result subtype.
///
/// An absent error list means the agent was cut off mid-stream, which in
/// practice is the provider rate-limiting us.
pub fn classify_error(subtype: &str, errors: &[String]) -> AgentErrorType {
    if errors.is_empty() {
        AgentErrorType::RateLimited
    } else if subtype.contains("budget") {
        AgentErrorType::BudgetExceeded
    } else if subtype.contains("turns") {
        AgentErrorType::MaxTurns
    } else {
        AgentErrorType::Unknown
    }
}

/// Run one agent for `task` in `phase`, inside `working_dir`.
pub async fn run_agent(
    deps: &RunnerDeps<'_>,
    task: &Task,
    phase: Phase,
    working_dir: &Path,
    branch_name: Option<&str>,
    comments: &[IssueComment],
) -> Result<AgentRunOutcome> {
    let slug = task.slug();

    deps.notifier.agent_started(&slug, &task.title).await;
    post_comment(
        deps.tracker,
        task,
        &format!("<p>Agent started the {phase} phase for {slug}.</p>"),
    )
    .await;

    let invocation = build_invocation(deps, task, phase, working_dir, branch_name, comments);

    let mut stream = match deps.driver.start(&invocation).await {
        Ok(stream) => stream,
        Err(e) => {
            let e = e.context(format!("agent failed to start for {slug}"));
            report_crash(deps, task, &e).await;
            return Err(e);
        }
    };

    let mut outcome: Option<AgentRunOutcome> = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(AgentMessage::Assistant { text }) => {
                debug!(task = %slug, "agent: {text}");
            }
            Ok(AgentMessage::Result(result)) => {
                outcome = Some(handle_result(deps, task, phase, result).await);
                // The result is terminal; anything the process does after
                // it (including its exit code) is irrelevant.
                break;
            }
            Err(e) => {
                let e = e.context(format!("agent stream broke for {slug}"));
                report_crash(deps, task, &e).await;
                return Err(e);
            }
        }
    }

    match outcome {
        Some(outcome) => Ok(outcome),
        None => {
            let e = anyhow!("agent for {slug} exited without a result message");
            report_crash(deps, task, &e).await;
            Err(e)
        }
    }
}

fn build_invocation(
    deps: &RunnerDeps<'_>,
    task: &Task,
    phase: Phase,
    working_dir: &Path,
    branch_name: Option<&str>,
    comments: &[IssueComment],
) -> AgentInvocation {
    let slug = task.slug();
    let system_prompt = format!(
        "You are an autonomous coding agent working on tracker issue {slug}: {title}.",
        title = task.title
    );

    match phase {
        Phase::Planning => AgentInvocation {
            prompt: planning_prompt(task),
            system_prompt,
            allowed_tools: PLANNING_TOOLS.iter().map(|t| t.to_string()).collect(),
            max_turns: PLANNING_MAX_TURNS,
            max_budget_usd: PLANNING_MAX_BUDGET_USD,
            working_dir: working_dir.to_path_buf(),
            env: HashMap::new(),
        },
        Phase::Implementation => {
            let mut env = HashMap::new();
            // The implementation agent pushes branches and opens PRs.
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                env.insert("GITHUB_TOKEN".to_string(), token);
            }
            AgentInvocation {
                prompt: implementation_prompt(deps.project, task, branch_name, comments),
                system_prompt,
                allowed_tools: IMPLEMENTATION_TOOLS.iter().map(|t| t.to_string()).collect(),
                max_turns: deps.agent_config.max_turns,
                max_budget_usd: deps.agent_config.max_budget_per_task,
                working_dir: working_dir.to_path_buf(),
                env,
            }
        }
    }
}

fn planning_prompt(task: &Task) -> String {
    format!(
        "Issue {slug}: {title}\n\n{description}\n\n\
         Explore this repository (read-only) and produce a concrete, \
         step-by-step implementation plan for the issue: the files to touch, \
         the changes to make in each, and how to verify them. Respond with \
         the plan only.",
        slug = task.slug(),
        title = task.title,
        description = task.description_html,
    )
}

fn implementation_prompt(
    project: &ProjectConfig,
    task: &Task,
    branch_name: Option<&str>,
    comments: &[IssueComment],
) -> String {
    let plan = find_plan(comments).unwrap_or("(no plan was recorded)");
    let ci = if project.ci_checks.is_empty() {
        String::new()
    } else {
        format!(
            "\nAfter pushing, wait for these CI checks to pass: {}.",
            project.ci_checks.join(", ")
        )
    };

    format!(
        "Issue {slug}: {title}\n\n{description}\n\n\
         An approved plan exists for this issue:\n{plan}\n\n\
         Implement the plan in this working copy. Commit your work in \
         logical steps, push the branch {branch} to origin, and open a pull \
         request against {default_branch} on {repo_url}. Reference {slug} \
         in the pull request description.{ci}",
        slug = task.slug(),
        title = task.title,
        description = task.description_html,
        branch = branch_name.unwrap_or("(current)"),
        default_branch = project.default_branch,
        repo_url = project.repo_url,
    )
}

async fn handle_result(
    deps: &RunnerDeps<'_>,
    task: &Task,
    phase: Phase,
    result: AgentResult,
) -> AgentRunOutcome {
    let slug = task.slug();
    let cost_usd = result.total_cost_usd.unwrap_or(0.0);

    if result.is_success() {
        info!(task = %slug, phase = %phase, cost_usd, "agent run succeeded");
        deps.notifier.agent_completed(&slug, &task.title).await;

        let comment = match phase {
            // The plan comment carries the marker that flips the task to
            // the implementation phase on its next spawn.
            Phase::Planning => format!(
                "{PLAN_MARKER}\n<p><strong>Plan for {slug}</strong></p><pre>{plan}</pre>",
                plan = result.text.as_deref().unwrap_or("")
            ),
            Phase::Implementation => {
                format!("<p>Agent finished implementing {slug}.</p>")
            }
        };
        post_comment(deps.tracker, task, &comment).await;

        return AgentRunOutcome {
            cost_usd,
            error: None,
            result_text: result.text,
        };
    }

    let error = classify_error(&result.subtype, &result.errors);
    warn!(
        task = %slug,
        subtype = %result.subtype,
        error = %error,
        cost_usd,
        "agent run failed"
    );
    deps.notifier
        .agent_errored(&slug, &task.title, &error.to_string())
        .await;
    post_comment(
        deps.tracker,
        task,
        &format!("<p>Agent run for {slug} failed ({error}).</p>"),
    )
    .await;

    AgentRunOutcome {
        cost_usd,
        error: Some(error),
        result_text: result.text,
    }
}

async fn report_crash(deps: &RunnerDeps<'_>, task: &Task, error: &anyhow::Error) {
    let slug = task.slug();
    deps.notifier
        .agent_errored(&slug, &task.title, &format!("{error:#}"))
        .await;
    post_comment(
        deps.tracker,
        task,
        &format!("<p>Agent run for {slug} crashed; it will be retried if attempts remain.</p>"),
    )
    .await;
}

/// Post a tracker comment, best-effort: a comment failure must not take
/// down the run.
async fn post_comment(tracker: &dyn TrackerApi, task: &Task, html: &str) {
    if let Err(e) = tracker
        .create_comment(&task.project_id, &task.issue_id, html)
        .await
    {
        warn!(task = %task.slug(), error = %e, "failed to post tracker comment");
    }
}

/// Find the first GitHub pull-request URL in a block of text, if any.
/// Used to attach the produced PR to the issue after implementation.
pub fn find_pr_url(text: &str) -> Option<&str> {
    for (index, _) in text.match_indices("https://github.com/") {
        let rest = &text[index..];
        let end = rest
            .find(|c: char| c.is_whitespace() || c == ')' || c == '"' || c == '>' || c == ',')
            .unwrap_or(rest.len());
        let candidate = rest[..end].trim_end_matches(['.', ';']);
        if candidate.contains("/pull/") {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_no_errors_is_rate_limited() {
        // A cut-off stream reports no error list regardless of subtype.
        assert_eq!(classify_error("max_tokens", &[]), AgentErrorType::RateLimited);
        assert_eq!(classify_error("error_budget", &[]), AgentErrorType::RateLimited);
    }

    #[test]
    fn classify_by_subtype_substring() {
        let errs = vec!["boom".to_string()];
        assert_eq!(
            classify_error("error_budget_exceeded", &errs),
            AgentErrorType::BudgetExceeded
        );
        assert_eq!(
            classify_error("error_max_turns", &errs),
            AgentErrorType::MaxTurns
        );
        assert_eq!(classify_error("error_weird", &errs), AgentErrorType::Unknown);
    }

    #[test]
    fn find_pr_url_extracts_pull_links() {
        let text = "Opened https://github.com/acme/hq/pull/17 for review.";
        assert_eq!(
            find_pr_url(text),
            Some("https://github.com/acme/hq/pull/17")
        );
    }

    #[test]
    fn find_pr_url_ignores_non_pr_links() {
        assert!(find_pr_url("see https://github.com/acme/hq/issues/3").is_none());
        assert!(find_pr_url("no links here").is_none());
    }

    #[test]
    fn find_pr_url_skips_repo_link_before_pr_link() {
        let text = "Repo https://github.com/acme/hq and PR https://github.com/acme/hq/pull/9";
        assert_eq!(
            find_pr_url(text),
            Some("https://github.com/acme/hq/pull/9")
        );
    }

    #[test]
    fn planning_prompt_names_the_slug() {
        let task = Task {
            issue_id: "i-1".to_string(),
            project_id: "p-1".to_string(),
            project_identifier: "HQ".to_string(),
            sequence_id: 42,
            title: "Fix login".to_string(),
            description_html: "<p>users cannot log in</p>".to_string(),
            state_id: "s-todo".to_string(),
            label_ids: vec![],
        };
        let prompt = planning_prompt(&task);
        assert!(prompt.contains("HQ-42"));
        assert!(prompt.contains("users cannot log in"));
    }

    #[test]
    fn implementation_prompt_embeds_plan_and_branch() {
        let project = ProjectConfig {
            repo_path: "/srv/hq".into(),
            repo_url: "https://github.com/acme/hq".to_string(),
            default_branch: "main".to_string(),
            ci_checks: vec!["build".to_string(), "test".to_string()],
        };
        let task = Task {
            issue_id: "i-1".to_string(),
            project_id: "p-1".to_string(),
            project_identifier: "HQ".to_string(),
            sequence_id: 42,
            title: "Fix login".to_string(),
            description_html: String::new(),
            state_id: "s-todo".to_string(),
            label_ids: vec![],
        };
        let comments = vec![IssueComment {
            id: "c-1".to_string(),
            comment_html: format!("{PLAN_MARKER}<p>1. patch auth.rs</p>"),
        }];

        let prompt = implementation_prompt(&project, &task, Some("agent/HQ-42"), &comments);
        assert!(prompt.contains("patch auth.rs"));
        assert!(prompt.contains("agent/HQ-42"));
        assert!(prompt.contains("build, test"));
        assert!(prompt.contains("https://github.com/acme/hq"));
    }
}
