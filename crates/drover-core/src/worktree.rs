//! Git worktree lifecycle for agent isolation.
//!
//! Each implementation-phase agent works in its own checkout at
//! `<repo>/.worktrees/agent-<slug>` on branch `agent/<slug>`, sharing the
//! main repository's object store. Before a fresh worktree is created the
//! main checkout is reset to `origin/<default-branch>` and cleaned, so
//! stray mutations from earlier planning runs cannot leak into the branch
//! point.
//!
//! Git does not support concurrent worktree operations on one repository
//! (it locks the shared object store), and the base-reset mutates the main
//! checkout, so all mutating operations are serialised per repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

/// Directory under the repository root that holds agent worktrees.
pub const WORKTREES_DIR: &str = ".worktrees";

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// A git command could not be executed at all.
    #[error("failed to run git {command}: {source}")]
    GitCommand {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A worktree directory for this task already exists.
    #[error("worktree already exists at {0}")]
    WorktreeExists(PathBuf),

    /// The task branch already exists.
    #[error("branch {0} already exists")]
    BranchExists(String),

    /// Reading or writing `.gitignore` failed.
    #[error("failed to update {path}: {source}")]
    Gitignore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A created or resumed worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub worktree_path: PathBuf,
    pub branch_name: String,
}

/// Result of the resume-friendly [`WorktreeManager::get_or_create_worktree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumedWorktree {
    pub handle: WorktreeHandle,
    /// Whether an existing branch (and possibly worktree) was picked up.
    pub is_existing: bool,
    /// Subject line of the branch tip, when resuming.
    pub last_commit: Option<String>,
}

/// Manages agent worktrees across the configured repositories.
pub struct WorktreeManager {
    /// One lock per repository path; worktree mutations and the base reset
    /// must not interleave within a repo.
    repo_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self {
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Conventional branch name for a task slug: `agent/<slug>`.
    pub fn branch_name(task_slug: &str) -> String {
        format!("agent/{task_slug}")
    }

    /// Conventional worktree path for a task slug:
    /// `<repo>/.worktrees/agent-<slug>`.
    pub fn worktree_path(repo_path: &Path, task_slug: &str) -> PathBuf {
        repo_path.join(WORKTREES_DIR).join(format!("agent-{task_slug}"))
    }

    fn repo_lock(&self, repo_path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(repo_path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a fresh worktree for a task, branching from
    /// `origin/<default_branch>`.
    ///
    /// Fails with [`WorktreeError::WorktreeExists`] or
    /// [`WorktreeError::BranchExists`] when either half of the pair is
    /// already present; callers decide whether that means collision or
    /// resume (see [`Self::get_or_create_worktree`]).
    pub fn create_worktree(
        &self,
        repo_path: &Path,
        task_slug: &str,
        default_branch: &str,
    ) -> Result<WorktreeHandle, WorktreeError> {
        let lock = self.repo_lock(repo_path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        self.reset_base(repo_path, default_branch)?;

        let worktree_path = Self::worktree_path(repo_path, task_slug);
        let branch_name = Self::branch_name(task_slug);

        if worktree_path.exists() {
            return Err(WorktreeError::WorktreeExists(worktree_path));
        }
        if branch_exists(repo_path, &branch_name)? {
            return Err(WorktreeError::BranchExists(branch_name));
        }

        git(
            repo_path,
            &[
                "worktree",
                "add",
                "-b",
                &branch_name,
                worktree_path.to_string_lossy().as_ref(),
                &format!("origin/{default_branch}"),
            ],
        )?;

        debug!(
            path = %worktree_path.display(),
            branch = %branch_name,
            "created worktree"
        );

        Ok(WorktreeHandle {
            worktree_path,
            branch_name,
        })
    }

    /// Resume-friendly variant: when the task branch already exists
    /// (locally or on the remote), materialise a worktree for it instead of
    /// failing. Used by implementation-phase retries after a crash.
    pub fn get_or_create_worktree(
        &self,
        repo_path: &Path,
        task_slug: &str,
        default_branch: &str,
    ) -> Result<ResumedWorktree, WorktreeError> {
        let worktree_path = Self::worktree_path(repo_path, task_slug);
        let branch_name = Self::branch_name(task_slug);

        {
            let lock = self.repo_lock(repo_path);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            // Worktree still on disk from a crashed run: pick it up as-is.
            if worktree_path.exists() {
                return Ok(ResumedWorktree {
                    last_commit: last_commit_subject(repo_path, &branch_name),
                    handle: WorktreeHandle {
                        worktree_path,
                        branch_name,
                    },
                    is_existing: true,
                });
            }

            // Refresh remote refs so a branch pushed by a previous run is
            // visible. Offline operation is fine; the fetch is best-effort.
            if let Err(e) = git(repo_path, &["fetch", "origin"]) {
                warn!(repo = %repo_path.display(), error = %e, "fetch before resume failed");
            }

            if branch_exists(repo_path, &branch_name)? {
                git(
                    repo_path,
                    &[
                        "worktree",
                        "add",
                        worktree_path.to_string_lossy().as_ref(),
                        &branch_name,
                    ],
                )?;
                return Ok(ResumedWorktree {
                    last_commit: last_commit_subject(repo_path, &branch_name),
                    handle: WorktreeHandle {
                        worktree_path,
                        branch_name,
                    },
                    is_existing: true,
                });
            }

            if remote_branch_exists(repo_path, &branch_name)? {
                git(
                    repo_path,
                    &["branch", &branch_name, &format!("origin/{branch_name}")],
                )?;
                git(
                    repo_path,
                    &[
                        "worktree",
                        "add",
                        worktree_path.to_string_lossy().as_ref(),
                        &branch_name,
                    ],
                )?;
                return Ok(ResumedWorktree {
                    last_commit: last_commit_subject(repo_path, &branch_name),
                    handle: WorktreeHandle {
                        worktree_path,
                        branch_name,
                    },
                    is_existing: true,
                });
            }
        }

        // Nothing to resume; fall through to a fresh create (which retakes
        // the repo lock).
        let handle = self.create_worktree(repo_path, task_slug, default_branch)?;
        Ok(ResumedWorktree {
            handle,
            is_existing: false,
            last_commit: None,
        })
    }

    /// Remove a task's worktree. Idempotent: all failures are swallowed.
    /// The branch is never deleted; its lifecycle belongs to the remote.
    pub fn remove_worktree(&self, repo_path: &Path, task_slug: &str) {
        let lock = self.repo_lock(repo_path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let worktree_path = Self::worktree_path(repo_path, task_slug);
        if let Err(e) = git(
            repo_path,
            &[
                "worktree",
                "remove",
                "--force",
                worktree_path.to_string_lossy().as_ref(),
            ],
        ) {
            debug!(
                path = %worktree_path.display(),
                error = %e,
                "worktree remove failed (ignored)"
            );
        }
        // A directory git no longer knows about still blocks future creates.
        if worktree_path.exists() {
            let _ = std::fs::remove_dir_all(&worktree_path);
        }
    }

    /// Prune stale worktree registrations whose directories are gone.
    pub fn prune_worktrees(&self, repo_path: &Path) -> Result<(), WorktreeError> {
        let lock = self.repo_lock(repo_path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        git(repo_path, &["worktree", "prune"]).map(|_| ())
    }

    /// List registered worktree paths, in `git worktree list` order (the
    /// main checkout comes first).
    pub fn list_worktrees(&self, repo_path: &Path) -> Result<Vec<PathBuf>, WorktreeError> {
        let stdout = git(repo_path, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_paths(&stdout))
    }

    /// Ensure `.worktrees/` is ignored in the repository's `.gitignore`,
    /// creating the file if needed. Idempotent.
    pub fn ensure_worktree_gitignore(&self, repo_path: &Path) -> Result<(), WorktreeError> {
        let path = repo_path.join(".gitignore");
        let ignore_line = format!("{WORKTREES_DIR}/");

        let existing = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(WorktreeError::Gitignore { path, source }),
        };

        if existing.lines().any(|line| line.trim() == ignore_line) {
            return Ok(());
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&ignore_line);
        updated.push('\n');

        std::fs::write(&path, updated).map_err(|source| WorktreeError::Gitignore { path, source })
    }

    /// Bring the main checkout to a clean `origin/<default_branch>` base:
    /// fetch, hard-reset, and clean untracked files (sparing `.worktrees/`).
    fn reset_base(&self, repo_path: &Path, default_branch: &str) -> Result<(), WorktreeError> {
        git(repo_path, &["fetch", "origin", default_branch])?;
        git(
            repo_path,
            &["reset", "--hard", &format!("origin/{default_branch}")],
        )?;
        git(repo_path, &["clean", "-fd", "-e", WORKTREES_DIR])?;
        Ok(())
    }
}

impl Default for WorktreeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a git command in `repo_path` and return its stdout.
fn git(repo_path: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .map_err(|source| WorktreeError::GitCommand {
            command: args.join(" "),
            source,
        })?;

    if !output.status.success() {
        return Err(WorktreeError::GitExit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn branch_exists(repo_path: &Path, branch_name: &str) -> Result<bool, WorktreeError> {
    match git(
        repo_path,
        &["rev-parse", "--verify", &format!("refs/heads/{branch_name}")],
    ) {
        Ok(_) => Ok(true),
        Err(WorktreeError::GitExit { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn remote_branch_exists(repo_path: &Path, branch_name: &str) -> Result<bool, WorktreeError> {
    match git(
        repo_path,
        &[
            "rev-parse",
            "--verify",
            &format!("refs/remotes/origin/{branch_name}"),
        ],
    ) {
        Ok(_) => Ok(true),
        Err(WorktreeError::GitExit { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn last_commit_subject(repo_path: &Path, branch_name: &str) -> Option<String> {
    git(repo_path, &["log", "-1", "--pretty=%s", branch_name])
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse `git worktree list --porcelain` output into the worktree paths.
fn parse_worktree_paths(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}
