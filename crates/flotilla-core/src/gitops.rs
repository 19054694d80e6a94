//! Serialized git access to the target checkout.
//!
//! The working tree and index are process-global: concurrent git commands
//! corrupt state and make merge outcomes nondeterministic. Every local git
//! invocation therefore goes through a [`GitGuard`], which can only be
//! obtained by locking the [`GitCheckout`]'s internal mutex. The mutex is
//! fair (FIFO waiters) and the guard releases on every exit path, including
//! cancellation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};

/// Errors from git subprocess invocations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The checkout path is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The subprocess could not be spawned or awaited.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command exited non-zero.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Captured output of a completed git command.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// One `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PorcelainEntry {
    /// The two-character index/worktree status code (e.g. `UU`, ` M`).
    pub code: String,
    pub path: String,
}

impl PorcelainEntry {
    /// Whether this entry indicates an unmerged (conflicted) path.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.code.as_str(),
            "UU" | "AA" | "DD" | "AU" | "UA" | "DU" | "UD"
        )
    }
}

/// Parse `git status --porcelain` output into entries.
pub fn parse_porcelain(output: &str) -> Vec<PorcelainEntry> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let code = line[..2].to_string();
            // Renames show as "old -> new"; keep the destination path.
            let rest = &line[3..];
            let path = match rest.split_once(" -> ") {
                Some((_, new)) => new,
                None => rest,
            };
            PorcelainEntry {
                code,
                path: path.to_string(),
            }
        })
        .collect()
}

/// Handle on the local target-repo checkout.
///
/// Cheap to share via `Arc`; the embedded mutex serializes all git
/// subcommands across the merge queue, reconciler, and planner snapshots.
#[derive(Debug)]
pub struct GitCheckout {
    repo_path: PathBuf,
    lock: Mutex<()>,
}

impl GitCheckout {
    /// Open a checkout, verifying the path is a git repository.
    pub async fn open(repo_path: impl Into<PathBuf>) -> Result<Self, GitError> {
        let repo_path = repo_path.into();
        let checkout = Self {
            repo_path,
            lock: Mutex::new(()),
        };
        let is_repo = {
            let guard = checkout.lock().await;
            guard.run(&["rev-parse", "--git-dir"]).await.is_ok()
        };
        if !is_repo {
            return Err(GitError::NotAGitRepo(checkout.repo_path));
        }
        Ok(checkout)
    }

    /// Path of the checkout root.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Acquire the git mutex. All git subcommands hang off the returned
    /// guard, so holding it is the only way to touch the checkout.
    pub async fn lock(&self) -> GitGuard<'_> {
        let permit = self.lock.lock().await;
        GitGuard {
            repo_path: &self.repo_path,
            _permit: permit,
        }
    }
}

/// Exclusive access to the checkout for the guard's lifetime.
pub struct GitGuard<'a> {
    repo_path: &'a Path,
    _permit: MutexGuard<'a, ()>,
}

impl GitGuard<'_> {
    /// Run a git subcommand in the checkout, capturing output.
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let command_label = args.join(" ");
        let output = Command::new("git")
            .args(args)
            .current_dir(self.repo_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GitError::Spawn {
                command: format!("git {command_label}"),
                source: e,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(GitError::Exit {
                command: command_label,
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(GitOutput { stdout, stderr })
    }

    /// Run a non-git oracle command (e.g. a build or test) in the checkout
    /// while still holding the repo lock. Non-zero exit is not an error
    /// here; callers inspect the returned status and output.
    pub async fn run_tool(&self, argv: &[String]) -> Result<(bool, String), GitError> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| GitError::Spawn {
                command: "<empty command>".into(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            })?;

        let output = Command::new(program)
            .args(rest)
            .current_dir(self.repo_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GitError::Spawn {
                command: argv.join(" "),
                source: e,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), combined))
    }

    pub async fn fetch(&self, remote: &str, branch: &str) -> Result<GitOutput, GitError> {
        self.run(&["fetch", remote, branch]).await
    }

    pub async fn checkout(&self, branch: &str) -> Result<GitOutput, GitError> {
        self.run(&["checkout", branch]).await
    }

    pub async fn merge_ff_only(&self, rev: &str) -> Result<GitOutput, GitError> {
        self.run(&["merge", "--ff-only", rev]).await
    }

    pub async fn merge_no_ff(&self, rev: &str, message: &str) -> Result<GitOutput, GitError> {
        self.run(&["merge", "--no-ff", "-m", message, rev]).await
    }

    pub async fn merge_abort(&self) -> Result<GitOutput, GitError> {
        self.run(&["merge", "--abort"]).await
    }

    pub async fn rebase(&self, onto: &str) -> Result<GitOutput, GitError> {
        self.run(&["rebase", onto]).await
    }

    pub async fn rebase_abort(&self) -> Result<GitOutput, GitError> {
        self.run(&["rebase", "--abort"]).await
    }

    pub async fn status_porcelain(&self) -> Result<Vec<PorcelainEntry>, GitError> {
        let out = self.run(&["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&out.stdout))
    }

    pub async fn diff_shortstat(&self) -> Result<String, GitError> {
        let out = self.run(&["diff", "--shortstat"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Subjects of the most recent `n` commits, newest first.
    pub async fn log_subjects(&self, n: usize) -> Result<Vec<String>, GitError> {
        let count = format!("-{n}");
        let out = self.run(&["log", &count, "--format=%s"]).await?;
        Ok(out.stdout.lines().map(|s| s.to_string()).collect())
    }

    /// All tracked paths in the checkout.
    pub async fn ls_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["ls-files"]).await?;
        Ok(out.stdout.lines().map(|s| s.to_string()).collect())
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Delete a local branch, ignoring failures (it may not exist).
    pub async fn delete_branch(&self, branch: &str) {
        let _ = self.run(&["branch", "-D", branch]).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
