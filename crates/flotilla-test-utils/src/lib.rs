//! Shared test utilities for flotilla integration tests.
//!
//! Provides throwaway git repositories (with a bare "origin" so fetch and
//! push behave like production), fake sandbox scripts that speak the
//! worker stdout contract, and canned handoffs.

use std::path::{Path, PathBuf};
use std::process::Command;

use flotilla_core::task::{Handoff, HandoffStatus, WorkerMetrics};
use tempfile::TempDir;

/// Run a git command in `dir`, panicking on failure. Test-only.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    if !output.status.success() {
        panic!(
            "git {args:?} failed in {}:\n{}",
            dir.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn configure_identity(dir: &Path) {
    git(dir, &["config", "user.email", "fleet@localhost"]);
    git(dir, &["config", "user.name", "fleet"]);
}

/// Initialize a standalone repo on branch `main` with one commit.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    configure_identity(dir);
    std::fs::write(dir.join("README.md"), "# fixture\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial commit"]);
}

/// Write a file and commit it.
pub fn commit_file(dir: &Path, rel_path: &str, content: &str, message: &str) {
    let path = dir.join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
}

/// A bare origin plus a working checkout cloned from it.
///
/// The checkout plays the orchestrator's target repo; worker branches are
/// pushed to the origin from separate clones, exactly as sandboxes do.
pub struct RemotePair {
    pub root: TempDir,
    pub origin: PathBuf,
    pub checkout: PathBuf,
}

impl RemotePair {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let origin = root.path().join("origin.git");
        let checkout = root.path().join("checkout");

        std::fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "--bare", "-b", "main"]);

        git(
            root.path(),
            &["clone", origin.to_str().unwrap(), checkout.to_str().unwrap()],
        );
        configure_identity(&checkout);
        std::fs::write(checkout.join("README.md"), "# fixture\n").unwrap();
        git(&checkout, &["checkout", "-b", "main"]);
        git(&checkout, &["add", "-A"]);
        git(&checkout, &["commit", "-m", "initial commit"]);
        git(&checkout, &["push", "-u", "origin", "main"]);

        Self {
            root,
            origin,
            checkout,
        }
    }

    /// Create `branch` off origin/main in a fresh clone, commit the given
    /// files, and push it. The clone is discarded.
    pub fn push_branch(&self, branch: &str, files: &[(&str, &str)], message: &str) {
        let clone_dir = self
            .root
            .path()
            .join(format!("worker-{}", branch.replace('/', "--")));
        git(
            self.root.path(),
            &[
                "clone",
                self.origin.to_str().unwrap(),
                clone_dir.to_str().unwrap(),
            ],
        );
        configure_identity(&clone_dir);
        git(&clone_dir, &["checkout", "-b", branch, "origin/main"]);
        for (rel_path, content) in files {
            let path = clone_dir.join(rel_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, content).unwrap();
        }
        git(&clone_dir, &["add", "-A"]);
        git(&clone_dir, &["commit", "-m", message]);
        git(&clone_dir, &["push", "origin", branch]);
        std::fs::remove_dir_all(&clone_dir).ok();
    }

    /// Advance origin/main directly (simulates another merged branch).
    pub fn advance_main(&self, rel_path: &str, content: &str, message: &str) {
        let clone_dir = self.root.path().join("mainline-advance");
        git(
            self.root.path(),
            &[
                "clone",
                self.origin.to_str().unwrap(),
                clone_dir.to_str().unwrap(),
            ],
        );
        configure_identity(&clone_dir);
        git(&clone_dir, &["checkout", "main"]);
        let path = clone_dir.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        git(&clone_dir, &["add", "-A"]);
        git(&clone_dir, &["commit", "-m", message]);
        git(&clone_dir, &["push", "origin", "main"]);
        std::fs::remove_dir_all(&clone_dir).ok();
    }

    /// Subjects on main in the checkout, newest first.
    pub fn main_log(&self) -> Vec<String> {
        git(&self.checkout, &["checkout", "main"]);
        git(&self.checkout, &["log", "--format=%s"])
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Default for RemotePair {
    fn default() -> Self {
        Self::new()
    }
}

/// Write an executable shell script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// A fake sandbox that prints progress lines and then a handoff.
///
/// Returns the script path; use it as the worker pool's sandbox command.
pub fn fake_sandbox(dir: &Path, name: &str, handoff: &Handoff, sleep_secs: u32) -> PathBuf {
    let handoff_json = serde_json::to_string(handoff).unwrap();
    let body = format!(
        "echo '[spawn] sandbox created'\n\
         echo '[worker:{id}] cloning repository'\n\
         echo '[worker:{id}] worker started'\n\
         sleep {sleep_secs}\n\
         echo '[worker:{id}] branch pushed'\n\
         echo '{handoff}'\n",
        id = handoff.task_id,
        handoff = handoff_json.replace('\'', "'\\''"),
    );
    write_script(dir, name, &body)
}

/// A canned handoff for tests.
pub fn canned_handoff(task_id: &str, status: HandoffStatus, files: &[&str]) -> Handoff {
    Handoff {
        task_id: task_id.to_string(),
        status,
        summary: format!("worker finished task {task_id}"),
        files_changed: files.iter().map(|s| s.to_string()).collect(),
        diff: String::new(),
        concerns: Vec::new(),
        suggestions: Vec::new(),
        metrics: WorkerMetrics {
            lines_added: 5,
            files_modified: files.len() as u64,
            tokens_used: 1234,
            tool_call_count: 7,
            duration_ms: 1500,
            ..Default::default()
        },
    }
}
