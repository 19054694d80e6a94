//! Background merge queue: lands worker branches on the mainline.
//!
//! A strictly-FIFO consumer over an unbounded channel. Each item is fetched
//! from the remote and applied to the main branch under one [`GitGuard`],
//! using the configured strategy. Conflicts are detected from porcelain
//! unmerged codes, aborted, and reported; they are never retried and do not
//! block later items. Branches on the timed-out list are skipped outright.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gitops::{GitCheckout, GitError, GitGuard};
use crate::worker::TimedOutBranches;

/// How branches are applied to the mainline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    FastForward,
    Rebase,
    MergeCommit,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FastForward => "fast-forward",
            Self::Rebase => "rebase",
            Self::MergeCommit => "merge-commit",
        };
        f.write_str(s)
    }
}

/// Error returned when parsing an invalid [`MergeStrategy`] string.
#[derive(Debug, Clone, Error)]
#[error("invalid merge strategy: {0:?} (expected fast-forward, rebase, or merge-commit)")]
pub struct StrategyParseError(pub String);

impl FromStr for MergeStrategy {
    type Err = StrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast-forward" => Ok(Self::FastForward),
            "rebase" => Ok(Self::Rebase),
            "merge-commit" => Ok(Self::MergeCommit),
            other => Err(StrategyParseError(other.to_owned())),
        }
    }
}

/// Classified result of one merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// Branch landed on the mainline.
    Merged,
    /// Unmerged paths were found; the merge/rebase was aborted.
    Conflict,
    /// Fast-forward refused because main diverged. Not a conflict.
    Diverged,
    /// Branch was on the timed-out list and never attempted.
    Skipped,
    /// A git command failed for another reason.
    Failed,
}

/// Reported to `on_merge_result` for every consumed item.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub branch: String,
    pub status: MergeStatus,
    pub success: bool,
    pub message: String,
    pub conflicts: Vec<String>,
}

/// Reported to `on_conflict` when unmerged paths are detected.
#[derive(Debug, Clone)]
pub struct ConflictEvent {
    pub branch: String,
    pub conflicting_files: Vec<String>,
}

type ResultCallback = Box<dyn Fn(&MergeOutcome) + Send + Sync>;
type ConflictCallback = Box<dyn Fn(&ConflictEvent) + Send + Sync>;

#[derive(Default)]
struct MergeCallbacks {
    on_result: RwLock<Vec<ResultCallback>>,
    on_conflict: RwLock<Vec<ConflictCallback>>,
}

struct MergeWorker {
    git: Arc<GitCheckout>,
    remote: String,
    main_branch: String,
    strategy: MergeStrategy,
    timed_out: Arc<TimedOutBranches>,
    callbacks: MergeCallbacks,
}

/// The background merge queue. Share via `Arc`.
pub struct MergeQueue {
    worker: Arc<MergeWorker>,
    tx: mpsc::UnboundedSender<String>,
    rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MergeQueue {
    pub fn new(
        git: Arc<GitCheckout>,
        main_branch: impl Into<String>,
        strategy: MergeStrategy,
        timed_out: Arc<TimedOutBranches>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            worker: Arc::new(MergeWorker {
                git,
                remote: "origin".to_string(),
                main_branch: main_branch.into(),
                strategy,
                timed_out,
                callbacks: MergeCallbacks::default(),
            }),
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Register a callback for every merge outcome.
    pub fn on_merge_result(&self, callback: impl Fn(&MergeOutcome) + Send + Sync + 'static) {
        self.worker
            .callbacks
            .on_result
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Register a callback for merge conflicts.
    pub fn on_conflict(&self, callback: impl Fn(&ConflictEvent) + Send + Sync + 'static) {
        self.worker
            .callbacks
            .on_conflict
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Append a branch to the queue. FIFO order is preserved.
    pub fn enqueue(&self, branch: &str) {
        if self.tx.send(branch.to_string()).is_err() {
            warn!(branch, "merge queue consumer is gone; branch dropped");
        }
    }

    /// Start the background consumer. Idempotent: a second call while
    /// running is a no-op.
    pub async fn start_background(&self) {
        let Some(mut rx) = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let worker = Arc::clone(&self.worker);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = rx.recv() => {
                        let Some(branch) = item else { break };
                        worker.consume(&branch).await;
                    }
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Stop the background consumer and wait for it to exit. Idempotent.
    pub async fn stop_background(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl MergeWorker {
    async fn consume(&self, branch: &str) {
        let outcome = self.process(branch).await;
        info!(
            branch,
            status = ?outcome.status,
            success = outcome.success,
            "merge queue item processed"
        );

        if outcome.status == MergeStatus::Conflict {
            let event = ConflictEvent {
                branch: branch.to_string(),
                conflicting_files: outcome.conflicts.clone(),
            };
            let callbacks = self
                .callbacks
                .on_conflict
                .read()
                .unwrap_or_else(|e| e.into_inner());
            for cb in callbacks.iter() {
                cb(&event);
            }
        }

        let callbacks = self
            .callbacks
            .on_result
            .read()
            .unwrap_or_else(|e| e.into_inner());
        for cb in callbacks.iter() {
            cb(&outcome);
        }
    }

    async fn process(&self, branch: &str) -> MergeOutcome {
        if self.timed_out.contains(branch) {
            return MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Skipped,
                success: false,
                message: "worker timed out; branch skipped".to_string(),
                conflicts: Vec::new(),
            };
        }

        let guard = self.git.lock().await;
        match self.apply(&guard, branch).await {
            Ok(outcome) => outcome,
            Err(e) => MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Failed,
                success: false,
                message: e.to_string(),
                conflicts: Vec::new(),
            },
        }
    }

    /// Fetch and apply one branch while holding the git guard.
    async fn apply(
        &self,
        guard: &GitGuard<'_>,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        guard.fetch(&self.remote, branch).await?;
        guard.checkout(&self.main_branch).await?;

        let dirty = guard.status_porcelain().await?;
        if !dirty.is_empty() {
            return Ok(MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Failed,
                success: false,
                message: format!(
                    "working tree not clean ({} entries); refusing to merge",
                    dirty.len()
                ),
                conflicts: Vec::new(),
            });
        }

        match self.strategy {
            MergeStrategy::FastForward => self.apply_fast_forward(guard, branch).await,
            MergeStrategy::Rebase => self.apply_rebase(guard, branch).await,
            MergeStrategy::MergeCommit => self.apply_merge_commit(guard, branch).await,
        }
    }

    async fn apply_fast_forward(
        &self,
        guard: &GitGuard<'_>,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        match guard.merge_ff_only("FETCH_HEAD").await {
            Ok(_) => Ok(merged(branch)),
            Err(GitError::Exit { stderr, .. }) => Ok(MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Diverged,
                success: false,
                message: format!("fast-forward not possible: {}", stderr.trim()),
                conflicts: Vec::new(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn apply_rebase(
        &self,
        guard: &GitGuard<'_>,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        let temp = format!("merge-queue/{}", branch.replace('/', "--"));
        guard.run(&["checkout", "-b", &temp, "FETCH_HEAD"]).await?;

        if let Err(rebase_err) = guard.rebase(&self.main_branch).await {
            let conflicts = conflict_paths(guard).await;
            let _ = guard.rebase_abort().await;
            let _ = guard.checkout(&self.main_branch).await;
            guard.delete_branch(&temp).await;
            return Ok(if conflicts.is_empty() {
                failed(branch, rebase_err.to_string())
            } else {
                conflicted(branch, conflicts)
            });
        }

        guard.checkout(&self.main_branch).await?;
        let result = guard.merge_ff_only(&temp).await;
        guard.delete_branch(&temp).await;
        match result {
            Ok(_) => Ok(merged(branch)),
            Err(e) => Ok(failed(branch, e.to_string())),
        }
    }

    async fn apply_merge_commit(
        &self,
        guard: &GitGuard<'_>,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        let message = format!("Merge branch '{branch}' into {}", self.main_branch);
        match guard.merge_no_ff("FETCH_HEAD", &message).await {
            Ok(_) => Ok(merged(branch)),
            Err(merge_err) => {
                let conflicts = conflict_paths(guard).await;
                if conflicts.is_empty() {
                    Ok(failed(branch, merge_err.to_string()))
                } else {
                    let _ = guard.merge_abort().await;
                    Ok(conflicted(branch, conflicts))
                }
            }
        }
    }
}

async fn conflict_paths(guard: &GitGuard<'_>) -> Vec<String> {
    match guard.status_porcelain().await {
        Ok(entries) => entries
            .into_iter()
            .filter(|e| e.is_conflict())
            .map(|e| e.path)
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn merged(branch: &str) -> MergeOutcome {
    MergeOutcome {
        branch: branch.to_string(),
        status: MergeStatus::Merged,
        success: true,
        message: "merged".to_string(),
        conflicts: Vec::new(),
    }
}

fn failed(branch: &str, message: String) -> MergeOutcome {
    MergeOutcome {
        branch: branch.to_string(),
        status: MergeStatus::Failed,
        success: false,
        message,
        conflicts: Vec::new(),
    }
}

fn conflicted(branch: &str, conflicts: Vec<String>) -> MergeOutcome {
    MergeOutcome {
        branch: branch.to_string(),
        status: MergeStatus::Conflict,
        success: false,
        message: format!("{} conflicting path(s)", conflicts.len()),
        conflicts,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_known_values() {
        assert_eq!(
            "fast-forward".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::FastForward
        );
        assert_eq!(
            "rebase".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::Rebase
        );
        assert_eq!(
            "merge-commit".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::MergeCommit
        );
        assert!("octopus".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn strategy_display_round_trips() {
        for strategy in [
            MergeStrategy::FastForward,
            MergeStrategy::Rebase,
            MergeStrategy::MergeCommit,
        ] {
            let parsed: MergeStrategy = strategy.to_string().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
    }
}
