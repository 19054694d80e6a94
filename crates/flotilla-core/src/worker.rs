//! Ephemeral sandbox worker pool.
//!
//! There are no long-lived workers: each task runs one sandbox which clones
//! the repo, does the work, pushes a branch, and prints a JSON [`Handoff`]
//! as its final stdout line. Everything before that line is progress
//! output, re-emitted as structured traces.
//!
//! The [`Sandbox`] trait is the adapter seam: production uses
//! [`SubprocessSandbox`]; tests can substitute an in-process fake returning
//! a canned handoff. Concurrency is bounded upstream by the planner's
//! semaphore; the pool itself is a stateless dispatcher.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::llm::SandboxLlmConfig;
use crate::task::{Handoff, Task};
use crate::trace::{TraceContext, TraceLevel, Tracer};

/// Errors from a sandbox dispatch.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn sandbox: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("error reading sandbox output: {0}")]
    Io(#[source] std::io::Error),

    #[error("sandbox produced no output (exit code {exit_code:?})")]
    NoOutput { exit_code: Option<i32> },

    #[error("sandbox final line is not a handoff (exit code {exit_code:?}): {line}")]
    FinalLineNotJson {
        line: String,
        exit_code: Option<i32>,
        #[source]
        source: serde_json::Error,
    },

    #[error("sandbox timed out after {0:?} and was killed")]
    Timeout(Duration),
}

/// The JSON payload handed to the sandbox as its single argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub task: Task,
    pub system_prompt: String,
    pub repo_url: String,
    pub git_token: String,
    pub llm_config: SandboxLlmConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

/// Branches whose workers were killed; the merge queue must skip them.
#[derive(Debug, Default)]
pub struct TimedOutBranches(Mutex<HashSet<String>>);

impl TimedOutBranches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, branch: &str) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(branch.to_string());
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(branch)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Milestones recognized in sandbox progress output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    SandboxCreated,
    RepoCloned,
    WorkerStarted,
    BranchPushed,
}

impl WorkerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SandboxCreated => "sandbox_created",
            Self::RepoCloned => "repo_cloned",
            Self::WorkerStarted => "worker_started",
            Self::BranchPushed => "branch_pushed",
        }
    }
}

/// Split a progress line into its phase tag and the remaining text.
///
/// Recognizes `[spawn] ...` and `[worker:<id>] ...` prefixes; anything else
/// is reported with an empty tag.
pub fn parse_phase_tag(line: &str) -> (&str, &str) {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let tag = &rest[..end];
            if tag == "spawn" || tag.starts_with("worker:") {
                return (tag, rest[end + 1..].trim_start());
            }
        }
    }
    ("", trimmed)
}

/// Detect a lifecycle milestone in a progress line.
pub fn detect_phase(line: &str) -> Option<WorkerPhase> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("sandbox") && (lower.contains("created") || lower.contains("creating")) {
        Some(WorkerPhase::SandboxCreated)
    } else if lower.contains("clon") && lower.contains("repo") {
        Some(WorkerPhase::RepoCloned)
    } else if lower.contains("worker") && lower.contains("started") {
        Some(WorkerPhase::WorkerStarted)
    } else if lower.contains("pushed") || (lower.contains("push") && lower.contains("branch")) {
        Some(WorkerPhase::BranchPushed)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// The Sandbox trait
// ---------------------------------------------------------------------------

/// Adapter interface for running one task in an isolated environment.
///
/// Object-safe so the pool can hold `Arc<dyn Sandbox>`; tests substitute an
/// in-process implementation that returns a canned handoff.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;

    /// Run one task to its handoff. Implementations own their timeout
    /// handling and must never outlive the task's wall-clock budget.
    async fn run(&self, payload: &WorkerPayload) -> Result<Handoff, WorkerError>;
}

// Compile-time assertion: Sandbox must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Sandbox) {}
};

// ---------------------------------------------------------------------------
// Subprocess implementation
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn hard_kill(pid: u32) {
    // SAFETY: plain syscall on a pid we own.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Spawns the configured sandbox command with the payload as its final
/// argument and parses the stdout contract.
pub struct SubprocessSandbox {
    /// Command line that launches a sandbox.
    cmd: Vec<String>,
    /// Wall-clock budget per task.
    timeout: Duration,
    timed_out: Arc<TimedOutBranches>,
    tracer: Tracer,
}

impl SubprocessSandbox {
    pub fn new(
        cmd: Vec<String>,
        timeout: Duration,
        timed_out: Arc<TimedOutBranches>,
        tracer: Tracer,
    ) -> Self {
        Self {
            cmd,
            timeout,
            timed_out,
            tracer,
        }
    }

    /// Read stdout to EOF, tracing every non-final line, and return the
    /// final non-blank line (the handoff candidate).
    async fn collect_output(
        &self,
        task: &Task,
        stdout: tokio::process::ChildStdout,
    ) -> Result<Option<String>, WorkerError> {
        let mut lines = BufReader::new(stdout).lines();
        let mut last_line: Option<String> = None;
        let mut last_phase: Option<WorkerPhase> = None;

        while let Some(line) = lines.next_line().await.map_err(WorkerError::Io)? {
            if line.trim().is_empty() {
                continue;
            }
            // The previous candidate was not final after all; emit it as
            // progress now that a newer line supersedes it.
            if let Some(previous) = last_line.replace(line) {
                self.emit_progress(task, &previous, &mut last_phase);
            }
        }

        Ok(last_line)
    }

    fn emit_progress(&self, task: &Task, line: &str, last_phase: &mut Option<WorkerPhase>) {
        // Pure-JSON lines are structured worker events, not progress text.
        if serde_json::from_str::<serde_json::Value>(line).is_ok() {
            return;
        }

        let (tag, text) = parse_phase_tag(line);
        self.tracer.emit(
            TraceLevel::Debug,
            Some(&task.id),
            text,
            Some(serde_json::json!({"phase": tag})),
        );

        if let Some(phase) = detect_phase(line) {
            if *last_phase != Some(phase) {
                *last_phase = Some(phase);
                self.tracer.emit(
                    TraceLevel::Info,
                    Some(&task.id),
                    phase.as_str(),
                    Some(serde_json::json!({"branch": task.branch})),
                );
            }
        }
    }

    async fn kill(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            hard_kill(pid);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
    }
}

#[async_trait]
impl Sandbox for SubprocessSandbox {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn run(&self, payload: &WorkerPayload) -> Result<Handoff, WorkerError> {
        let task = &payload.task;
        let payload_json =
            serde_json::to_string(payload).map_err(|e| WorkerError::Io(e.into()))?;

        let (program, args) = self.cmd.split_first().ok_or_else(|| {
            WorkerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty sandbox command",
            ))
        })?;

        let mut child = Command::new(program)
            .args(args)
            .arg(&payload_json)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        // Drain stderr concurrently so the child never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id = %task_id, "sandbox stderr: {line}");
                }
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            WorkerError::Spawn(std::io::Error::other("sandbox stdout not captured"))
        })?;

        let collect = self.collect_output(task, stdout);
        let result = tokio::time::timeout(self.timeout, async {
            let last_line = collect.await?;
            let status = child.wait().await.map_err(WorkerError::Io)?;
            Ok::<_, WorkerError>((last_line, status.code()))
        })
        .await;

        let (last_line, exit_code) = match result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.kill(&mut child).await;
                return Err(e);
            }
            Err(_elapsed) => {
                warn!(task_id = %task.id, branch = %task.branch, "worker timed out, killing");
                self.kill(&mut child).await;
                self.timed_out.record(&task.branch);
                self.tracer.emit(
                    TraceLevel::Warn,
                    Some(&task.id),
                    "worker timed out",
                    Some(serde_json::json!({"branch": task.branch})),
                );
                return Err(WorkerError::Timeout(self.timeout));
            }
        };

        let line = match last_line {
            Some(line) => line,
            None => return Err(WorkerError::NoOutput { exit_code }),
        };

        serde_json::from_str::<Handoff>(&line).map_err(|source| WorkerError::FinalLineNotJson {
            line: truncate_for_error(&line),
            exit_code,
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// The pool
// ---------------------------------------------------------------------------

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Command line that launches a sandbox; the payload JSON is appended
    /// as the final argument.
    pub sandbox_cmd: Vec<String>,
    /// Wall-clock budget per task.
    pub timeout: Duration,
    pub repo_url: String,
    pub git_token: String,
}

/// Stateless dispatcher: builds the payload and hands it to the sandbox.
pub struct WorkerPool {
    sandbox: Arc<dyn Sandbox>,
    repo_url: String,
    git_token: String,
    timed_out: Arc<TimedOutBranches>,
}

impl WorkerPool {
    /// Production pool around a [`SubprocessSandbox`].
    pub fn new(
        config: WorkerPoolConfig,
        timed_out: Arc<TimedOutBranches>,
        tracer: Tracer,
    ) -> Self {
        let sandbox = Arc::new(SubprocessSandbox::new(
            config.sandbox_cmd,
            config.timeout,
            Arc::clone(&timed_out),
            tracer,
        ));
        Self {
            sandbox,
            repo_url: config.repo_url,
            git_token: config.git_token,
            timed_out,
        }
    }

    /// Pool around any sandbox implementation (tests).
    pub fn with_sandbox(
        sandbox: Arc<dyn Sandbox>,
        repo_url: impl Into<String>,
        git_token: impl Into<String>,
        timed_out: Arc<TimedOutBranches>,
    ) -> Self {
        Self {
            sandbox,
            repo_url: repo_url.into(),
            git_token: git_token.into(),
            timed_out,
        }
    }

    pub fn timed_out_branches(&self) -> &Arc<TimedOutBranches> {
        &self.timed_out
    }

    /// Run one task in a fresh sandbox and return its handoff.
    ///
    /// The caller has already acquired a concurrency permit. On timeout the
    /// sandbox records the task's branch so the merge queue never attempts
    /// it.
    pub async fn assign_task(
        &self,
        task: &Task,
        system_prompt: &str,
        llm_config: SandboxLlmConfig,
        trace: Option<TraceContext>,
    ) -> Result<Handoff, WorkerError> {
        let payload = WorkerPayload {
            task: task.clone(),
            system_prompt: system_prompt.to_string(),
            repo_url: self.repo_url.clone(),
            git_token: self.git_token.clone(),
            llm_config,
            trace,
        };
        debug!(task_id = %task.id, sandbox = self.sandbox.name(), "dispatching to sandbox");
        self.sandbox.run(&payload).await
    }
}

fn truncate_for_error(line: &str) -> String {
    const MAX: usize = 200;
    if line.len() <= MAX {
        line.to_string()
    } else {
        let mut end = MAX;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::HandoffStatus;

    #[test]
    fn phase_tag_parses_spawn_prefix() {
        let (tag, rest) = parse_phase_tag("[spawn] creating sandbox vm-42");
        assert_eq!(tag, "spawn");
        assert_eq!(rest, "creating sandbox vm-42");
    }

    #[test]
    fn phase_tag_parses_worker_prefix() {
        let (tag, rest) = parse_phase_tag("[worker:task-007] cloning repository");
        assert_eq!(tag, "worker:task-007");
        assert_eq!(rest, "cloning repository");
    }

    #[test]
    fn phase_tag_passes_through_untagged_lines() {
        let (tag, rest) = parse_phase_tag("plain progress text");
        assert_eq!(tag, "");
        assert_eq!(rest, "plain progress text");

        // Unknown bracket prefixes are not phase tags.
        let (tag, rest) = parse_phase_tag("[error] something");
        assert_eq!(tag, "");
        assert_eq!(rest, "[error] something");
    }

    #[test]
    fn detects_lifecycle_milestones() {
        assert_eq!(
            detect_phase("[spawn] sandbox created in 2.1s"),
            Some(WorkerPhase::SandboxCreated)
        );
        assert_eq!(
            detect_phase("[worker:t1] cloning repository..."),
            Some(WorkerPhase::RepoCloned)
        );
        assert_eq!(
            detect_phase("[worker:t1] worker started"),
            Some(WorkerPhase::WorkerStarted)
        );
        assert_eq!(
            detect_phase("[worker:t1] branch fleet/t1 pushed"),
            Some(WorkerPhase::BranchPushed)
        );
        assert_eq!(detect_phase("thinking about life"), None);
    }

    #[test]
    fn timed_out_branches_set() {
        let set = TimedOutBranches::new();
        assert!(set.is_empty());
        set.record("fleet/task-001");
        set.record("fleet/task-001");
        assert_eq!(set.len(), 1);
        assert!(set.contains("fleet/task-001"));
        assert!(!set.contains("fleet/task-002"));
    }

    #[test]
    fn payload_serializes_camel_case() {
        let payload = WorkerPayload {
            task: Task::new("t1", "do it", vec!["src/a.rs".into()], "fleet/t1"),
            system_prompt: "be good".into(),
            repo_url: "https://example.com/repo.git".into(),
            git_token: "secret".into(),
            llm_config: SandboxLlmConfig {
                endpoint: "http://localhost:8000".into(),
                model: "m".into(),
                max_tokens: 1024,
                temperature: 0.1,
                api_key: None,
            },
            trace: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"systemPrompt\""));
        assert!(json.contains("\"repoUrl\""));
        assert!(json.contains("\"gitToken\""));
        assert!(json.contains("\"llmConfig\""));
        assert!(json.contains("\"maxTokens\""));
    }

    /// In-process sandbox returning a canned handoff, proving the trait
    /// seam the pool is built around.
    struct CannedSandbox;

    #[async_trait]
    impl Sandbox for CannedSandbox {
        fn name(&self) -> &str {
            "canned"
        }

        async fn run(&self, payload: &WorkerPayload) -> Result<Handoff, WorkerError> {
            let mut handoff =
                Handoff::synthesized_failure(&payload.task.id, "unused");
            handoff.status = HandoffStatus::Complete;
            handoff.summary = "canned".into();
            Ok(handoff)
        }
    }

    #[tokio::test]
    async fn pool_delegates_to_sandbox() {
        let pool = WorkerPool::with_sandbox(
            Arc::new(CannedSandbox),
            "https://example.com/repo.git",
            "",
            Arc::new(TimedOutBranches::new()),
        );
        let task = Task::new("t1", "do it", vec![], "fleet/t1");
        let handoff = pool
            .assign_task(
                &task,
                "prompt",
                SandboxLlmConfig {
                    endpoint: "http://localhost".into(),
                    model: "m".into(),
                    max_tokens: 1,
                    temperature: 0.0,
                    api_key: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(handoff.task_id, "t1");
        assert_eq!(handoff.status, HandoffStatus::Complete);
    }
}
