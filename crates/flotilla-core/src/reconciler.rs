//! Periodic repository healthcheck.
//!
//! Every sweep runs the configured build/test oracle commands against the
//! checkout (holding the git guard so the merge queue cannot mutate the
//! tree mid-check). When a command fails, the error output is grouped by
//! file, summarized for the LLM with the reconciler prompt, and the
//! returned fix tasks (priority 1, bounded) are injected into the planner.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gitops::GitCheckout;
use crate::llm::{ChatMessage, CompletionOverrides, LlmClient};
use crate::planner::parse::{self, PlanParse};
use crate::prompts::SystemPrompts;
use crate::task::Task;

/// Most error lines kept per file group.
const MAX_LINES_PER_GROUP: usize = 10;
/// Most file groups included in a report.
const MAX_GROUPS: usize = 20;

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Oracle commands (argv form), e.g. a typecheck and a test run. An
    /// empty list disables the reconciler.
    pub checks: Vec<Vec<String>>,
    pub max_fix_tasks: usize,
    pub branch_prefix: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            checks: Vec::new(),
            max_fix_tasks: 5,
            branch_prefix: "fleet/".to_string(),
        }
    }
}

/// One failed oracle command.
#[derive(Debug, Clone)]
pub struct CheckFailure {
    pub command: String,
    pub output: String,
}

/// Receives the fix tasks; returns false when the task was a duplicate.
pub type InjectFn = Arc<dyn Fn(Task) -> bool + Send + Sync>;

/// The periodic reconciler. Share via `Arc`.
pub struct Reconciler {
    git: Arc<GitCheckout>,
    llm: Arc<LlmClient>,
    prompts: Arc<SystemPrompts>,
    inject: InjectFn,
    config: ReconcilerConfig,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    fix_counter: AtomicUsize,
}

impl Reconciler {
    pub fn new(
        git: Arc<GitCheckout>,
        llm: Arc<LlmClient>,
        prompts: Arc<SystemPrompts>,
        inject: InjectFn,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            git,
            llm,
            prompts,
            inject,
            config,
            cancel: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
            fix_counter: AtomicUsize::new(0),
        }
    }

    /// Start the periodic sweep. A reconciler with no checks configured
    /// never starts.
    pub async fn start(self: &Arc<Self>) {
        if self.config.checks.is_empty() {
            info!("reconciler disabled: no oracle commands configured");
            return;
        }
        let mut slot = self.handle.lock().await;
        if slot.is_some() {
            return;
        }
        let reconciler = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = self.config.interval;
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match reconciler.sweep().await {
                            Ok(injected) if injected > 0 => {
                                info!(injected, "reconciler injected fix tasks");
                            }
                            Ok(_) => {}
                            // The next sweep retries; an LLM hiccup is not fatal.
                            Err(e) => warn!(error = %e, "reconciler sweep failed"),
                        }
                    }
                }
            }
        }));
    }

    /// Stop the periodic sweep and wait for it. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// One sweep: run the oracle, propose fixes, inject them.
    pub async fn sweep(&self) -> Result<usize> {
        let failures = self.run_checks().await?;
        if failures.is_empty() {
            return Ok(0);
        }
        let fixes = self.propose_fixes(&failures).await?;
        let mut injected = 0;
        for task in fixes {
            if (self.inject)(task) {
                injected += 1;
            }
        }
        Ok(injected)
    }

    /// Run every oracle command under the git guard, collecting failures.
    pub async fn run_checks(&self) -> Result<Vec<CheckFailure>> {
        let guard = self.git.lock().await;
        let mut failures = Vec::new();
        for check in &self.config.checks {
            let label = check.join(" ");
            let (ok, output) = guard
                .run_tool(check)
                .await
                .with_context(|| format!("failed to run oracle command {label:?}"))?;
            if !ok {
                warn!(command = %label, "oracle command failed");
                failures.push(CheckFailure {
                    command: label,
                    output,
                });
            }
        }
        Ok(failures)
    }

    /// Ask the LLM for fix tasks from a compact failure report.
    pub async fn propose_fixes(&self, failures: &[CheckFailure]) -> Result<Vec<Task>> {
        let report = build_report(failures);
        let messages = [
            ChatMessage::system(&self.prompts.reconciler),
            ChatMessage::user(report),
        ];
        let completion = self
            .llm
            .complete(&messages, CompletionOverrides::default())
            .await
            .context("reconciler LLM call failed")?;

        let raw_tasks = match parse::parse_plan_response(&completion.content) {
            PlanParse::Ok { tasks, .. } | PlanParse::Partial { tasks, .. } => tasks,
            PlanParse::Empty => Vec::new(),
        };

        Ok(raw_tasks
            .into_iter()
            .take(self.config.max_fix_tasks)
            .map(|mut raw| {
                if raw.id.as_deref().is_none_or(|id| id.trim().is_empty()) {
                    let n = self.fix_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    raw.id = Some(format!("fix-{n:03}"));
                }
                let mut task =
                    parse::materialize(raw, 0, &self.config.branch_prefix);
                task.priority = 1;
                task
            })
            .collect())
    }
}

/// Group raw oracle output by file using a `path:line` heuristic.
pub fn group_errors(output: &str) -> BTreeMap<String, Vec<String>> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let regex = PATTERN.get_or_init(|| {
        Regex::new(r"([A-Za-z0-9_./\\-]+\.[A-Za-z]{1,4}):(\d+)").expect("valid regex")
    });

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = regex
            .captures(trimmed)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "general".to_string());
        let entries = groups.entry(key).or_default();
        if entries.len() < MAX_LINES_PER_GROUP {
            entries.push(trimmed.to_string());
        }
    }
    groups
}

/// Render a compact failure report for the LLM.
pub fn build_report(failures: &[CheckFailure]) -> String {
    let mut out = String::with_capacity(2048);
    out.push_str("The repository healthcheck failed.\n");
    for failure in failures {
        out.push_str(&format!("\n## Command: {}\n", failure.command));
        for (file, lines) in group_errors(&failure.output).into_iter().take(MAX_GROUPS) {
            out.push_str(&format!("\n### {file}\n"));
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }
    out.push_str("\nRespond with a JSON array of fix tasks.\n");
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
