//! Orchestrator shell: configuration, wiring, and lifecycle.
//!
//! Builds every subsystem from environment-driven config, wires the
//! cross-component callbacks (queue transitions into traces, merge results
//! into monitor counters, conflicts into bounded fix-task injection), and
//! owns the ordered shutdown sequence.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gitops::GitCheckout;
use crate::llm::{EndpointConfig, LlmClient, LlmParams};
use crate::merge::{MergeQueue, MergeStatus, MergeStrategy};
use crate::monitor::Monitor;
use crate::planner::{PlanSummary, Planner, PlannerConfig};
use crate::prompts::SystemPrompts;
use crate::queue::TaskQueue;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::subplan::{SubPlanner, SubPlannerConfig};
use crate::task::{Task, branch_name};
use crate::trace::{TraceLevel, Tracer};
use crate::worker::{TimedOutBranches, WorkerPool, WorkerPoolConfig};

/// Conflict-fix tasks injected per run, at most.
const MAX_CONFLICT_FIXES: usize = 10;
/// Conflicting files targeted per fix task.
const CONFLICT_FIX_SCOPE: usize = 5;

/// Complete orchestrator configuration, resolved from the environment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub llm_endpoints: Vec<EndpointConfig>,
    pub llm_params: LlmParams,
    pub repo_url: String,
    pub git_token: String,
    pub target_repo_path: PathBuf,
    pub main_branch: String,
    pub merge_strategy: MergeStrategy,
    pub max_workers: usize,
    pub worker_timeout: Duration,
    pub sandbox_cmd: Vec<String>,
    pub prompts_dir: PathBuf,
    pub branch_prefix: String,
    pub planner: PlannerConfig,
    pub subplanner: SubPlannerConfig,
    pub reconciler: ReconcilerConfig,
    pub monitor_tick: Duration,
    pub probe_timeout: Duration,
    pub ndjson_log_path: Option<PathBuf>,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

/// Default prompts directory: `$XDG_CONFIG_HOME/flotilla/prompts` or
/// `~/.config/flotilla/prompts`.
pub fn default_prompts_dir() -> PathBuf {
    if let Some(xdg) = env_var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("flotilla").join("prompts");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("flotilla")
        .join("prompts")
}

/// Resolve just the LLM endpoint list and parameters from the environment.
///
/// Split out so diagnostics (`flotilla probe`) can build a client without
/// the git-side configuration.
pub fn llm_config_from_env() -> Result<(Vec<EndpointConfig>, LlmParams)> {
    let endpoints_raw = env_var("LLM_ENDPOINTS")
        .context("LLM_ENDPOINTS must be set (JSON array of {name, endpoint, apiKey?, weight})")?;
    let llm_endpoints: Vec<EndpointConfig> =
        serde_json::from_str(&endpoints_raw).context("failed to parse LLM_ENDPOINTS")?;
    if llm_endpoints.is_empty() {
        bail!("LLM_ENDPOINTS is empty");
    }

    let llm_params = LlmParams {
        model: env_var("LLM_MODEL").unwrap_or_else(|| "default".to_string()),
        max_tokens: env_parse("LLM_MAX_TOKENS", 8192u32)?,
        temperature: env_parse("LLM_TEMPERATURE", 0.2f32)?,
        ..LlmParams::default()
    };

    Ok((llm_endpoints, llm_params))
}

impl OrchestratorConfig {
    /// Resolve the full configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let (llm_endpoints, llm_params) = llm_config_from_env()?;

        let repo_url = env_var("GIT_REPO_URL").context("GIT_REPO_URL must be set")?;
        let git_token = env_var("GIT_TOKEN").unwrap_or_default();
        let target_repo_path = PathBuf::from(
            env_var("TARGET_REPO_PATH").context("TARGET_REPO_PATH must be set")?,
        );

        let main_branch = env_var("MAIN_BRANCH").unwrap_or_else(|| "main".to_string());
        let merge_strategy = env_parse("MERGE_STRATEGY", MergeStrategy::FastForward)?;
        let max_workers = env_parse("MAX_WORKERS", 100usize)?;
        let worker_timeout = Duration::from_secs(env_parse("WORKER_TIMEOUT", 1800u64)?);
        let branch_prefix = env_var("BRANCH_PREFIX").unwrap_or_else(|| "fleet/".to_string());

        let sandbox_cmd: Vec<String> = env_var("SANDBOX_CMD")
            .unwrap_or_else(|| "flotilla-sandbox".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let prompts_dir = env_var("PROMPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_prompts_dir);

        let planner = PlannerConfig {
            max_workers,
            max_iterations: env_parse("PLANNER_MAX_ITERATIONS", 1000u32)?,
            loop_sleep: Duration::from_millis(env_parse("LOOP_SLEEP_MS", 500u64)?),
            min_handoffs_for_replan: env_parse("MIN_HANDOFFS_FOR_REPLAN", 3usize)?,
            backoff_base: Duration::from_millis(env_parse("BACKOFF_BASE_MS", 2000u64)?),
            backoff_max: Duration::from_millis(env_parse("BACKOFF_MAX_MS", 30000u64)?),
            max_consecutive_errors: env_parse("MAX_CONSECUTIVE_ERRORS", 10u32)?,
            branch_prefix: branch_prefix.clone(),
        };

        let subplanner = SubPlannerConfig {
            branch_prefix: branch_prefix.clone(),
            ..SubPlannerConfig::default()
        };

        let reconciler_checks: Vec<Vec<String>> = match env_var("RECONCILER_CHECKS") {
            Some(raw) => serde_json::from_str(&raw)
                .context("failed to parse RECONCILER_CHECKS (JSON array of argv arrays)")?,
            None => Vec::new(),
        };
        let reconciler = ReconcilerConfig {
            interval: Duration::from_secs(env_parse("RECONCILER_INTERVAL_SECS", 300u64)?),
            checks: reconciler_checks,
            max_fix_tasks: env_parse("MAX_FIX_TASKS", 5usize)?,
            branch_prefix: branch_prefix.clone(),
        };

        Ok(Self {
            llm_endpoints,
            llm_params,
            repo_url,
            git_token,
            target_repo_path,
            main_branch,
            merge_strategy,
            max_workers,
            worker_timeout,
            sandbox_cmd,
            prompts_dir,
            branch_prefix,
            planner,
            subplanner,
            reconciler,
            monitor_tick: Duration::from_millis(env_parse("MONITOR_TICK_MS", 1000u64)?),
            probe_timeout: Duration::from_secs(env_parse("LLM_PROBE_TIMEOUT_SECS", 60u64)?),
            ndjson_log_path: env_var("NDJSON_LOG_PATH").map(PathBuf::from),
        })
    }
}

/// The wired orchestrator.
pub struct Orchestrator {
    llm: Arc<LlmClient>,
    queue: Arc<TaskQueue>,
    monitor: Arc<Monitor>,
    merge: Arc<MergeQueue>,
    planner: Arc<Planner>,
    reconciler: Arc<Reconciler>,
    timed_out: Arc<TimedOutBranches>,
    probe_timeout: Duration,
    shutdown_started: AtomicBool,
}

impl Orchestrator {
    /// Build and wire every subsystem.
    pub async fn new(config: OrchestratorConfig) -> Result<Self> {
        let agent_id = format!("orchestrator-{}", Uuid::new_v4().simple());
        let tracer = match &config.ndjson_log_path {
            Some(path) => {
                let file = std::fs::File::create(path).with_context(|| {
                    format!("failed to create NDJSON log at {}", path.display())
                })?;
                Tracer::new(Box::new(file), &agent_id, "orchestrator")
            }
            None => Tracer::stdout(&agent_id, "orchestrator"),
        };

        let git = Arc::new(
            GitCheckout::open(&config.target_repo_path)
                .await
                .with_context(|| {
                    format!(
                        "target repo checkout not usable: {}",
                        config.target_repo_path.display()
                    )
                })?,
        );

        let llm = Arc::new(LlmClient::new(
            config.llm_endpoints.clone(),
            config.llm_params.clone(),
        )?);
        let queue = Arc::new(TaskQueue::new());
        let monitor = Arc::new(Monitor::new(config.monitor_tick, config.worker_timeout));
        let timed_out = Arc::new(TimedOutBranches::new());
        let prompts = Arc::new(SystemPrompts::load_or_builtin(&config.prompts_dir));
        let limiter = Arc::new(Semaphore::new(config.max_workers));

        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                sandbox_cmd: config.sandbox_cmd.clone(),
                timeout: config.worker_timeout,
                repo_url: config.repo_url.clone(),
                git_token: config.git_token.clone(),
            },
            Arc::clone(&timed_out),
            tracer.with_identity(&agent_id, "worker-pool"),
        ));

        let merge = Arc::new(MergeQueue::new(
            Arc::clone(&git),
            config.main_branch.clone(),
            config.merge_strategy,
            Arc::clone(&timed_out),
        ));

        let subplanner = Arc::new(SubPlanner::new(
            Arc::clone(&llm),
            Arc::clone(&pool),
            Arc::clone(&limiter),
            Arc::clone(&prompts),
            config.subplanner.clone(),
        ));

        let planner = Arc::new(Planner::new(
            Arc::clone(&llm),
            Arc::clone(&git),
            Arc::clone(&queue),
            Arc::clone(&pool),
            Arc::clone(&merge),
            Arc::clone(&monitor),
            subplanner,
            limiter,
            Arc::clone(&prompts),
            tracer.with_identity(&agent_id, "planner"),
            config.planner.clone(),
        ));

        let inject_planner = Arc::clone(&planner);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&git),
            Arc::clone(&llm),
            Arc::clone(&prompts),
            Arc::new(move |task| inject_planner.inject_task(task)),
            config.reconciler.clone(),
        ));

        // -- wiring --------------------------------------------------------

        // Queue transitions become trace events.
        {
            let tracer = tracer.with_identity(&agent_id, "task-queue");
            queue.on_status_change(move |change| {
                tracer.emit(
                    TraceLevel::Debug,
                    Some(&change.task_id),
                    "status change",
                    Some(serde_json::json!({
                        "from": change.from.to_string(),
                        "to": change.to.to_string(),
                    })),
                );
            });
        }

        // The monitor samples the queue's pending gauge.
        {
            let queue = Arc::clone(&queue);
            monitor.set_pending_probe(move || queue.pending_count());
        }

        // Merge outcomes feed the monitor; skipped branches were never
        // attempted and do not count.
        {
            let monitor = Arc::clone(&monitor);
            let tracer = tracer.with_identity(&agent_id, "merge-queue");
            merge.on_merge_result(move |outcome| {
                if outcome.status != MergeStatus::Skipped {
                    monitor.record_merge_attempt(outcome.success);
                }
                tracer.emit(
                    if outcome.success {
                        TraceLevel::Info
                    } else {
                        TraceLevel::Warn
                    },
                    None,
                    &format!("merge {}: {}", outcome.branch, outcome.message),
                    Some(serde_json::json!({
                        "branch": outcome.branch,
                        "status": format!("{:?}", outcome.status),
                        "conflicts": outcome.conflicts,
                    })),
                );
            });
        }

        // Conflicts spawn bounded fix tasks; never cascade off a fix branch.
        {
            let planner = Arc::clone(&planner);
            let branch_prefix = config.branch_prefix.clone();
            let fixes = Arc::new(AtomicUsize::new(0));
            merge.on_conflict(move |event| {
                if event.branch.contains("conflict-fix") {
                    info!(branch = %event.branch, "not cascading conflict fix");
                    return;
                }
                let claimed = fixes.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < MAX_CONFLICT_FIXES).then_some(n + 1)
                });
                let Ok(previous) = claimed else {
                    warn!(
                        branch = %event.branch,
                        "conflict-fix budget exhausted; conflict left to the planner"
                    );
                    return;
                };

                let n = previous + 1;
                let id = format!("conflict-fix-{n:03}");
                let scope: Vec<String> = event
                    .conflicting_files
                    .iter()
                    .take(CONFLICT_FIX_SCOPE)
                    .cloned()
                    .collect();
                let description = format!(
                    "Resolve the merge conflicts that branch {} hit on the mainline. \
                     Conflicting files: {}. Rebase the work onto the current mainline, \
                     reconcile both sides, and push a clean branch.",
                    event.branch,
                    scope.join(", ")
                );
                let mut task = Task::new(
                    id.clone(),
                    description,
                    scope,
                    branch_name(&branch_prefix, &id, "resolve merge conflict"),
                );
                task.priority = 1;
                task.acceptance =
                    "The branch merges into the mainline without conflicts.".to_string();
                planner.inject_task(task);
            });
        }

        // Snapshots are mirrored onto the NDJSON stream.
        {
            let tracer = tracer.with_identity(&agent_id, "monitor");
            monitor.on_snapshot(move |snapshot| {
                if let Ok(data) = serde_json::to_value(snapshot) {
                    tracer.emit(TraceLevel::Debug, None, "metrics", Some(data));
                }
            });
        }

        Ok(Self {
            llm,
            queue,
            monitor,
            merge,
            planner,
            reconciler,
            timed_out,
            probe_timeout: config.probe_timeout,
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Run the orchestrator until the planner goes idle, then shut down.
    pub async fn run(&self, request: &str) -> Result<PlanSummary> {
        let ready = self
            .llm
            .wait_ready(self.probe_timeout)
            .await
            .context("no LLM endpoint became ready")?;
        info!(endpoint = %ready, "LLM endpoint ready");

        self.monitor.start().await;
        self.merge.start_background().await;
        self.reconciler.start().await;

        let planner = Arc::clone(&self.planner);
        let result = planner.run(request).await;

        self.shutdown().await;
        result
    }

    /// Stop all subsystems in order: planner, reconciler, merge queue,
    /// monitor. (The worker pool is stateless; in-flight sandboxes are
    /// killed by their own timeouts.) Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("orchestrator shutting down");
        self.planner.stop();
        self.reconciler.stop().await;
        self.merge.stop_background().await;
        self.monitor.stop().await;
    }

    // Accessors used by the CLI and tests.

    pub fn planner(&self) -> &Arc<Planner> {
        &self.planner
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn merge_queue(&self) -> &Arc<MergeQueue> {
        &self.merge
    }

    pub fn timed_out_branches(&self) -> &Arc<TimedOutBranches> {
        &self.timed_out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_uses_default_when_unset() {
        unsafe { std::env::remove_var("FLOTILLA_TEST_UNSET_KEY") };
        let value: usize = env_parse("FLOTILLA_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        unsafe { std::env::set_var("FLOTILLA_TEST_BAD_KEY", "not-a-number") };
        let result: Result<usize> = env_parse("FLOTILLA_TEST_BAD_KEY", 1);
        assert!(result.is_err());
        unsafe { std::env::remove_var("FLOTILLA_TEST_BAD_KEY") };
    }

    #[test]
    fn default_prompts_dir_ends_with_flotilla_prompts() {
        let dir = default_prompts_dir();
        assert!(dir.ends_with("flotilla/prompts"), "got {}", dir.display());
    }
}
