//! The streaming planner loop.
//!
//! Maintains a single long-lived LLM conversation for the whole run. Each
//! iteration drains collected handoffs, decides whether to re-plan (first
//! iteration, low-watermark of new handoffs, or idle), dispatches the new
//! batch through the concurrency limiter, and sleeps. Dispatches run as
//! spawned tasks; their handoffs flow back through `pending_handoffs` and
//! feed the next plan.

pub mod parse;
pub mod prompt;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gitops::GitCheckout;
use crate::llm::{ChatMessage, CompletionOverrides, LlmClient};
use crate::merge::MergeQueue;
use crate::monitor::Monitor;
use crate::prompts::SystemPrompts;
use crate::subplan::SubPlanner;
use crate::task::{Handoff, HandoffStatus, Task};
use crate::trace::{TraceContext, TraceLevel, Tracer};
use crate::worker::WorkerPool;

/// Planner loop tuning. Defaults mirror the environment-variable defaults.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub max_workers: usize,
    pub max_iterations: u32,
    pub loop_sleep: Duration,
    pub min_handoffs_for_replan: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_consecutive_errors: u32,
    pub branch_prefix: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            max_iterations: 1000,
            loop_sleep: Duration::from_millis(500),
            min_handoffs_for_replan: 3,
            backoff_base: Duration::from_millis(2000),
            backoff_max: Duration::from_millis(30000),
            max_consecutive_errors: 10,
            branch_prefix: "fleet/".to_string(),
        }
    }
}

/// Result of a completed planner run.
#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub iterations: u32,
    pub tasks_dispatched: usize,
    pub handoffs_collected: usize,
    /// True when the loop halted on consecutive errors rather than idling.
    pub aborted: bool,
}

/// Dispatch history: insertion order plus a membership set.
#[derive(Default)]
struct DispatchLog {
    order: Vec<String>,
    set: HashSet<String>,
}

impl DispatchLog {
    /// Returns false when the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push(id.to_string());
        true
    }
}

/// The streaming planner. Share via `Arc`; `run` is called once.
pub struct Planner {
    llm: Arc<LlmClient>,
    git: Arc<GitCheckout>,
    queue: Arc<crate::queue::TaskQueue>,
    pool: Arc<WorkerPool>,
    merge: Arc<MergeQueue>,
    monitor: Arc<Monitor>,
    subplanner: Arc<SubPlanner>,
    limiter: Arc<Semaphore>,
    prompts: Arc<SystemPrompts>,
    tracer: Tracer,
    config: PlannerConfig,
    run_id: String,

    cancel: CancellationToken,
    dispatched: Mutex<DispatchLog>,
    active: Mutex<HashSet<String>>,
    pending_handoffs: Mutex<Vec<Handoff>>,
    conversation: tokio::sync::Mutex<Vec<ChatMessage>>,
    scratchpad: Mutex<String>,
    planning_done: AtomicBool,
    task_counter: AtomicUsize,
}

impl Planner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<LlmClient>,
        git: Arc<GitCheckout>,
        queue: Arc<crate::queue::TaskQueue>,
        pool: Arc<WorkerPool>,
        merge: Arc<MergeQueue>,
        monitor: Arc<Monitor>,
        subplanner: Arc<SubPlanner>,
        limiter: Arc<Semaphore>,
        prompts: Arc<SystemPrompts>,
        tracer: Tracer,
        config: PlannerConfig,
    ) -> Self {
        Self {
            llm,
            git,
            queue,
            pool,
            merge,
            monitor,
            subplanner,
            limiter,
            prompts,
            tracer,
            config,
            run_id: Uuid::new_v4().simple().to_string(),
            cancel: CancellationToken::new(),
            dispatched: Mutex::new(DispatchLog::default()),
            active: Mutex::new(HashSet::new()),
            pending_handoffs: Mutex::new(Vec::new()),
            conversation: tokio::sync::Mutex::new(Vec::new()),
            scratchpad: Mutex::new(String::new()),
            planning_done: AtomicBool::new(false),
            task_counter: AtomicUsize::new(0),
        }
    }

    /// Request a stop. The loop exits at its next tick boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current scratchpad text (rewritten each iteration).
    pub fn scratchpad(&self) -> String {
        self.scratchpad
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run the planner loop to completion.
    pub async fn run(self: &Arc<Self>, request: &str) -> Result<PlanSummary> {
        let mut iterations = 0u32;
        let mut consecutive_errors = 0u32;
        let mut first_iteration = true;
        let mut handoffs_collected = 0usize;
        let mut since_last_plan: Vec<Handoff> = Vec::new();
        let mut aborted = false;

        info!(run_id = %self.run_id, "planner loop starting");

        loop {
            if self.cancel.is_cancelled() {
                info!(run_id = %self.run_id, "planner stopped");
                break;
            }

            // Drain handoffs produced since the last tick.
            let drained = {
                let mut pending = self
                    .pending_handoffs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *pending)
            };
            handoffs_collected += drained.len();
            since_last_plan.extend(drained);

            let active = self.active_count();
            let has_capacity = active < self.config.max_workers;
            let planning_done = self.planning_done.load(Ordering::SeqCst);
            let replan = has_capacity
                && (first_iteration
                    || since_last_plan.len() >= self.config.min_handoffs_for_replan
                    || active == 0);

            if replan && !planning_done {
                if iterations >= self.config.max_iterations {
                    warn!(run_id = %self.run_id, "max iterations reached");
                    break;
                }
                iterations += 1;

                match self.plan_once(request, first_iteration, &since_last_plan).await {
                    Ok(parsed_tasks) => {
                        consecutive_errors = 0;
                        since_last_plan.clear();
                        first_iteration = false;
                        if parsed_tasks == 0 {
                            info!(run_id = %self.run_id, "planner emitted empty batch; planning done");
                            self.planning_done.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(
                            run_id = %self.run_id,
                            error = %e,
                            consecutive_errors,
                            "planner iteration failed"
                        );
                        if consecutive_errors >= self.config.max_consecutive_errors {
                            aborted = true;
                            self.tracer.emit(
                                TraceLevel::Error,
                                None,
                                "planner aborting after consecutive errors",
                                Some(serde_json::json!({"errors": consecutive_errors})),
                            );
                            break;
                        }
                        if self.sleep_cancellable(self.backoff(consecutive_errors)).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            if self.planning_done.load(Ordering::SeqCst)
                && self.active_count() == 0
                && self.queue.pending_count() == 0
            {
                info!(run_id = %self.run_id, "planner idle; loop complete");
                break;
            }

            if self.sleep_cancellable(self.config.loop_sleep).await {
                break;
            }
        }

        let dispatched = self
            .dispatched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .order
            .len();

        Ok(PlanSummary {
            iterations,
            tasks_dispatched: dispatched,
            handoffs_collected,
            aborted,
        })
    }

    /// Exponential backoff for the n-th consecutive error.
    fn backoff(&self, consecutive_errors: u32) -> Duration {
        backoff_for(
            self.config.backoff_base,
            self.config.backoff_max,
            consecutive_errors,
        )
    }

    /// Returns true when cancelled during the sleep.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    /// One planning step: build the message, call the LLM, parse, dispatch.
    ///
    /// Returns the number of tasks the response contained (pre-filter); a
    /// zero marks planning as done.
    async fn plan_once(
        self: &Arc<Self>,
        request: &str,
        first_iteration: bool,
        since_last_plan: &[Handoff],
    ) -> Result<usize> {
        let snapshot = prompt::gather_snapshot(&self.git)
            .await
            .context("failed to gather repo snapshot")?;

        let message = if first_iteration {
            prompt::build_initial_message(request, &snapshot)
        } else {
            let active_ids: Vec<String> = {
                let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
                let mut ids: Vec<String> = active.iter().cloned().collect();
                ids.sort();
                ids
            };
            let dispatched_ids = self
                .dispatched
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .order
                .clone();
            prompt::build_followup_message(&snapshot, since_last_plan, &active_ids, &dispatched_ids)
        };

        let completion = {
            let mut conversation = self.conversation.lock().await;
            if conversation.is_empty() {
                conversation.push(ChatMessage::system(&self.prompts.planner));
            }
            conversation.push(ChatMessage::user(message));
            let completion = self
                .llm
                .complete(&conversation, CompletionOverrides::default())
                .await
                .context("planner LLM call failed")?;
            conversation.push(ChatMessage::assistant(&completion.content));
            completion
        };

        self.monitor
            .record_token_usage(completion.usage.total_tokens);
        debug!(
            endpoint = %completion.endpoint,
            latency_ms = completion.latency_ms,
            finish_reason = %completion.finish_reason,
            "planner completion received"
        );

        let (scratchpad, raw_tasks) = match parse::parse_plan_response(&completion.content) {
            parse::PlanParse::Ok { scratchpad, tasks } => (Some(scratchpad), tasks),
            parse::PlanParse::Partial { scratchpad, tasks } => {
                warn!(
                    salvaged = tasks.len(),
                    "planner response was truncated; salvaged tasks"
                );
                (scratchpad, tasks)
            }
            parse::PlanParse::Empty => {
                warn!("planner response contained no parseable tasks");
                (None, Vec::new())
            }
        };

        // The scratchpad is rewritten, not appended.
        if let Some(scratchpad) = scratchpad {
            *self.scratchpad.lock().unwrap_or_else(|e| e.into_inner()) = scratchpad;
        }

        let parsed_count = raw_tasks.len();
        for raw in raw_tasks {
            let index = self.task_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let task = parse::materialize(raw, index, &self.config.branch_prefix);
            self.dispatch_task(task);
        }

        Ok(parsed_count)
    }

    /// Enter a task into the dispatch pipeline, enforcing at-most-once
    /// dispatch per id. Returns false for duplicates.
    fn dispatch_task(self: &Arc<Self>, task: Task) -> bool {
        {
            let mut dispatched = self.dispatched.lock().unwrap_or_else(|e| e.into_inner());
            if !dispatched.insert(&task.id) {
                debug!(task_id = %task.id, "skipping duplicate task id");
                return false;
            }
        }
        if let Err(e) = self.queue.enqueue(task.clone()) {
            warn!(task_id = %task.id, error = %e, "failed to enqueue task");
            return false;
        }

        self.tracer.emit(
            TraceLevel::Info,
            Some(&task.id),
            "task dispatched",
            Some(serde_json::json!({"branch": task.branch, "priority": task.priority})),
        );

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone());

        let planner = Arc::clone(self);
        tokio::spawn(async move {
            planner.dispatch_single(task).await;
        });
        true
    }

    /// Inject a task from outside the LLM loop (reconciler, conflict
    /// handler). Returns false when the id was already dispatched.
    pub fn inject_task(self: &Arc<Self>, task: Task) -> bool {
        info!(task_id = %task.id, priority = task.priority, "task injected");
        self.dispatch_task(task)
    }

    /// Run one dispatched task to its handoff.
    async fn dispatch_single(self: &Arc<Self>, task: Task) {
        let handoff = self.execute(&task).await;

        // Terminal queue transition, per the handoff's own status.
        let transition = match handoff.status {
            HandoffStatus::Complete => self.queue.complete(&task.id),
            HandoffStatus::Partial => self.queue.mark_partial(&task.id),
            HandoffStatus::Failed => self.queue.fail(&task.id),
            HandoffStatus::Blocked => self.queue.block(&task.id),
        };
        if let Err(e) = transition {
            warn!(task_id = %task.id, error = %e, "terminal transition failed");
        }

        // Metrics.
        self.monitor.record_token_usage(handoff.metrics.tokens_used);
        if handoff.status == HandoffStatus::Failed {
            self.monitor.record_failed();
        } else {
            self.monitor.record_completed();
        }
        if handoff.metrics.tokens_used == 0 && handoff.metrics.tool_call_count == 0 {
            self.monitor.record_suspicious_task();
        }

        // At most one merge enqueue per task, for non-failed handoffs that
        // actually changed files.
        if handoff.status != HandoffStatus::Failed {
            if handoff.files_changed.is_empty() {
                self.monitor.record_empty_diff();
            } else if handoff.status != HandoffStatus::Blocked {
                self.merge.enqueue(&task.branch);
            }
        }

        self.tracer.emit(
            TraceLevel::Info,
            Some(&task.id),
            "handoff collected",
            Some(serde_json::json!({
                "status": handoff.status.to_string(),
                "filesChanged": handoff.files_changed.len(),
                "tokensUsed": handoff.metrics.tokens_used,
            })),
        );

        self.pending_handoffs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handoff);
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task.id);
        self.monitor.worker_finished(&task.id);
    }

    /// Acquire a slot and run the task, synthesizing a failed handoff on
    /// any dispatch-level error.
    async fn execute(self: &Arc<Self>, task: &Task) -> Handoff {
        // Oversized tasks route to the sub-planner, which acquires permits
        // per child; holding the parent's permit here would deadlock a
        // saturated limiter.
        if task.scope.len() >= self.subplanner.threshold() {
            if let Err(e) = self.queue.assign(&task.id, "sub-planner") {
                return Handoff::synthesized_failure(&task.id, e.to_string());
            }
            if let Err(e) = self.queue.start(&task.id) {
                return Handoff::synthesized_failure(&task.id, e.to_string());
            }
            self.monitor.worker_started(&task.id);
            return self.subplanner.dispatch(task, 0).await;
        }

        let permit = match Arc::clone(&self.limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Handoff::synthesized_failure(&task.id, "dispatcher is shutting down");
            }
        };

        let worker_id = format!("worker-{}", Uuid::new_v4().simple());
        let result = async {
            self.queue
                .assign(&task.id, &worker_id)
                .map_err(|e| e.to_string())?;
            self.queue.start(&task.id).map_err(|e| e.to_string())?;
            self.monitor.worker_started(&task.id);

            let trace = TraceContext {
                trace_id: self.run_id.clone(),
                agent_id: worker_id.clone(),
            };
            self.pool
                .assign_task(
                    task,
                    &self.prompts.worker,
                    self.llm.sandbox_config(),
                    Some(trace),
                )
                .await
                .map_err(|e| e.to_string())
        }
        .await;
        drop(permit);

        result.unwrap_or_else(|reason| {
            warn!(task_id = %task.id, %reason, "worker dispatch failed");
            Handoff::synthesized_failure(&task.id, reason)
        })
    }
}

/// Exponential backoff: `base * 2^(n-1)` capped at `max`.
fn backoff_for(base: Duration, max: Duration, consecutive_errors: u32) -> Duration {
    let exp = consecutive_errors.saturating_sub(1).min(16);
    let ms = (base.as_millis() as u64)
        .saturating_mul(1u64 << exp)
        .min(max.as_millis() as u64);
    Duration::from_millis(ms)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_log_rejects_repeats() {
        let mut log = DispatchLog::default();
        assert!(log.insert("t1"));
        assert!(log.insert("t2"));
        assert!(!log.insert("t1"));
        assert_eq!(log.order, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(2000);
        let max = Duration::from_millis(30000);
        assert_eq!(backoff_for(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_for(base, max, 2), Duration::from_secs(4));
        assert_eq!(backoff_for(base, max, 3), Duration::from_secs(8));
        assert_eq!(backoff_for(base, max, 4), Duration::from_secs(16));
        assert_eq!(backoff_for(base, max, 5), Duration::from_secs(30));
        assert_eq!(backoff_for(base, max, 40), Duration::from_secs(30));
    }
}
