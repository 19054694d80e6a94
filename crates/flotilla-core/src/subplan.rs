//! Recursive sub-planner for oversized tasks.
//!
//! When a task's scope reaches the threshold, the planner routes it here
//! instead of a single sandbox. The sub-planner asks the LLM to decompose
//! the task, validates every subtask scope against the parent's, dispatches
//! the survivors concurrently through the shared pool and semaphore, and
//! folds the child handoffs into one parent handoff.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::llm::{ChatMessage, CompletionOverrides, LlmClient};
use crate::planner::parse::{self, PlanParse, RawTask};
use crate::prompts::SystemPrompts;
use crate::task::{Handoff, HandoffStatus, Task, TaskStatus, WorkerMetrics, branch_name};
use crate::worker::WorkerPool;

/// Sub-planner limits.
#[derive(Debug, Clone)]
pub struct SubPlannerConfig {
    /// Scope size at or above which a task is decomposed.
    pub threshold: usize,
    /// Maximum recursion depth.
    pub max_depth: u32,
    pub branch_prefix: String,
}

impl Default for SubPlannerConfig {
    fn default() -> Self {
        Self {
            threshold: 4,
            max_depth: 3,
            branch_prefix: "fleet/".to_string(),
        }
    }
}

/// Decomposes oversized tasks and aggregates child outcomes.
pub struct SubPlanner {
    llm: Arc<LlmClient>,
    pool: Arc<WorkerPool>,
    limiter: Arc<Semaphore>,
    prompts: Arc<SystemPrompts>,
    config: SubPlannerConfig,
}

impl SubPlanner {
    pub fn new(
        llm: Arc<LlmClient>,
        pool: Arc<WorkerPool>,
        limiter: Arc<Semaphore>,
        prompts: Arc<SystemPrompts>,
        config: SubPlannerConfig,
    ) -> Self {
        Self {
            llm,
            pool,
            limiter,
            prompts,
            config,
        }
    }

    pub fn threshold(&self) -> usize {
        self.config.threshold
    }

    /// Decompose and run a task, returning the aggregated parent handoff.
    ///
    /// Never errors: catastrophic failures become a synthetic failed
    /// handoff with an actionable suggestion.
    pub fn dispatch<'a>(&'a self, parent: &'a Task, depth: u32) -> BoxFuture<'a, Handoff> {
        Box::pin(async move {
            let subtasks = match self.decompose(parent).await {
                Ok(subtasks) => subtasks,
                Err(reason) => {
                    warn!(task_id = %parent.id, %reason, "sub-planner decomposition failed");
                    return failed_with_retry_hint(parent, &reason);
                }
            };
            if subtasks.is_empty() {
                return failed_with_retry_hint(parent, "decomposition produced no valid subtasks");
            }

            info!(
                task_id = %parent.id,
                depth,
                subtasks = subtasks.len(),
                "dispatching subtasks"
            );

            // join_all holds the parent here until every child finishes.
            let children = join_all(
                subtasks
                    .iter()
                    .map(|sub| self.dispatch_child(sub, depth)),
            )
            .await;

            aggregate(parent, &subtasks, children)
        })
    }

    async fn dispatch_child(&self, sub: &Task, depth: u32) -> Handoff {
        // Recurse while the child itself is oversized and depth allows.
        if sub.scope.len() >= self.config.threshold && depth + 1 < self.config.max_depth {
            return self.dispatch(sub, depth + 1).await;
        }

        let permit = match Arc::clone(&self.limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Handoff::synthesized_failure(&sub.id, "dispatcher is shutting down");
            }
        };

        let result = self
            .pool
            .assign_task(sub, &self.prompts.worker, self.llm.sandbox_config(), None)
            .await;
        drop(permit);

        result.unwrap_or_else(|e| Handoff::synthesized_failure(&sub.id, e.to_string()))
    }

    /// Ask the LLM for subtasks and validate them against the parent scope.
    async fn decompose(&self, parent: &Task) -> Result<Vec<Task>, String> {
        let parent_json =
            serde_json::to_string_pretty(parent).map_err(|e| e.to_string())?;
        let messages = [
            ChatMessage::system(&self.prompts.subplanner),
            ChatMessage::user(format!(
                "Decompose this task into independent subtasks:\n\n{parent_json}"
            )),
        ];
        let completion = self
            .llm
            .complete(&messages, CompletionOverrides::default())
            .await
            .map_err(|e| e.to_string())?;

        let raw_tasks = match parse::parse_plan_response(&completion.content) {
            PlanParse::Ok { tasks, .. } | PlanParse::Partial { tasks, .. } => tasks,
            PlanParse::Empty => {
                return Err("sub-planner response contained no subtasks".to_string());
            }
        };

        Ok(filter_subtasks(
            parent,
            raw_tasks,
            &self.config.branch_prefix,
        ))
    }
}

/// Validate raw subtasks: scopes are intersected with the parent's and
/// subtasks left with no files are dropped.
pub(crate) fn filter_subtasks(parent: &Task, raw: Vec<RawTask>, prefix: &str) -> Vec<Task> {
    let parent_scope: HashSet<&str> = parent.scope.iter().map(String::as_str).collect();

    raw.into_iter()
        .enumerate()
        .filter_map(|(i, raw)| {
            let scope: Vec<String> = raw
                .scope
                .iter()
                .filter(|path| parent_scope.contains(path.as_str()))
                .cloned()
                .collect();
            if scope.len() < raw.scope.len() {
                debug!(
                    parent = %parent.id,
                    dropped = raw.scope.len() - scope.len(),
                    "discarded subtask scope entries outside parent scope"
                );
            }
            if scope.is_empty() {
                warn!(parent = %parent.id, "dropping subtask with no in-scope files");
                return None;
            }

            let id = raw
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("{}-sub-{}", parent.id, i + 1));
            let branch = raw
                .branch
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| branch_name(prefix, &id, &raw.description));
            Some(Task {
                id,
                description: raw.description,
                scope,
                acceptance: raw.acceptance.unwrap_or_default(),
                branch,
                status: TaskStatus::Pending,
                priority: raw.priority.unwrap_or(parent.priority),
                created_at: chrono::Utc::now(),
                parent_id: Some(parent.id.clone()),
            })
        })
        .collect()
}

/// Fold child handoffs into the parent's handoff.
pub(crate) fn aggregate(parent: &Task, subtasks: &[Task], children: Vec<Handoff>) -> Handoff {
    let total = children.len();
    let complete = count(&children, HandoffStatus::Complete);
    let partial = count(&children, HandoffStatus::Partial);
    let failed = count(&children, HandoffStatus::Failed);
    let blocked = count(&children, HandoffStatus::Blocked);

    let status = if complete == total {
        HandoffStatus::Complete
    } else if failed == total {
        HandoffStatus::Failed
    } else if complete + partial > 0 {
        HandoffStatus::Partial
    } else {
        HandoffStatus::Blocked
    };

    let mut metrics = WorkerMetrics::default();
    let mut files_changed: Vec<String> = Vec::new();
    let mut seen_files: HashSet<String> = HashSet::new();
    let mut concerns: Vec<String> = Vec::new();
    let mut suggestions: Vec<String> = Vec::new();
    let mut diff = String::new();
    let mut child_lines: Vec<String> = Vec::new();

    for child in &children {
        metrics.merge(&child.metrics);
        for file in &child.files_changed {
            if seen_files.insert(file.clone()) {
                files_changed.push(file.clone());
            }
        }
        for concern in &child.concerns {
            concerns.push(format!("[{}] {concern}", child.task_id));
        }
        for suggestion in &child.suggestions {
            suggestions.push(format!("[{}] {suggestion}", child.task_id));
        }
        if !child.diff.is_empty() {
            if !diff.is_empty() {
                diff.push('\n');
            }
            diff.push_str(&child.diff);
        }
        child_lines.push(format!(
            "{}: {} - {}",
            child.task_id,
            child.status,
            crate::planner::prompt::truncate_chars(&child.summary, 120)
        ));
    }

    let summary = format!(
        "Sub-plan of {} subtask(s): {complete} complete, {partial} partial, \
         {failed} failed, {blocked} blocked.\n{}",
        subtasks.len(),
        child_lines.join("\n")
    );

    Handoff {
        task_id: parent.id.clone(),
        status,
        summary,
        files_changed,
        diff,
        concerns,
        suggestions,
        metrics,
    }
}

fn count(children: &[Handoff], status: HandoffStatus) -> usize {
    children.iter().filter(|c| c.status == status).count()
}

fn failed_with_retry_hint(parent: &Task, reason: &str) -> Handoff {
    let mut handoff = Handoff::synthesized_failure(&parent.id, reason);
    handoff.suggestions.push(format!(
        "retry {} as a direct worker dispatch with a narrower scope",
        parent.id
    ));
    handoff
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
