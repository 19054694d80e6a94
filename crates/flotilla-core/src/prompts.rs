//! System prompts for the four LLM roles.
//!
//! Loaded from a prompts directory (`planner.md`, `worker.md`,
//! `subplanner.md`, `reconciler.md`). Built-in prompts are used when the
//! directory is missing so a fresh install can still run.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

/// The four role prompts.
#[derive(Debug, Clone)]
pub struct SystemPrompts {
    pub planner: String,
    pub worker: String,
    pub subplanner: String,
    pub reconciler: String,
}

const PLANNER_FILE: &str = "planner.md";
const WORKER_FILE: &str = "worker.md";
const SUBPLANNER_FILE: &str = "subplanner.md";
const RECONCILER_FILE: &str = "reconciler.md";

impl SystemPrompts {
    /// Load all four prompts from a directory. Every file must exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<String> {
            let path = dir.join(name);
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read prompt file {}", path.display()))
        };
        Ok(Self {
            planner: read(PLANNER_FILE)?,
            worker: read(WORKER_FILE)?,
            subplanner: read(SUBPLANNER_FILE)?,
            reconciler: read(RECONCILER_FILE)?,
        })
    }

    /// Load from a directory, falling back to the built-in prompts when the
    /// directory (or any file) is missing.
    pub fn load_or_builtin(dir: &Path) -> Self {
        match Self::load(dir) {
            Ok(prompts) => prompts,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "using built-in prompts");
                Self::builtin()
            }
        }
    }

    /// Compiled-in defaults.
    pub fn builtin() -> Self {
        Self {
            planner: PLANNER_PROMPT.to_string(),
            worker: WORKER_PROMPT.to_string(),
            subplanner: SUBPLANNER_PROMPT.to_string(),
            reconciler: RECONCILER_PROMPT.to_string(),
        }
    }
}

const PLANNER_PROMPT: &str = r#"You are the planner of an autonomous coding fleet. You receive a build
request, the current repository state, and worker handoffs. Each iteration
you emit the next batch of independent tasks as JSON:

{"scratchpad": "<your working notes, rewritten each time>",
 "tasks": [{"id": "task-001", "description": "...", "scope": ["path", ...],
            "acceptance": "...", "branch": "...", "priority": 1}]}

Rules:
- Tasks run concurrently in isolated sandboxes; avoid overlapping scopes.
- Keep scopes narrow (1-3 files). Never re-emit a previously dispatched id.
- Lower priority numbers run first. Emit an empty tasks array when the
  request is satisfied.
"#;

const WORKER_PROMPT: &str = r#"You are a coding worker in an ephemeral sandbox. Implement exactly the
task you were given: modify only the files in your scope, satisfy the
acceptance criterion, commit, and push your branch. Report honestly in
your final handoff: status complete, partial, failed, or blocked, with a
summary, the files you changed, and any concerns for the planner.
"#;

const SUBPLANNER_PROMPT: &str = r#"You split one oversized coding task into smaller independent subtasks.
Respond with a JSON array of subtasks: [{"id", "description", "scope",
"acceptance", "priority"}]. Each subtask's scope must be a subset of the
parent task's scope. Subtasks run concurrently; make them disjoint.
"#;

const RECONCILER_PROMPT: &str = r#"You repair a repository whose build or tests are failing. You receive
grouped error output. Respond with a JSON array of at most five fix
tasks: [{"id", "description", "scope", "acceptance"}]. Each task should
target the smallest set of files that fixes one group of errors.
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
