//! Core data model: tasks, handoffs, and worker metrics.
//!
//! `Task` is the unit of dispatch; `Handoff` is the structured result a
//! sandbox prints as its final stdout line. Both serialize as camelCase
//! because they cross the sandbox subprocess boundary verbatim.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Complete,
    Failed,
    Blocked,
    Partial,
}

impl TaskStatus {
    /// Terminal states: a task never transitions out of these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Blocked | Self::Partial
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Partial => "partial",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "partial" => Ok(Self::Partial),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

/// Outcome reported by a sandbox worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Complete,
    Partial,
    Failed,
    Blocked,
}

impl HandoffStatus {
    /// The terminal task status this handoff maps to.
    pub fn as_task_status(self) -> TaskStatus {
        match self {
            Self::Complete => TaskStatus::Complete,
            Self::Partial => TaskStatus::Partial,
            Self::Failed => TaskStatus::Failed,
            Self::Blocked => TaskStatus::Blocked,
        }
    }
}

impl fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for HandoffStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError(pub String);

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status: {:?}", self.0)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single unit of work dispatched to one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Natural-language instruction for the worker.
    pub description: String,
    /// Repository paths the worker is expected to modify.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Textual completion criterion.
    #[serde(default)]
    pub acceptance: String,
    /// Remote branch the worker will push to.
    pub branch: String,
    pub status: TaskStatus,
    /// Lower value means higher priority.
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Set when this task was produced by the sub-planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

pub(crate) fn default_priority() -> i32 {
    5
}

impl Task {
    /// Create a pending task with defaulted acceptance/priority/parent.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        scope: Vec<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            scope,
            acceptance: String::new(),
            branch: branch.into(),
            status: TaskStatus::Pending,
            priority: default_priority(),
            created_at: Utc::now(),
            parent_id: None,
        }
    }
}

/// Turn a task description into a branch-name-safe slug.
///
/// Lowercase, alphanumerics preserved, runs of other characters collapsed
/// into single dashes, truncated to 40 chars.
pub fn slugify(description: &str) -> String {
    let mut slug = String::with_capacity(40);
    let mut last_dash = true;
    for c in description.chars() {
        if slug.len() >= 40 {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Build the conventional branch name for a task.
///
/// Format: `{prefix}{task_id}-{slug(description)}`.
pub fn branch_name(prefix: &str, task_id: &str, description: &str) -> String {
    let slug = slugify(description);
    if slug.is_empty() {
        format!("{prefix}{task_id}")
    } else {
        format!("{prefix}{task_id}-{slug}")
    }
}

// ---------------------------------------------------------------------------
// Handoff
// ---------------------------------------------------------------------------

/// Per-task effort counters reported by the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerMetrics {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_created: u64,
    pub files_modified: u64,
    pub tokens_used: u64,
    pub tool_call_count: u64,
    pub duration_ms: u64,
}

impl WorkerMetrics {
    /// Element-wise sum, except `duration_ms` which takes the max (children
    /// of a sub-plan run concurrently).
    pub fn merge(&mut self, other: &WorkerMetrics) {
        self.lines_added += other.lines_added;
        self.lines_removed += other.lines_removed;
        self.files_created += other.files_created;
        self.files_modified += other.files_modified;
        self.tokens_used += other.tokens_used;
        self.tool_call_count += other.tool_call_count;
        self.duration_ms = self.duration_ms.max(other.duration_ms);
    }
}

/// The structured result a sandbox returns for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub task_id: String,
    pub status: HandoffStatus,
    /// Worker's natural-language account of what happened.
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Unified diff text; opaque to the orchestrator.
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub metrics: WorkerMetrics,
}

impl Handoff {
    /// Synthesize a failed handoff for a task whose worker never produced
    /// one (crash, timeout, unparseable output).
    pub fn synthesized_failure(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: HandoffStatus::Failed,
            summary: reason.into(),
            files_changed: Vec::new(),
            diff: String::new(),
            concerns: Vec::new(),
            suggestions: Vec::new(),
            metrics: WorkerMetrics::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_round_trips() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Complete,
            TaskStatus::Failed,
            TaskStatus::Blocked,
            TaskStatus::Partial,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::Partial.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn handoff_serde_round_trip() {
        let original = Handoff {
            task_id: "task-001".into(),
            status: HandoffStatus::Partial,
            summary: "did half the work".into(),
            files_changed: vec!["src/a.rs".into(), "src/b.rs".into()],
            diff: "--- a/src/a.rs\n+++ b/src/a.rs\n".into(),
            concerns: vec!["tests missing".into()],
            suggestions: vec!["split the module".into()],
            metrics: WorkerMetrics {
                lines_added: 10,
                lines_removed: 2,
                files_created: 1,
                files_modified: 1,
                tokens_used: 4200,
                tool_call_count: 17,
                duration_ms: 90_000,
            },
        };

        let json = serde_json::to_string(&original).unwrap();
        let parsed: Handoff = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);

        // And once more: re-serialize and re-parse.
        let json2 = serde_json::to_string(&parsed).unwrap();
        let parsed2: Handoff = serde_json::from_str(&json2).unwrap();
        assert_eq!(parsed2, original);
    }

    #[test]
    fn handoff_wire_format_is_camel_case() {
        let handoff = Handoff::synthesized_failure("t1", "boom");
        let json = serde_json::to_string(&handoff).unwrap();
        assert!(json.contains("\"taskId\""));
        assert!(json.contains("\"filesChanged\""));
        assert!(json.contains("\"linesAdded\""));
    }

    #[test]
    fn handoff_missing_metric_fields_default_to_zero() {
        let json = r#"{"taskId":"t1","status":"complete","summary":"ok","metrics":{"tokensUsed":5}}"#;
        let handoff: Handoff = serde_json::from_str(json).unwrap();
        assert_eq!(handoff.metrics.tokens_used, 5);
        assert_eq!(handoff.metrics.lines_added, 0);
        assert_eq!(handoff.metrics.tool_call_count, 0);
        assert!(handoff.files_changed.is_empty());
    }

    #[test]
    fn metrics_merge_sums_and_maxes_duration() {
        let mut a = WorkerMetrics {
            lines_added: 5,
            duration_ms: 100,
            ..Default::default()
        };
        let b = WorkerMetrics {
            lines_added: 3,
            tokens_used: 40,
            duration_ms: 250,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.lines_added, 8);
        assert_eq!(a.tokens_used, 40);
        assert_eq!(a.duration_ms, 250);
    }

    #[test]
    fn slugify_collapses_and_truncates() {
        assert_eq!(slugify("Add login page!"), "add-login-page");
        assert_eq!(slugify("  weird---chars__here  "), "weird-chars-here");
        let long = slugify(&"x".repeat(100));
        assert!(long.len() <= 40);
    }

    #[test]
    fn branch_name_uses_prefix_and_slug() {
        assert_eq!(
            branch_name("fleet/", "task-003", "Fix the parser"),
            "fleet/task-003-fix-the-parser"
        );
        assert_eq!(branch_name("fleet/", "task-004", "!!!"), "fleet/task-004");
    }
}
