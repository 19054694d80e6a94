//! Parsing of planner LLM responses.
//!
//! The model is asked for `{"scratchpad": "...", "tasks": [...]}` but the
//! parser accepts a bare task array as a fallback and salvages truncated
//! responses by brace-matching inside the `tasks` array. The result is a
//! sum type so callers can distinguish a clean parse from a salvage.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::task::{Task, TaskStatus, branch_name, default_priority};

/// A task as emitted by the model, before defaults are applied.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawTask {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub acceptance: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Outcome of parsing one planner response.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanParse {
    /// The response parsed cleanly (envelope or bare array).
    Ok {
        scratchpad: String,
        tasks: Vec<RawTask>,
    },
    /// The response was truncated; these tasks were salvaged.
    Partial {
        scratchpad: Option<String>,
        tasks: Vec<RawTask>,
    },
    /// Nothing usable was found.
    Empty,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    scratchpad: String,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

/// Parse a planner response into tasks.
pub fn parse_plan_response(content: &str) -> PlanParse {
    let stripped = strip_fences(content);

    // Clean paths first: the outermost object or array.
    if let Some(region) = outermost_region(&stripped, '{', '}') {
        if let Ok(envelope) = serde_json::from_str::<Envelope>(region) {
            return PlanParse::Ok {
                scratchpad: envelope.scratchpad,
                tasks: envelope.tasks,
            };
        }
    }
    if let Some(region) = outermost_region(&stripped, '[', ']') {
        if let Ok(tasks) = serde_json::from_str::<Vec<RawTask>>(region) {
            return PlanParse::Ok {
                scratchpad: String::new(),
                tasks,
            };
        }
    }

    // Salvage path: brace-match complete objects inside the tasks array
    // (or a bare truncated array).
    let tasks = salvage_tasks(&stripped);
    if tasks.is_empty() {
        debug!("planner response yielded no tasks after salvage");
        return PlanParse::Empty;
    }
    PlanParse::Partial {
        scratchpad: recover_scratchpad(&stripped),
        tasks,
    }
}

/// Apply defaults to a raw task. `index` seeds the fallback id.
pub fn materialize(raw: RawTask, index: usize, branch_prefix: &str) -> Task {
    let id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("task-{index:03}"));
    let branch = raw
        .branch
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| branch_name(branch_prefix, &id, &raw.description));
    Task {
        id,
        description: raw.description,
        scope: raw.scope,
        acceptance: raw.acceptance.unwrap_or_default(),
        branch,
        status: TaskStatus::Pending,
        priority: raw.priority.unwrap_or_else(default_priority),
        created_at: chrono::Utc::now(),
        parent_id: None,
    }
}

/// Drop Markdown code-fence lines, keeping their contents.
fn strip_fences(content: &str) -> String {
    if !content.contains("```") {
        return content.to_string();
    }
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Substring from the first `open` to the last `close`, inclusive.
fn outermost_region(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

/// Extract every syntactically complete object from the tasks array.
///
/// Walks from the `[` that follows a `"tasks"` key (or the first `[` when
/// the response is a bare array), tracking brace depth with string/escape
/// awareness. A trailing incomplete object is discarded; objects that do
/// not deserialize (e.g. missing `description`) are dropped.
fn salvage_tasks(text: &str) -> Vec<RawTask> {
    let array_start = match text.find("\"tasks\"") {
        Some(key_pos) => text[key_pos..].find('[').map(|off| key_pos + off),
        None => text.find('['),
    };
    let Some(start) = array_start else {
        return Vec::new();
    };

    let mut tasks = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut object_start: Option<usize> = None;

    for (pos, c) in text[start..].char_indices() {
        let abs = start + pos;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    object_start = Some(abs);
                }
                depth += 1;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(begin) = object_start.take() {
                        let candidate = &text[begin..=abs];
                        match serde_json::from_str::<RawTask>(candidate) {
                            Ok(task) => tasks.push(task),
                            Err(e) => {
                                debug!(error = %e, "dropping unparseable salvaged object");
                            }
                        }
                    }
                }
            }
            ']' if depth == 0 => break,
            _ => {}
        }
    }

    tasks
}

/// Recover the scratchpad string from a truncated response.
fn recover_scratchpad(text: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let regex = PATTERN.get_or_init(|| {
        Regex::new(r#""scratchpad"\s*:\s*"((?:\\.|[^"\\])*)""#).expect("valid regex")
    });
    let captured = regex.captures(text)?.get(1)?.as_str();
    // Re-wrap in quotes so serde handles the escape sequences.
    serde_json::from_str::<String>(&format!("\"{captured}\"")).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_envelope() {
        let content = r#"{"scratchpad": "thinking...", "tasks": [
            {"id": "t1", "description": "add parser", "scope": ["src/parse.rs"], "priority": 2}
        ]}"#;
        let parsed = parse_plan_response(content);
        let PlanParse::Ok { scratchpad, tasks } = parsed else {
            panic!("expected Ok, got {parsed:?}");
        };
        assert_eq!(scratchpad, "thinking...");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id.as_deref(), Some("t1"));
        assert_eq!(tasks[0].priority, Some(2));
    }

    #[test]
    fn parses_empty_task_batch() {
        let parsed = parse_plan_response(r#"{"scratchpad": "all done", "tasks": []}"#);
        assert_eq!(
            parsed,
            PlanParse::Ok {
                scratchpad: "all done".into(),
                tasks: vec![]
            }
        );
    }

    #[test]
    fn parses_bare_array_fallback() {
        let content = r#"[{"description": "fix tests"}, {"description": "update docs"}]"#;
        let PlanParse::Ok { scratchpad, tasks } = parse_plan_response(content) else {
            panic!("expected Ok");
        };
        assert!(scratchpad.is_empty());
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn strips_code_fences() {
        let content = "Here is the plan:\n```json\n{\"scratchpad\":\"s\",\"tasks\":[{\"description\":\"x\"}]}\n```\n";
        let PlanParse::Ok { tasks, .. } = parse_plan_response(content) else {
            panic!("expected Ok");
        };
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn ignores_prose_around_json() {
        let content = "Sure! The batch below.\n{\"scratchpad\":\"s\",\"tasks\":[{\"description\":\"x\"}]}\nLet me know.";
        let PlanParse::Ok { tasks, .. } = parse_plan_response(content) else {
            panic!("expected Ok");
        };
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn salvages_truncated_response() {
        // Cut off mid-second-object, as when max_tokens is hit.
        let content = r#"{"scratchpad":"ok","tasks":[{"id":"t1","description":"a"},{"id":"t2","description":"b"#;
        let parsed = parse_plan_response(content);
        let PlanParse::Partial { scratchpad, tasks } = parsed else {
            panic!("expected Partial, got {parsed:?}");
        };
        assert_eq!(scratchpad.as_deref(), Some("ok"));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id.as_deref(), Some("t1"));
    }

    #[test]
    fn salvage_skips_braces_inside_strings() {
        let content = r#"{"scratchpad":"s","tasks":[{"id":"t1","description":"touch {a} and }b{"},{"id":"t2","description":"trunc"#;
        let PlanParse::Partial { tasks, .. } = parse_plan_response(content) else {
            panic!("expected Partial");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "touch {a} and }b{");
    }

    #[test]
    fn salvage_drops_objects_without_description() {
        let content = r#"{"tasks":[{"id":"t1"},{"id":"t2","description":"real"},{"id":"t3","descr"#;
        let PlanParse::Partial { tasks, .. } = parse_plan_response(content) else {
            panic!("expected Partial");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id.as_deref(), Some("t2"));
    }

    #[test]
    fn scratchpad_recovery_handles_escapes() {
        let content = r#"{"scratchpad":"line one\nline \"two\"","tasks":[{"description":"a"},{"x":"#;
        let PlanParse::Partial { scratchpad, .. } = parse_plan_response(content) else {
            panic!("expected Partial");
        };
        assert_eq!(scratchpad.as_deref(), Some("line one\nline \"two\""));
    }

    #[test]
    fn garbage_returns_empty() {
        assert_eq!(parse_plan_response("I could not produce a plan."), PlanParse::Empty);
        assert_eq!(parse_plan_response(""), PlanParse::Empty);
        assert_eq!(parse_plan_response("{\"scratchpad\": 12"), PlanParse::Empty);
    }

    #[test]
    fn salvaged_bare_array() {
        let content = r#"[{"description":"only one"},{"description":"cut of"#;
        let PlanParse::Partial { scratchpad, tasks } = parse_plan_response(content) else {
            panic!("expected Partial");
        };
        assert!(scratchpad.is_none());
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn materialize_fills_defaults() {
        let raw = RawTask {
            id: None,
            description: "Add login page".into(),
            scope: vec![],
            acceptance: None,
            branch: None,
            priority: None,
        };
        let task = materialize(raw, 7, "fleet/");
        assert_eq!(task.id, "task-007");
        assert_eq!(task.branch, "fleet/task-007-add-login-page");
        assert_eq!(task.priority, 5);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.scope.is_empty());
    }

    #[test]
    fn materialize_keeps_explicit_fields() {
        let raw = RawTask {
            id: Some("auth-1".into()),
            description: "Wire auth".into(),
            scope: vec!["src/auth.rs".into()],
            acceptance: Some("login works".into()),
            branch: Some("custom/branch".into()),
            priority: Some(1),
        };
        let task = materialize(raw, 0, "fleet/");
        assert_eq!(task.id, "auth-1");
        assert_eq!(task.branch, "custom/branch");
        assert_eq!(task.priority, 1);
        assert_eq!(task.acceptance, "login works");
    }
}
