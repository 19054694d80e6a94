//! Planner conversation message builders.
//!
//! The planner keeps one long-lived conversation: an initial message with
//! the request and full repo context, then follow-ups that compress repo
//! state and digest the handoffs received since the last plan.

use tracing::debug;

use crate::gitops::{GitCheckout, GitError};
use crate::task::Handoff;

/// Handoff digests included per follow-up message.
const MAX_HANDOFFS_PER_MESSAGE: usize = 25;
/// Per-handoff summary budget.
const SUMMARY_MAX_CHARS: usize = 300;
/// Per-handoff file-list budget.
const FILES_MAX_ENTRIES: usize = 30;
/// Commit subjects included in repo context.
const RECENT_COMMITS: usize = 15;
/// Per-artifact character budget.
const ARTIFACT_MAX_CHARS: usize = 8_000;

/// Specification artifacts read from the target repo when present.
#[derive(Debug, Clone, Default)]
pub struct SpecArtifacts {
    pub spec: Option<String>,
    pub features: Option<String>,
    pub conventions: Option<String>,
    pub decisions: Option<String>,
}

/// Repo context captured for one planner message.
#[derive(Debug, Clone, Default)]
pub struct RepoSnapshot {
    pub file_tree: Vec<String>,
    pub recent_commits: Vec<String>,
    pub artifacts: SpecArtifacts,
}

/// Gather the current repo snapshot (tracked files + recent commits under
/// the git mutex, artifacts from plain file reads).
pub async fn gather_snapshot(git: &GitCheckout) -> Result<RepoSnapshot, GitError> {
    let (file_tree, recent_commits) = {
        let guard = git.lock().await;
        let files = guard.ls_files().await?;
        let commits = match guard.log_subjects(RECENT_COMMITS).await {
            Ok(commits) => commits,
            // An empty repo has no log yet.
            Err(e) => {
                debug!(error = %e, "no commit log available");
                Vec::new()
            }
        };
        (files, commits)
    };

    let read = |name: &str| -> Option<String> {
        let path = git.repo_path().join(name);
        std::fs::read_to_string(path)
            .ok()
            .map(|s| truncate_chars(&s, ARTIFACT_MAX_CHARS))
    };

    Ok(RepoSnapshot {
        file_tree,
        recent_commits,
        artifacts: SpecArtifacts {
            spec: read("SPEC.md"),
            features: read("FEATURES.md"),
            conventions: read("AGENTS.md"),
            decisions: read("DECISIONS.md"),
        },
    })
}

/// Truncate to at most `max` characters, appending a marker when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...[truncated]")
}

fn push_repo_context(out: &mut String, snapshot: &RepoSnapshot) {
    out.push_str("## Repository file tree\n\n");
    if snapshot.file_tree.is_empty() {
        out.push_str("(empty repository)\n");
    } else {
        for path in &snapshot.file_tree {
            out.push_str(path);
            out.push('\n');
        }
    }

    out.push_str("\n## Recent commits\n\n");
    if snapshot.recent_commits.is_empty() {
        out.push_str("(no commits yet)\n");
    } else {
        for subject in &snapshot.recent_commits {
            out.push_str("- ");
            out.push_str(subject);
            out.push('\n');
        }
    }
}

fn push_artifact(out: &mut String, title: &str, content: &Option<String>) {
    if let Some(text) = content {
        out.push_str(&format!("\n## {title}\n\n{text}\n"));
    }
}

/// Build the first message of the conversation.
pub fn build_initial_message(request: &str, snapshot: &RepoSnapshot) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str("# Request\n\n");
    out.push_str(request);
    out.push_str("\n\n");

    push_artifact(&mut out, "Specification", &snapshot.artifacts.spec);
    push_artifact(&mut out, "Feature catalog", &snapshot.artifacts.features);
    push_artifact(&mut out, "Agent conventions", &snapshot.artifacts.conventions);
    push_artifact(&mut out, "Decisions", &snapshot.artifacts.decisions);

    push_repo_context(&mut out, snapshot);

    out.push_str(
        "\nRespond with JSON: {\"scratchpad\": \"<your working notes>\", \
         \"tasks\": [{\"id\", \"description\", \"scope\", \"acceptance\", \
         \"branch\", \"priority\"}]}. Emit an empty tasks array when there \
         is nothing left to do.\n",
    );
    out
}

/// One digest block for a handoff in a follow-up message.
fn push_handoff_digest(out: &mut String, handoff: &Handoff) {
    out.push_str(&format!("### {} [{}]\n", handoff.task_id, handoff.status));
    out.push_str(&truncate_chars(&handoff.summary, SUMMARY_MAX_CHARS));
    out.push('\n');

    if !handoff.files_changed.is_empty() {
        let shown: Vec<&str> = handoff
            .files_changed
            .iter()
            .take(FILES_MAX_ENTRIES)
            .map(String::as_str)
            .collect();
        let omitted = handoff.files_changed.len().saturating_sub(shown.len());
        out.push_str(&format!("Files: {}", shown.join(", ")));
        if omitted > 0 {
            out.push_str(&format!(" (+{omitted} more)"));
        }
        out.push('\n');
    }
    for concern in &handoff.concerns {
        out.push_str(&format!("Concern: {concern}\n"));
    }
    for suggestion in &handoff.suggestions {
        out.push_str(&format!("Suggestion: {suggestion}\n"));
    }
}

/// Build a follow-up message after handoffs have arrived.
pub fn build_followup_message(
    snapshot: &RepoSnapshot,
    handoffs: &[Handoff],
    active_ids: &[String],
    dispatched_ids: &[String],
) -> String {
    let mut out = String::with_capacity(4096);

    push_repo_context(&mut out, snapshot);
    push_artifact(&mut out, "Feature catalog", &snapshot.artifacts.features);
    push_artifact(&mut out, "Decisions", &snapshot.artifacts.decisions);

    out.push_str("\n## Worker Handoffs since last plan\n\n");
    if handoffs.is_empty() {
        out.push_str("(none)\n");
    } else {
        let shown = &handoffs[..handoffs.len().min(MAX_HANDOFFS_PER_MESSAGE)];
        for handoff in shown {
            push_handoff_digest(&mut out, handoff);
            out.push('\n');
        }
        let omitted = handoffs.len().saturating_sub(shown.len());
        if omitted > 0 {
            out.push_str(&format!("({omitted} additional handoffs omitted)\n"));
        }
    }

    out.push_str("\n## Currently active task IDs\n\n");
    if active_ids.is_empty() {
        out.push_str("(none)\n");
    } else {
        out.push_str(&active_ids.join(", "));
        out.push('\n');
    }

    out.push_str("\n## Previously dispatched task IDs\n\n");
    out.push_str("DO NOT re-emit any of these IDs:\n");
    if dispatched_ids.is_empty() {
        out.push_str("(none)\n");
    } else {
        out.push_str(&dispatched_ids.join(", "));
        out.push('\n');
    }

    out.push_str(
        "\nRespond with the same JSON shape as before. Emit an empty tasks \
         array when there is nothing left to do.\n",
    );
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Handoff, HandoffStatus};

    fn handoff(id: &str, files: usize) -> Handoff {
        Handoff {
            task_id: id.to_string(),
            status: HandoffStatus::Complete,
            summary: "s".repeat(400),
            files_changed: (0..files).map(|i| format!("src/f{i}.rs")).collect(),
            diff: String::new(),
            concerns: vec!["needs review".into()],
            suggestions: vec![],
            metrics: Default::default(),
        }
    }

    #[test]
    fn truncate_respects_char_budget() {
        assert_eq!(truncate_chars("short", 10), "short");
        let long = truncate_chars(&"x".repeat(20), 10);
        assert!(long.starts_with("xxxxxxxxxx"));
        assert!(long.ends_with("[truncated]"));
    }

    #[test]
    fn initial_message_includes_request_and_context() {
        let snapshot = RepoSnapshot {
            file_tree: vec!["src/main.rs".into()],
            recent_commits: vec!["init".into()],
            artifacts: SpecArtifacts {
                spec: Some("the spec".into()),
                ..Default::default()
            },
        };
        let msg = build_initial_message("build a todo app", &snapshot);
        assert!(msg.contains("build a todo app"));
        assert!(msg.contains("the spec"));
        assert!(msg.contains("src/main.rs"));
        assert!(msg.contains("- init"));
        assert!(msg.contains("scratchpad"));
    }

    #[test]
    fn followup_truncates_summaries_and_file_lists() {
        let snapshot = RepoSnapshot::default();
        let msg = build_followup_message(
            &snapshot,
            &[handoff("t1", 50)],
            &["t2".into()],
            &["t1".into(), "t2".into()],
        );
        // Summary is capped at 300 chars plus the marker.
        assert!(msg.contains("[truncated]"));
        // 50 files shown as 30 plus an omission note.
        assert!(msg.contains("(+20 more)"));
        assert!(msg.contains("DO NOT re-emit any of these IDs"));
        assert!(msg.contains("t1, t2"));
    }

    #[test]
    fn followup_caps_handoff_count() {
        let snapshot = RepoSnapshot::default();
        let handoffs: Vec<Handoff> = (0..30).map(|i| handoff(&format!("t{i}"), 0)).collect();
        let msg = build_followup_message(&snapshot, &handoffs, &[], &[]);
        assert!(msg.contains("(5 additional handoffs omitted)"));
    }

    #[test]
    fn followup_lists_concerns() {
        let snapshot = RepoSnapshot::default();
        let msg = build_followup_message(&snapshot, &[handoff("t1", 1)], &[], &[]);
        assert!(msg.contains("Concern: needs review"));
    }
}
