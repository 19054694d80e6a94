//! NDJSON operational log.
//!
//! The orchestrator's machine-readable output contract: one JSON object per
//! line, `{timestamp, level, agentId, agentRole, taskId?, message, data?}`.
//! This is separate from `tracing` diagnostics; components emit both.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One NDJSON log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub level: TraceLevel,
    pub agent_id: String,
    pub agent_role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Propagated through the sandbox payload so worker-side logs correlate
/// with the orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub agent_id: String,
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes trace events as NDJSON to a shared sink.
///
/// Cloning produces a tracer for the same sink; `with_identity` rebinds the
/// agent id/role for a subsystem.
#[derive(Clone)]
pub struct Tracer {
    sink: Sink,
    agent_id: String,
    agent_role: String,
}

impl Tracer {
    pub fn new(sink: Box<dyn Write + Send>, agent_id: &str, agent_role: &str) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            agent_id: agent_id.to_string(),
            agent_role: agent_role.to_string(),
        }
    }

    /// Tracer writing to stdout.
    pub fn stdout(agent_id: &str, agent_role: &str) -> Self {
        Self::new(Box::new(std::io::stdout()), agent_id, agent_role)
    }

    /// Same sink, different identity.
    pub fn with_identity(&self, agent_id: &str, agent_role: &str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            agent_id: agent_id.to_string(),
            agent_role: agent_role.to_string(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn emit(
        &self,
        level: TraceLevel,
        task_id: Option<&str>,
        message: &str,
        data: Option<serde_json::Value>,
    ) {
        let event = TraceEvent {
            timestamp: Utc::now(),
            level,
            agent_id: self.agent_id.clone(),
            agent_role: self.agent_role.clone(),
            task_id: task_id.map(str::to_string),
            message: message.to_string(),
            data,
        };
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(sink, "{line}");
        let _ = sink.flush();
    }

    pub fn info(&self, task_id: Option<&str>, message: &str) {
        self.emit(TraceLevel::Info, task_id, message, None);
    }

    pub fn warn(&self, task_id: Option<&str>, message: &str) {
        self.emit(TraceLevel::Warn, task_id, message, None);
    }

    pub fn debug(&self, task_id: Option<&str>, message: &str) {
        self.emit(TraceLevel::Debug, task_id, message, None);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
