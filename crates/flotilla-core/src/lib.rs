//! flotilla-core: the orchestration engine for an autonomous coding fleet.
//!
//! A streaming planner keeps one long-lived LLM conversation, emits task
//! batches, and dispatches each task to an ephemeral sandbox subprocess
//! through a concurrency limiter. Successful workers push branches; a
//! background merge queue lands them on the mainline under a single git
//! mutex. A monitor samples throughput and a reconciler periodically runs
//! the build/test oracle, turning breakage into priority fix tasks.
//!
//! ```text
//! Planner --(tasks)--> limiter --> WorkerPool --> sandbox subprocess
//!    ^                                  |
//!    |                             Handoff (final stdout line)
//!    +--(handoffs)---------------------+
//!    |
//!    +--> MergeQueue --(git mutex)--> mainline
//!             |
//!         conflicts --> bounded fix tasks (injected)
//! ```

pub mod gitops;
pub mod llm;
pub mod merge;
pub mod monitor;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod queue;
pub mod reconciler;
pub mod subplan;
pub mod task;
pub mod trace;
pub mod worker;

// The primary public API, re-exported at the crate root.
pub use gitops::{GitCheckout, GitError, GitGuard};
pub use llm::{ChatMessage, Completion, EndpointConfig, LlmClient, LlmError, LlmParams};
pub use merge::{ConflictEvent, MergeOutcome, MergeQueue, MergeStatus, MergeStrategy};
pub use monitor::{MetricsSnapshot, Monitor};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use planner::{PlanSummary, Planner, PlannerConfig};
pub use prompts::SystemPrompts;
pub use queue::{QueueError, StatusChange, TaskQueue};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use subplan::{SubPlanner, SubPlannerConfig};
pub use task::{Handoff, HandoffStatus, Task, TaskStatus, WorkerMetrics};
pub use trace::{TraceEvent, TraceLevel, Tracer};
pub use worker::{
    Sandbox, SubprocessSandbox, TimedOutBranches, WorkerError, WorkerPayload, WorkerPool,
    WorkerPoolConfig,
};
