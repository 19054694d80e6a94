//! Priority task queue with a per-task state machine.
//!
//! A min-heap keyed by `(priority, created_at, seq)` plus an id index. The
//! queue owns canonical task state; every status change is validated against
//! the transition graph and reported exactly once to registered callbacks.
//!
//! ```text
//! pending  -> assigned
//! assigned -> running
//! running  -> complete | failed | blocked | partial
//! ```
//!
//! No back-edges: recovery happens by creating a new fix task, never by
//! rewinding an existing one.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, RwLock};

use thiserror::Error;

use crate::task::{Task, TaskStatus};

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already enqueued")]
    Duplicate(String),

    #[error("invalid state transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// A single status transition, reported to callbacks.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

type StatusCallback = Box<dyn Fn(&StatusChange) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    priority: i32,
    created_at_ms: i64,
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    key: HeapKey,
    id: String,
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    tasks: HashMap<String, Task>,
    workers: HashMap<String, String>,
    seq: u64,
}

/// The shared task queue. Internally synchronized; share via `Arc`.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    callbacks: RwLock<Vec<StatusCallback>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback fired exactly once per status transition.
    pub fn on_status_change(&self, callback: impl Fn(&StatusChange) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    fn emit(&self, change: StatusChange) {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        for cb in callbacks.iter() {
            cb(&change);
        }
    }

    /// Whether a transition is an edge of the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Assigned)
                | (TaskStatus::Assigned, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Complete)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Blocked)
                | (TaskStatus::Running, TaskStatus::Partial)
        )
    }

    /// Add a pending task. Rejects duplicate ids.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.tasks.contains_key(&task.id) {
            return Err(QueueError::Duplicate(task.id));
        }
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Reverse(HeapEntry {
            key: HeapKey {
                priority: task.priority,
                created_at_ms: task.created_at.timestamp_millis(),
                seq,
            },
            id: task.id.clone(),
        }));
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Highest-priority pending task, without removing it.
    pub fn peek(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::skim(&mut inner, false)
    }

    /// Remove and return the highest-priority pending task.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::skim(&mut inner, true)
    }

    /// Pop (or peek) the next heap entry that still refers to a pending
    /// task. Entries for tasks that have since moved on are discarded.
    fn skim(inner: &mut QueueInner, take: bool) -> Option<Task> {
        loop {
            let id = inner.heap.peek()?.0.id.clone();
            let pending = inner
                .tasks
                .get(&id)
                .map(|t| t.status == TaskStatus::Pending)
                .unwrap_or(false);
            if !pending {
                inner.heap.pop();
                continue;
            }
            if take {
                inner.heap.pop();
            }
            return inner.tasks.get(&id).cloned();
        }
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tasks.get(id).cloned()
    }

    /// Count of tasks still pending dispatch.
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(&self, id: &str, to: TaskStatus) -> Result<(), QueueError> {
        let change = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let task = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            let from = task.status;
            if !Self::is_valid_transition(from, to) {
                return Err(QueueError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to,
                });
            }
            task.status = to;
            StatusChange {
                task_id: id.to_string(),
                from,
                to,
            }
        };
        // Callbacks run outside the queue lock.
        self.emit(change);
        Ok(())
    }

    /// Assign a task to a worker: `pending -> assigned`.
    pub fn assign(&self, id: &str, worker_id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Assigned)?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.workers.insert(id.to_string(), worker_id.to_string());
        Ok(())
    }

    /// Start a task: `assigned -> running`.
    pub fn start(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Running)
    }

    /// Mark a task complete: `running -> complete`.
    pub fn complete(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Complete)
    }

    /// Mark a task failed: `running -> failed`.
    pub fn fail(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Failed)
    }

    /// Mark a task blocked: `running -> blocked`.
    pub fn block(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Blocked)
    }

    /// Mark a task partially complete: `running -> partial`.
    pub fn mark_partial(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Partial)
    }

    /// Worker currently assigned to a task, if any.
    pub fn worker_for(&self, id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.workers.get(id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
