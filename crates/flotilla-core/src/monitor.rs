//! Health and throughput monitor.
//!
//! Counters are plain atomics updated from anywhere; a periodic tick
//! (default 1 s) assembles a [`MetricsSnapshot`] and pushes it to
//! registered callbacks. No cross-counter invariant needs compound
//! locking, so there is no lock around the numbers themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One periodic sample of orchestrator state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub active_workers: usize,
    pub pending_tasks: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub completed_since_last: u64,
    pub failed_since_last: u64,
    pub tokens_used: u64,
    pub merge_attempts: u64,
    pub merge_successes: u64,
    pub merge_failures: u64,
    pub empty_diffs: u64,
    pub suspicious_tasks: u64,
    pub commits_per_hour: f64,
    pub elapsed_secs: u64,
    /// Task ids whose workers have been running past the timeout.
    pub stuck_workers: Vec<String>,
}

type SnapshotCallback = Box<dyn Fn(&MetricsSnapshot) + Send + Sync>;
type PendingProbe = Box<dyn Fn() -> usize + Send + Sync>;

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    completed_at_last_tick: AtomicU64,
    failed_at_last_tick: AtomicU64,
    tokens: AtomicU64,
    merge_attempts: AtomicU64,
    merge_successes: AtomicU64,
    merge_failures: AtomicU64,
    empty_diffs: AtomicU64,
    suspicious: AtomicU64,
}

/// The shared monitor. Share via `Arc`.
pub struct Monitor {
    counters: Counters,
    started_at: Instant,
    tick: Duration,
    worker_timeout: Duration,
    worker_starts: Mutex<HashMap<String, Instant>>,
    pending_probe: Mutex<Option<PendingProbe>>,
    callbacks: RwLock<Vec<SnapshotCallback>>,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(tick: Duration, worker_timeout: Duration) -> Self {
        Self {
            counters: Counters::default(),
            started_at: Instant::now(),
            tick,
            worker_timeout,
            worker_starts: Mutex::new(HashMap::new()),
            pending_probe: Mutex::new(None),
            callbacks: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Register a callback invoked with each periodic snapshot.
    pub fn on_snapshot(&self, callback: impl Fn(&MetricsSnapshot) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Install the source for the pending-task gauge (the task queue).
    pub fn set_pending_probe(&self, probe: impl Fn() -> usize + Send + Sync + 'static) {
        *self.pending_probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(probe));
    }

    // -- recorders ---------------------------------------------------------

    pub fn worker_started(&self, task_id: &str) {
        self.worker_starts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), Instant::now());
    }

    pub fn worker_finished(&self, task_id: &str) {
        self.worker_starts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }

    pub fn record_completed(&self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_usage(&self, tokens: u64) {
        self.counters.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn record_merge_attempt(&self, success: bool) {
        self.counters.merge_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.counters
                .merge_successes
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.merge_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_empty_diff(&self) {
        self.counters.empty_diffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspicious_task(&self) {
        self.counters.suspicious.fetch_add(1, Ordering::Relaxed);
    }

    // -- sampling ----------------------------------------------------------

    /// Assemble a snapshot now. Also advances the since-last-tick window.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let completed_since_last = completed
            - self
                .counters
                .completed_at_last_tick
                .swap(completed, Ordering::Relaxed);
        let failed_since_last = failed
            - self
                .counters
                .failed_at_last_tick
                .swap(failed, Ordering::Relaxed);

        let starts = self.worker_starts.lock().unwrap_or_else(|e| e.into_inner());
        let active_workers = starts.len();
        let stuck_workers: Vec<String> = starts
            .iter()
            .filter(|(_, started)| started.elapsed() > self.worker_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        drop(starts);

        let pending_tasks = self
            .pending_probe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|probe| probe())
            .unwrap_or(0);

        let elapsed = self.started_at.elapsed();
        let merge_successes = self.counters.merge_successes.load(Ordering::Relaxed);
        let hours = elapsed.as_secs_f64() / 3600.0;
        let commits_per_hour = if hours > 0.0 {
            merge_successes as f64 / hours
        } else {
            0.0
        };

        MetricsSnapshot {
            active_workers,
            pending_tasks,
            completed_total: completed,
            failed_total: failed,
            completed_since_last,
            failed_since_last,
            tokens_used: self.counters.tokens.load(Ordering::Relaxed),
            merge_attempts: self.counters.merge_attempts.load(Ordering::Relaxed),
            merge_successes,
            merge_failures: self.counters.merge_failures.load(Ordering::Relaxed),
            empty_diffs: self.counters.empty_diffs.load(Ordering::Relaxed),
            suspicious_tasks: self.counters.suspicious.load(Ordering::Relaxed),
            commits_per_hour,
            elapsed_secs: elapsed.as_secs(),
            stuck_workers,
        }
    }

    /// Start the periodic tick. Idempotent while running.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock().await;
        if slot.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        let cancel = self.cancel.clone();
        let tick = self.tick;
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let snapshot = monitor.snapshot();
                        if !snapshot.stuck_workers.is_empty() {
                            debug!(stuck = ?snapshot.stuck_workers, "workers past timeout");
                        }
                        let callbacks = monitor
                            .callbacks
                            .read()
                            .unwrap_or_else(|e| e.into_inner());
                        for cb in callbacks.iter() {
                            cb(&snapshot);
                        }
                    }
                }
            }
        }));
    }

    /// Stop the tick and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
