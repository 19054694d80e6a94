//! Worker pool integration tests against real sandbox subprocesses
//! (shell scripts speaking the stdout contract).

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flotilla_core::llm::SandboxLlmConfig;
use flotilla_core::task::{HandoffStatus, Task};
use flotilla_core::trace::{TraceEvent, Tracer};
use flotilla_core::worker::{TimedOutBranches, WorkerError, WorkerPool, WorkerPoolConfig};
use flotilla_test_utils::{canned_handoff, fake_sandbox, write_script};

/// Shared in-memory sink for asserting on NDJSON trace output.
#[derive(Clone, Default)]
struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Buffer {
    fn events(&self) -> Vec<TraceEvent> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn llm_config() -> SandboxLlmConfig {
    SandboxLlmConfig {
        endpoint: "http://localhost:9".into(),
        model: "test".into(),
        max_tokens: 128,
        temperature: 0.0,
        api_key: None,
    }
}

fn pool_for(script: PathBuf, timeout: Duration) -> (WorkerPool, Arc<TimedOutBranches>, Buffer) {
    let timed_out = Arc::new(TimedOutBranches::new());
    let buffer = Buffer::default();
    let tracer = Tracer::new(Box::new(buffer.clone()), "pool-test", "worker-pool");
    let pool = WorkerPool::new(
        WorkerPoolConfig {
            sandbox_cmd: vec![script.to_string_lossy().into_owned()],
            timeout,
            repo_url: "https://example.com/repo.git".into(),
            git_token: String::new(),
        },
        Arc::clone(&timed_out),
        tracer,
    );
    (pool, timed_out, buffer)
}

fn task(id: &str) -> Task {
    Task::new(id, format!("work on {id}"), vec![], format!("fleet/{id}"))
}

#[tokio::test]
async fn successful_worker_returns_final_line_handoff() {
    let dir = tempfile::TempDir::new().unwrap();
    let expected = canned_handoff("t1", HandoffStatus::Complete, &["src/a.rs"]);
    let script = fake_sandbox(dir.path(), "sandbox.sh", &expected, 0);
    let (pool, timed_out, _buffer) = pool_for(script, Duration::from_secs(10));

    let handoff = pool
        .assign_task(&task("t1"), "prompt", llm_config(), None)
        .await
        .unwrap();

    assert_eq!(handoff, expected);
    assert!(timed_out.is_empty());
}

#[tokio::test]
async fn progress_lines_become_trace_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let expected = canned_handoff("t1", HandoffStatus::Complete, &[]);
    let script = fake_sandbox(dir.path(), "sandbox.sh", &expected, 0);
    let (pool, _timed_out, buffer) = pool_for(script, Duration::from_secs(10));

    pool.assign_task(&task("t1"), "prompt", llm_config(), None)
        .await
        .unwrap();

    let events = buffer.events();
    // Milestone events for the phases the fake sandbox announces.
    let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
    assert!(messages.contains(&"sandbox_created"), "got {messages:?}");
    assert!(messages.contains(&"repo_cloned"));
    assert!(messages.contains(&"worker_started"));
    // Progress lines carry the parsed phase tag.
    let tagged = events
        .iter()
        .filter_map(|e| e.data.as_ref())
        .filter_map(|d| d.get("phase"))
        .any(|p| p == "worker:t1");
    assert!(tagged, "expected a worker:t1 phase tag");
}

#[tokio::test]
async fn non_json_final_line_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = write_script(dir.path(), "bad.sh", "echo 'working...'\necho 'oops no json'\n");
    let (pool, _timed_out, _buffer) = pool_for(script, Duration::from_secs(10));

    let err = pool
        .assign_task(&task("t1"), "prompt", llm_config(), None)
        .await
        .unwrap_err();

    match err {
        WorkerError::FinalLineNotJson { line, .. } => assert!(line.contains("oops")),
        other => panic!("expected FinalLineNotJson, got {other:?}"),
    }
}

#[tokio::test]
async fn silent_worker_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = write_script(dir.path(), "silent.sh", "exit 3\n");
    let (pool, _timed_out, _buffer) = pool_for(script, Duration::from_secs(10));

    let err = pool
        .assign_task(&task("t1"), "prompt", llm_config(), None)
        .await
        .unwrap_err();

    match err {
        WorkerError::NoOutput { exit_code } => assert_eq!(exit_code, Some(3)),
        other => panic!("expected NoOutput, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_kills_worker_and_records_branch() {
    let dir = tempfile::TempDir::new().unwrap();
    // Worker sleeps far past the configured budget.
    let script = write_script(
        dir.path(),
        "slow.sh",
        "echo '[spawn] sandbox created'\nsleep 30\necho '{}'\n",
    );
    let (pool, timed_out, _buffer) = pool_for(script, Duration::from_millis(500));

    let started = Instant::now();
    let err = pool
        .assign_task(&task("t9"), "prompt", llm_config(), None)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, WorkerError::Timeout(_)), "got {err:?}");
    // The kill is hard: nowhere near the worker's 30 s sleep.
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    assert!(timed_out.contains("fleet/t9"));
}

#[tokio::test]
async fn handoff_status_is_taken_verbatim() {
    // A worker may report zero effort but still claim completion; the pool
    // must not re-derive the status.
    let dir = tempfile::TempDir::new().unwrap();
    let mut handoff = canned_handoff("t1", HandoffStatus::Complete, &[]);
    handoff.metrics.tokens_used = 0;
    handoff.metrics.tool_call_count = 0;
    let script = fake_sandbox(dir.path(), "sandbox.sh", &handoff, 0);
    let (pool, _timed_out, _buffer) = pool_for(script, Duration::from_secs(10));

    let result = pool
        .assign_task(&task("t1"), "prompt", llm_config(), None)
        .await
        .unwrap();
    assert_eq!(result.status, HandoffStatus::Complete);
}
