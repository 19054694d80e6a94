//! `flotilla run`: build the orchestrator and drive a request to idle.

use anyhow::{Context, Result, bail};
use tracing::info;

use flotilla_core::orchestrator::{Orchestrator, OrchestratorConfig};

pub struct RunArgs {
    pub request: Option<String>,
    pub request_file: Option<std::path::PathBuf>,
    pub max_workers: Option<usize>,
    pub merge_strategy: Option<String>,
    pub repo: Option<std::path::PathBuf>,
}

/// Resolution chain for overridable settings: CLI flag > env var > default.
fn apply_overrides(config: &mut OrchestratorConfig, args: &RunArgs) -> Result<()> {
    if let Some(max_workers) = args.max_workers {
        if max_workers == 0 {
            bail!("--max-workers must be at least 1");
        }
        config.max_workers = max_workers;
        config.planner.max_workers = max_workers;
    }
    if let Some(strategy) = &args.merge_strategy {
        config.merge_strategy = strategy
            .parse()
            .with_context(|| format!("invalid --merge-strategy {strategy:?}"))?;
    }
    if let Some(repo) = &args.repo {
        config.target_repo_path = repo.clone();
    }
    Ok(())
}

pub async fn run(args: RunArgs) -> Result<()> {
    let request = match (&args.request, &args.request_file) {
        (Some(inline), _) => inline.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request file {}", path.display()))?,
        (None, None) => bail!("provide a request (inline or via --request-file)"),
    };

    let mut config = OrchestratorConfig::from_env()?;
    apply_overrides(&mut config, &args)?;

    let orchestrator = Orchestrator::new(config).await?;

    let summary = tokio::select! {
        result = orchestrator.run(&request) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            orchestrator.shutdown().await;
            let snapshot = orchestrator.monitor().snapshot();
            println!(
                "interrupted: {} complete, {} failed, {} merges",
                snapshot.completed_total, snapshot.failed_total, snapshot.merge_successes
            );
            return Ok(());
        }
    };

    let snapshot = orchestrator.monitor().snapshot();
    println!(
        "run finished: {} iterations, {} tasks dispatched, {} handoffs",
        summary.iterations, summary.tasks_dispatched, summary.handoffs_collected
    );
    println!(
        "tasks: {} complete, {} failed | merges: {}/{} succeeded | tokens: {}",
        snapshot.completed_total,
        snapshot.failed_total,
        snapshot.merge_successes,
        snapshot.merge_attempts,
        snapshot.tokens_used
    );
    if summary.aborted {
        bail!("planner aborted after repeated consecutive errors");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::merge::MergeStrategy;

    fn base_config() -> OrchestratorConfig {
        OrchestratorConfig {
            llm_endpoints: vec![flotilla_core::llm::EndpointConfig {
                name: "e".into(),
                endpoint: "http://localhost:8000".into(),
                api_key: None,
                weight: 1.0,
            }],
            llm_params: flotilla_core::llm::LlmParams::default(),
            repo_url: "https://example.com/repo.git".into(),
            git_token: String::new(),
            target_repo_path: "/tmp/repo".into(),
            main_branch: "main".into(),
            merge_strategy: MergeStrategy::FastForward,
            max_workers: 100,
            worker_timeout: std::time::Duration::from_secs(1800),
            sandbox_cmd: vec!["sandbox".into()],
            prompts_dir: "/tmp/prompts".into(),
            branch_prefix: "fleet/".into(),
            planner: Default::default(),
            subplanner: Default::default(),
            reconciler: Default::default(),
            monitor_tick: std::time::Duration::from_secs(1),
            probe_timeout: std::time::Duration::from_secs(60),
            ndjson_log_path: None,
        }
    }

    fn args() -> RunArgs {
        RunArgs {
            request: Some("r".into()),
            request_file: None,
            max_workers: None,
            merge_strategy: None,
            repo: None,
        }
    }

    #[test]
    fn flags_override_config() {
        let mut config = base_config();
        let overrides = RunArgs {
            max_workers: Some(8),
            merge_strategy: Some("rebase".into()),
            repo: Some("/elsewhere".into()),
            ..args()
        };
        apply_overrides(&mut config, &overrides).unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.planner.max_workers, 8);
        assert_eq!(config.merge_strategy, MergeStrategy::Rebase);
        assert_eq!(config.target_repo_path, std::path::PathBuf::from("/elsewhere"));
    }

    #[test]
    fn absent_flags_leave_config_untouched() {
        let mut config = base_config();
        apply_overrides(&mut config, &args()).unwrap();
        assert_eq!(config.max_workers, 100);
        assert_eq!(config.merge_strategy, MergeStrategy::FastForward);
    }

    #[test]
    fn bad_strategy_flag_is_rejected() {
        let mut config = base_config();
        let overrides = RunArgs {
            merge_strategy: Some("octopus".into()),
            ..args()
        };
        assert!(apply_overrides(&mut config, &overrides).is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = base_config();
        let overrides = RunArgs {
            max_workers: Some(0),
            ..args()
        };
        assert!(apply_overrides(&mut config, &overrides).is_err());
    }
}
