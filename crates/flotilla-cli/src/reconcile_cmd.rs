//! `flotilla reconcile`: one dry-run sweep of the build/test oracle.
//!
//! Runs the configured checks against the target repo and prints the fix
//! tasks the LLM proposes, without injecting anything.

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use flotilla_core::gitops::GitCheckout;
use flotilla_core::llm::LlmClient;
use flotilla_core::orchestrator::OrchestratorConfig;
use flotilla_core::prompts::SystemPrompts;
use flotilla_core::reconciler::Reconciler;

pub async fn run() -> Result<()> {
    let config = OrchestratorConfig::from_env()?;
    if config.reconciler.checks.is_empty() {
        bail!("RECONCILER_CHECKS is not configured; nothing to run");
    }

    let git = Arc::new(
        GitCheckout::open(&config.target_repo_path)
            .await
            .context("target repo checkout not usable")?,
    );
    let llm = Arc::new(LlmClient::new(config.llm_endpoints, config.llm_params)?);
    let prompts = Arc::new(SystemPrompts::load_or_builtin(&config.prompts_dir));

    // Dry run: the injector just records, nothing reaches a planner.
    let reconciler = Reconciler::new(
        git,
        llm,
        prompts,
        Arc::new(|_task| false),
        config.reconciler,
    );

    let failures = reconciler.run_checks().await?;
    if failures.is_empty() {
        println!("all checks passed");
        return Ok(());
    }

    println!("{} check(s) failed:", failures.len());
    for failure in &failures {
        println!("  {}", failure.command);
    }

    let fixes = reconciler.propose_fixes(&failures).await?;
    if fixes.is_empty() {
        println!("the LLM proposed no fix tasks");
        return Ok(());
    }

    println!("\nproposed fix tasks (dry run, not injected):");
    for task in &fixes {
        println!(
            "  {} (priority {}): {}",
            task.id,
            task.priority,
            task.description.lines().next().unwrap_or("")
        );
        if !task.scope.is_empty() {
            println!("    scope: {}", task.scope.join(", "));
        }
    }
    Ok(())
}
