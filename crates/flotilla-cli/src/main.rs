mod probe_cmd;
mod reconcile_cmd;
mod run_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "flotilla", about = "Autonomous coding-fleet orchestrator")]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "info,flotilla_core=debug"
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the repository toward a build request until the planner idles
    Run {
        /// The build request, inline
        request: Option<String>,
        /// Read the build request from a file instead
        #[arg(long, conflicts_with = "request")]
        request_file: Option<std::path::PathBuf>,
        /// Maximum concurrent workers (overrides MAX_WORKERS)
        #[arg(long)]
        max_workers: Option<usize>,
        /// Merge strategy: fast-forward | rebase | merge-commit (overrides MERGE_STRATEGY)
        #[arg(long)]
        merge_strategy: Option<String>,
        /// Local checkout root (overrides TARGET_REPO_PATH)
        #[arg(long)]
        repo: Option<std::path::PathBuf>,
    },
    /// Check LLM endpoint readiness and print per-endpoint health
    Probe {
        /// Seconds to wait for any endpoint to answer
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Run the build/test oracle once and print the fix tasks the LLM proposes
    Reconcile,
}

fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;
    let env_filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    match cli.command {
        Commands::Run {
            request,
            request_file,
            max_workers,
            merge_strategy,
            repo,
        } => {
            run_cmd::run(run_cmd::RunArgs {
                request,
                request_file,
                max_workers,
                merge_strategy,
                repo,
            })
            .await
        }
        Commands::Probe { timeout } => probe_cmd::run(timeout).await,
        Commands::Reconcile => reconcile_cmd::run().await,
    }
}
