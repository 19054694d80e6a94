//! `flotilla probe`: LLM endpoint readiness diagnostics.

use std::time::Duration;

use anyhow::Result;

use flotilla_core::llm::LlmClient;
use flotilla_core::orchestrator::llm_config_from_env;

pub async fn run(timeout_secs: u64) -> Result<()> {
    let (endpoints, params) = llm_config_from_env()?;
    let count = endpoints.len();
    let client = LlmClient::new(endpoints, params)?;

    println!("probing {count} endpoint(s)...");
    match client.wait_ready(Duration::from_secs(timeout_secs)).await {
        Ok(name) => println!("ready: {name}"),
        Err(e) => println!("not ready: {e}"),
    }

    for (name, healthy, ema) in client.endpoint_health() {
        let latency = ema
            .map(|ms| format!("{ms:.0} ms"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {name}: {} (ema {latency})",
            if healthy { "healthy" } else { "unhealthy" }
        );
    }
    Ok(())
}
