//! Backend status command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};

use fabula::client::ApiClient;
use fabula::config::Config;
use fabula::launcher::BackendProcess;
use fabula::resolver::{BackendRuntime, EndpointResolver};

pub async fn run(
    config_path: &str,
    port_override: Option<u16>,
    conversation_id: Option<&str>,
) -> Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;

    // Never spawns: an unstarted process handle still lets the resolver find
    // an already-running backend by port scan.
    let process = Arc::new(BackendProcess::new(config.backend.clone()));
    let resolver = EndpointResolver::new(Arc::clone(&process) as Arc<dyn BackendRuntime>);
    if let Some(port) = port_override {
        resolver.publish_port(port);
    }

    let client = ApiClient::new(Arc::clone(&resolver));

    let base = resolver
        .wait_for_resolution()
        .await
        .context("no running backend found")?;
    client.health().await.context("backend is unhealthy")?;
    println!("Backend: {base} (healthy)");

    match client.app_language().await {
        Ok(language) if !language.is_empty() => println!("Language: {language}"),
        _ => {}
    }

    if let Some(id) = conversation_id {
        let progress = client
            .story_progress(id)
            .await
            .context("failed to fetch story progress")?;
        let total = progress
            .total_sections
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "Story {}: section {}/{} ({})",
            progress.conversation_id,
            progress.current_section,
            total,
            progress.status.as_deref().unwrap_or("unknown"),
        );
    }

    Ok(())
}
