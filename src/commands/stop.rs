//! Backend shutdown command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};

use fabula::client::ApiClient;
use fabula::config::Config;
use fabula::launcher::BackendProcess;
use fabula::resolver::{BackendRuntime, EndpointResolver};

pub async fn run(config_path: &str, port_override: Option<u16>) -> Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;

    let process = Arc::new(BackendProcess::new(config.backend.clone()));
    let resolver = EndpointResolver::new(Arc::clone(&process) as Arc<dyn BackendRuntime>);
    if let Some(port) = port_override {
        resolver.publish_port(port);
    }

    let client = ApiClient::new(Arc::clone(&resolver));
    client
        .shutdown()
        .await
        .context("no running backend found")?;
    println!("Backend stopped");
    Ok(())
}
