//! Interactive chat command implementation.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use fabula::api::ChatRequest;
use fabula::client::ApiClient;
use fabula::config::{self, Config};
use fabula::launcher::BackendProcess;
use fabula::resolver::{BackendRuntime, EndpointResolver};

pub async fn run(
    config_path: &str,
    conversation_id: &str,
    port_override: Option<u16>,
) -> Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;

    let mut backend = config.backend.clone();
    if let Some(dir) = backend.working_dir.take() {
        backend.working_dir = Some(config::resolve_path(Path::new(config_path), &dir));
    }

    let process = Arc::new(BackendProcess::new(backend));
    let resolver = EndpointResolver::new(Arc::clone(&process) as Arc<dyn BackendRuntime>);

    // With an explicit port there is nothing to spawn or discover.
    let spawned = match port_override {
        Some(port) => {
            resolver.publish_port(port);
            false
        }
        None => {
            process.start().await.context("failed to start backend")?;
            true
        }
    };

    let client = ApiClient::with_progress_ttl(
        Arc::clone(&resolver),
        Duration::from_millis(config.client.progress_ttl_ms),
    );

    let base = resolver
        .wait_for_resolution()
        .await
        .context("backend did not come up")?;
    info!(%base, "connected to backend");

    println!("Chat connected to {base} (/exit to quit)");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            // EOF
            println!();
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/exit" || input == "/quit" {
            break;
        }

        let request = ChatRequest::new(conversation_id, input);
        println!();
        let result = client
            .chat_stream(&request, |delta, _accumulated| {
                print!("{delta}");
                let _ = io::stdout().flush();
            })
            .await;
        println!();

        match result {
            Ok(_) => println!(),
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    if spawned {
        process.stop().await.context("failed to stop backend")?;
    }

    Ok(())
}
