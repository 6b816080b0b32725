//! Local backend process launcher.
//!
//! The desktop shell owns the backend service: it spawns the process, learns
//! the listening port from a stdout marker, and announces readiness. This
//! module is the concrete `BackendRuntime` the endpoint resolver discovers
//! through.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::resolver::{BackendRuntime, PortQuery, SubscribeError};

/// Stdout marker the backend prints once it is listening.
pub const PORT_MARKER: &str = "BACKEND_PORT:";

/// Grace period given to the port marker before falling back to a scan.
const MARKER_GRACE: Duration = Duration::from_millis(500);

/// Per-port probe timeout during the health scan.
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Timeout on the graceful shutdown request.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Result type for launcher operations.
pub type Result<T> = std::result::Result<T, LaunchError>;

/// Errors that can occur when launching or stopping the backend.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Failed to spawn the backend process.
    #[error("failed to spawn backend: {0}")]
    SpawnFailed(#[from] std::io::Error),

    /// The backend is already running under this launcher.
    #[error("backend already running")]
    AlreadyRunning,
}

struct ProcessState {
    child: Option<Child>,
    port: Option<u16>,
}

/// Handle on the spawned backend process.
pub struct BackendProcess {
    config: BackendConfig,
    state: Mutex<ProcessState>,
    ready_tx: broadcast::Sender<u16>,
    http: reqwest::Client,
}

impl BackendProcess {
    pub fn new(config: BackendConfig) -> Self {
        let (ready_tx, _) = broadcast::channel(4);
        Self {
            config,
            state: Mutex::new(ProcessState {
                child: None,
                port: None,
            }),
            ready_tx,
            http: reqwest::Client::new(),
        }
    }

    /// Spawn the backend process and start watching its stdio.
    ///
    /// Returns as soon as the process is running; the listening port arrives
    /// later via the stdout marker (or the resolver's scan fallback).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.child.is_some() {
            return Err(LaunchError::AlreadyRunning);
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        info!(command = %self.config.command, pid = ?child.id(), "spawned backend process");

        if let Some(stdout) = child.stdout.take() {
            let process = Arc::clone(self);
            tokio::spawn(async move {
                process.watch_stdout(stdout).await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(line = %line, "backend stderr");
                }
            });
        }

        state.child = Some(child);
        Ok(())
    }

    /// Stop the backend: graceful shutdown over HTTP first, then kill the
    /// child if it is still around. State is cleared either way.
    pub async fn stop(&self) -> Result<()> {
        let (port, mut child) = {
            let mut state = self.state.lock().await;
            (state.port.take(), state.child.take())
        };

        if let Some(port) = port {
            let url = format!("http://localhost:{port}/api/stop");
            match self.http.post(&url).timeout(SHUTDOWN_TIMEOUT).send().await {
                Ok(response) => {
                    debug!(status = %response.status(), "graceful shutdown requested")
                }
                // Expected when the backend already went away on its own.
                Err(e) => debug!(error = %e, "shutdown request failed"),
            }
        }

        if let Some(child) = child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => debug!(%status, "backend exited"),
                _ => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill backend process");
                    }
                }
            }
        }
        Ok(())
    }

    /// Port captured from the stdout marker, if seen yet.
    pub async fn port(&self) -> Option<u16> {
        self.state.lock().await.port
    }

    async fn watch_stdout(self: Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if let Some(port) = parse_port_marker(trimmed) {
                self.state.lock().await.port = Some(port);
                let _ = self.ready_tx.send(port);
                info!(port, "backend announced listening port");
            } else {
                debug!(line = %trimmed, "backend stdout");
            }
        }
    }

    /// Probe `/api/health` on every port in the configured range and return
    /// the first listener found. Used when the stdout marker was missed
    /// (e.g. the backend was started by an earlier shell instance).
    async fn scan_ports(&self) -> Option<u16> {
        let (start, end) = self.config.port_range;
        let probes = (start..=end).map(|port| {
            let http = self.http.clone();
            async move {
                let url = format!("http://localhost:{port}/api/health");
                match http.get(&url).timeout(PROBE_TIMEOUT).send().await {
                    Ok(response) if response.status().is_success() => Some(port),
                    _ => None,
                }
            }
        });

        futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .next()
    }
}

#[async_trait]
impl BackendRuntime for BackendProcess {
    async fn query_port(&self) -> PortQuery {
        if let Some(port) = self.port().await {
            return PortQuery {
                success: true,
                port: Some(port),
            };
        }

        // The marker may simply not have been printed yet.
        tokio::time::sleep(MARKER_GRACE).await;
        if let Some(port) = self.port().await {
            return PortQuery {
                success: true,
                port: Some(port),
            };
        }

        match self.scan_ports().await {
            Some(port) => {
                self.state.lock().await.port = Some(port);
                info!(port, "found backend by port scan");
                PortQuery {
                    success: true,
                    port: Some(port),
                }
            }
            None => PortQuery {
                success: false,
                port: None,
            },
        }
    }

    fn subscribe_ready(&self) -> std::result::Result<broadcast::Receiver<u16>, SubscribeError> {
        Ok(self.ready_tx.subscribe())
    }
}

fn parse_port_marker(line: &str) -> Option<u16> {
    let rest = line.split(PORT_MARKER).nth(1)?;
    rest.split_whitespace().next().unwrap_or(rest).trim().parse().ok()
}
