//! Legacy Local Executor (spec §4.7): an alternate backend that runs the
//! agent as a host child process per session instead of inside a container.
//! No container boundary, no port allocator — each session claims an
//! ephemeral host port for itself. Exposes the same `api_port` surface the
//! Chat Proxy already knows how to talk to, so edge handlers stay
//! backend-agnostic.
//!
//! Grounded on `local/process.rs`'s `ProcessHandle`/`ProcessManager`:
//! `tokio::process::Child` plus `kill()` that sends the kill and then waits
//! for the exit status so no zombie accumulates, tracked in a
//! session-keyed map guarded by a single async mutex.

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{info, warn};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct ManagedProcess {
    pid: u32,
    port: u16,
    child: Child,
}

impl ManagedProcess {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill and wait for the exit status so the process is fully reaped
    /// (spec §4.7: "killing and reaping it ... so no zombie processes
    /// accumulate").
    async fn kill_and_reap(&mut self) {
        if let Err(e) = self.child.kill().await {
            if self.is_running() {
                warn!("failed to kill local agent process {}: {e}", self.pid);
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => warn!("timed out waiting for local agent process {} to exit", self.pid),
        }
    }
}

/// One long-lived agent process per session (spec §4.7).
pub struct LocalExecutor {
    agent_binary: String,
    agent_key: String,
    agent_base_url: String,
    agent_model: String,
    health_check_timeout: Duration,
    processes: Mutex<HashMap<String, ManagedProcess>>,
}

impl LocalExecutor {
    pub fn new(
        agent_binary: String,
        agent_key: String,
        agent_base_url: String,
        agent_model: String,
        health_check_timeout: Duration,
    ) -> Self {
        Self {
            agent_binary,
            agent_key,
            agent_base_url,
            agent_model,
            health_check_timeout,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the agent as a child process bound to a freshly-claimed
    /// ephemeral host port, and waits for it to answer its health endpoint.
    /// Returns the port the Chat Proxy should address (spec §4.7, §4.4
    /// `await_ready` analogue).
    pub async fn spawn(&self, session_id: &str, workspace_path: &Path) -> AppResult<u16> {
        let port = claim_ephemeral_port()
            .map_err(|e| AppError::ProvisioningFailed(format!("no free local port: {e}")))?;

        let child = Command::new(&self.agent_binary)
            .arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .current_dir(workspace_path)
            .env("AGENT_API_KEY", &self.agent_key)
            .env("AGENT_BASE_URL", &self.agent_base_url)
            .env("AGENT_MODEL", &self.agent_model)
            .env("SESSION_ID", session_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::ProvisioningFailed(format!("failed to spawn local agent: {e}")))?;

        let pid = child.id().ok_or_else(|| {
            AppError::ProvisioningFailed("local agent exited before reporting a pid".to_string())
        })?;

        self.processes.lock().await.insert(
            session_id.to_string(),
            ManagedProcess { pid, port, child },
        );

        if let Err(e) = self.await_healthy(port).await {
            self.stop(session_id).await;
            return Err(e);
        }

        info!("spawned local agent for session {session_id} (pid {pid}) on port {port}");
        Ok(port)
    }

    async fn await_healthy(&self, port: u16) -> AppResult<()> {
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{port}/health");
        let deadline = tokio::time::Instant::now() + self.health_check_timeout;

        while tokio::time::Instant::now() < deadline {
            if let Ok(response) = client.get(&url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
        Err(AppError::Unhealthy(format!(
            "local agent on port {port} never answered its health endpoint"
        )))
    }

    /// Kill-and-reap (spec §4.7). Idempotent: stopping an untracked session
    /// is a no-op.
    pub async fn stop(&self, session_id: &str) {
        let mut processes = self.processes.lock().await;
        if let Some(mut process) = processes.remove(session_id) {
            process.kill_and_reap().await;
        }
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        let mut processes = self.processes.lock().await;
        processes
            .get_mut(session_id)
            .map(|p| p.is_running())
            .unwrap_or(false)
    }
}

/// Binds to port 0 to let the OS choose a free port, then releases the
/// socket immediately so the child process can bind it. There is an
/// unavoidable, brief window where another process could steal the port;
/// `await_healthy`'s retrying probe means a collision surfaces as a failed
/// spawn, not a hang.
fn claim_ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    listener.local_addr().map(|addr| addr.port())
}
