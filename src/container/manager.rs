//! Container Manager (spec §4.4): drives one container through
//! `creating -> starting -> ready -> {degraded, stopping} -> stopped`, on top
//! of the runtime shell-out in [`super::runtime`].
//!
//! Grounded on `backend/src/agent_rpc/container.rs`'s `ContainerBackend`
//! (session->container bookkeeping, port-mapped volume/env construction) and
//! the teacher's general retry-on-transient-failure idiom used throughout
//! `session/service.rs`.

use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};
use tokio::time::sleep;

use crate::config::Settings;
use crate::error::{AppError, AppResult};

use super::runtime::{ContainerConfig, ContainerRuntimeApi, PortMapping};

pub const SESSION_LABEL: &str = "sandboxd.session_id";

/// Internal ports the agent image is expected to listen on.
const AGENT_API_INTERNAL_PORT: u16 = 4096;
const CODE_SERVICE_INTERNAL_PORT: u16 = 4097;
const AGENT_WORKDIR: &str = "/workspace";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Creating,
    Starting,
    Ready,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub container_id: String,
    pub api_port: u16,
    pub code_port: u16,
    pub status: ContainerStatus,
    pub consecutive_health_failures: u32,
}

pub struct ContainerManager {
    runtime: std::sync::Arc<dyn ContainerRuntimeApi>,
    http: reqwest::Client,
    settings: std::sync::Arc<Settings>,
}

impl ContainerManager {
    pub fn new(runtime: std::sync::Arc<dyn ContainerRuntimeApi>, settings: std::sync::Arc<Settings>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.health_check_timeout())
            .build()
            .expect("building the health-probe http client");
        Self {
            runtime,
            http,
            settings,
        }
    }

    fn container_name(session_id: &str) -> String {
        format!("sandboxd-{session_id}")
    }

    fn build_config(
        &self,
        session_id: &str,
        workspace_path: &str,
        api_port: u16,
        code_port: u16,
    ) -> ContainerConfig {
        let mut env = HashMap::new();
        env.insert("AGENT_API_KEY".to_string(), self.settings.agent_key.clone());
        env.insert(
            "AGENT_BASE_URL".to_string(),
            self.settings.agent_base_url.clone(),
        );
        env.insert("AGENT_MODEL".to_string(), self.settings.agent_model.clone());
        env.insert(
            "HOST_LOOPBACK".to_string(),
            self.settings.host_loopback.clone(),
        );
        env.insert("SESSION_ID".to_string(), session_id.to_string());

        let mut labels = HashMap::new();
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());

        ContainerConfig {
            name: Some(Self::container_name(session_id)),
            image: self.settings.image.clone(),
            ports: vec![
                PortMapping::new(api_port, AGENT_API_INTERNAL_PORT),
                PortMapping::new(code_port, CODE_SERVICE_INTERNAL_PORT),
            ],
            volumes: vec![(workspace_path.to_string(), AGENT_WORKDIR.to_string())],
            env,
            workdir: Some(AGENT_WORKDIR.to_string()),
            labels,
            mem_limit_mb: self.settings.mem_limit_mb,
            cpu_limit_cores: self.settings.cpu_limit_cores,
        }
    }

    /// Full lifecycle from `creating` to `ready`, or a terminal error (spec
    /// §4.4 `provision`). Retries container creation up to
    /// `max_provision_retries` times, but only for transient failures.
    pub async fn provision(
        &self,
        session_id: &str,
        workspace_path: &str,
        api_port: u16,
        code_port: u16,
    ) -> AppResult<ContainerHandle> {
        let config = self.build_config(session_id, workspace_path, api_port, code_port);

        let mut last_err = None;
        let container_id = 'create: {
            for attempt in 1..=self.settings.max_provision_retries {
                match self.runtime.create_container(&config).await {
                    Ok(id) => break 'create Some(id),
                    Err(e) if e.is_transient() && attempt < self.settings.max_provision_retries => {
                        warn!(
                            "container create attempt {attempt}/{} for session {session_id} failed (transient): {e}",
                            self.settings.max_provision_retries
                        );
                        sleep(Duration::from_secs(2)).await;
                        last_err = Some(e);
                    }
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                }
            }
            None
        };

        let Some(container_id) = container_id else {
            let err = last_err.expect("loop always records an error before giving up");
            if err.is_port_collision() {
                return Err(AppError::PortCollision(format!(
                    "container create failed for session {session_id}: {err}"
                )));
            }
            return Err(AppError::ProvisioningFailed(format!(
                "container create failed for session {session_id}: {err}"
            )));
        };

        info!("created container {container_id} for session {session_id}, status=starting");

        match self.await_ready(&container_id, api_port).await {
            Ok(()) => Ok(ContainerHandle {
                container_id,
                api_port,
                code_port,
                status: ContainerStatus::Ready,
                consecutive_health_failures: 0,
            }),
            Err(e) => {
                // starting -> failed: best-effort teardown, never leak the container.
                let _ = self.runtime.remove_container(&container_id, true).await;
                Err(e)
            }
        }
    }

    /// `starting -> ready` gate: poll the internal agent API until it answers
    /// or `health_check_timeout` elapses.
    async fn await_ready(&self, container_id: &str, api_port: u16) -> AppResult<()> {
        let deadline = tokio::time::Instant::now() + self.settings.health_check_timeout();
        let mut last_err = None;
        while tokio::time::Instant::now() < deadline {
            match self.probe_health(api_port).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    sleep(Duration::from_millis(500)).await;
                }
            }
        }
        warn!("container {container_id} never became healthy within the startup window");
        Err(AppError::Unhealthy(
            last_err.unwrap_or_else(|| "no health probe attempt succeeded".to_string()),
        ))
    }

    /// Single health probe against the agent's published API port (spec
    /// §4.4 `health`).
    pub async fn health(&self, handle: &ContainerHandle) -> AppResult<()> {
        self.probe_health(handle.api_port)
            .await
            .map_err(AppError::Unhealthy)
    }

    async fn probe_health(&self, api_port: u16) -> Result<(), String> {
        let url = format!("http://127.0.0.1:{api_port}/health");
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("agent health endpoint returned {}", response.status())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Graceful stop, then force-remove after `grace` if the runtime hasn't
    /// already torn the container down (spec §4.4 `stop`).
    pub async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> AppResult<()> {
        if let Err(e) = self
            .runtime
            .stop_container(&handle.container_id, grace.as_secs() as u32)
            .await
        {
            warn!(
                "graceful stop of container {} failed, forcing removal: {e}",
                handle.container_id
            );
        }
        self.runtime
            .remove_container(&handle.container_id, true)
            .await
            .map_err(|e| AppError::Internal(format!("failed to remove container: {e}")))
    }

    /// Force-removes a single orphan container by id, found via
    /// [`Self::find_orphans`]. Best-effort: failures are the caller's to log
    /// and move past, since an orphan left behind is no worse than before.
    pub async fn remove_orphan(&self, container_id: &str) -> AppResult<()> {
        self.runtime
            .remove_container(container_id, true)
            .await
            .map_err(|e| AppError::Internal(format!("removing orphan container {container_id}: {e}")))
    }

    /// Startup reconciliation: containers labelled by this service with no
    /// corresponding live session are orphans from an unclean shutdown
    /// (spec §4.6).
    pub async fn find_orphans(&self, live_session_ids: &[String]) -> AppResult<Vec<String>> {
        let containers = self
            .runtime
            .list_by_label(SESSION_LABEL, "")
            .await
            .map_err(|e| AppError::Internal(format!("listing labelled containers: {e}")))?;

        // `list_by_label` with an empty value is a best-effort "any value"
        // query; filter precisely here against the label contents.
        Ok(containers
            .into_iter()
            .filter_map(|c| c.labels.get(SESSION_LABEL).cloned().map(|sid| (c.id, sid)))
            .filter(|(_, sid)| !live_session_ids.contains(sid))
            .map(|(id, _)| id)
            .collect())
    }
}
