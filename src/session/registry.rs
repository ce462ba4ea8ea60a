//! Session Registry (spec §4.1): the single authority mapping `session_id`
//! to session record, serializing first-use provisioning and driving
//! Container Manager / Port Allocator / Workspace Provisioner teardown on
//! close.
//!
//! Grounded on the teacher's `session/service.rs` (`SessionService` owning
//! the repo/runtime/readiness collaborators and exposing a single façade)
//! and `agent_rpc/container.rs`'s per-session `Arc<RwLock<HashMap<...>>>`
//! bookkeeping, here replaced with `dashmap` for finer-grained locking since
//! the registry is on the hot path of every chat request.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{Backend, Settings};
use crate::container::{ContainerHandle, ContainerManager, ContainerStatus};
use crate::error::{AppError, AppResult};
use crate::local::LocalExecutor;
use crate::port::PortAllocator;
use crate::workspace::WorkspaceProvisioner;

use super::models::{CloseReason, SessionRecord, SessionSpec, SessionStatus};
use super::repository::SessionRepository;

const STOP_GRACE: Duration = Duration::from_secs(10);

/// Port collisions surface only once the runtime tries to publish a port our
/// own probe said was free; spec §4.4 allows up to three release-and-re-lease
/// attempts before giving up.
const PORT_COLLISION_RETRIES: u32 = 3;

pub struct SessionRegistry {
    repo: SessionRepository,
    ports: Arc<PortAllocator>,
    workspace: Arc<WorkspaceProvisioner>,
    containers: Arc<ContainerManager>,
    local: Arc<LocalExecutor>,
    settings: Arc<Settings>,
    live: DashMap<String, SessionRecord>,
    /// Live container handles, keyed by `session_id`. Kept out of
    /// `SessionRecord` (which is what the repository persists and the edge
    /// sees) since a `ContainerHandle` is runtime-only bookkeeping.
    handles: DashMap<String, ContainerHandle>,
    /// Per-session creation locks so two concurrent first-use calls for the
    /// same `session_id` don't both provision (spec §4.1).
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Diagnostic copies of sessions that failed provisioning, retained so
    /// the edge can fetch the failure cause after the live entry is gone.
    failed: DashMap<String, SessionRecord>,
    /// Consecutive health-probe failure counts, tracked independently of
    /// `ContainerHandle` so the Local backend (no handle) gets the same
    /// `n`-strikes-then-close behavior as the sandbox backend (spec §4.6).
    health_failures: DashMap<String, u32>,
}

impl SessionRegistry {
    pub fn new(
        repo: SessionRepository,
        ports: Arc<PortAllocator>,
        workspace: Arc<WorkspaceProvisioner>,
        containers: Arc<ContainerManager>,
        local: Arc<LocalExecutor>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            repo,
            ports,
            workspace,
            containers,
            local,
            settings,
            live: DashMap::new(),
            handles: DashMap::new(),
            locks: DashMap::new(),
            failed: DashMap::new(),
            health_failures: DashMap::new(),
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// `get_or_create` (spec §4.1): reattach to an active session, or
    /// serialize and provision a fresh one.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        spec: SessionSpec,
    ) -> AppResult<(SessionRecord, bool)> {
        if let Some(existing) = self.live.get(session_id) {
            if existing.is_active() {
                drop(existing);
                self.touch(session_id).await;
                let record = self.live.get(session_id).unwrap().clone();
                return Ok((record, false));
            }
        }

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        // Re-check now that we hold the per-session lock: another task may
        // have just finished provisioning while we waited.
        if let Some(existing) = self.live.get(session_id) {
            if existing.is_active() {
                let record = existing.clone();
                drop(existing);
                return Ok((record, false));
            }
        }

        let record = self.provision(session_id, spec).await?;
        Ok((record, true))
    }

    async fn provision(&self, session_id: &str, spec: SessionSpec) -> AppResult<SessionRecord> {
        let now = Utc::now();
        let mut record = SessionRecord {
            session_id: session_id.to_string(),
            name: spec.name.clone().unwrap_or_else(|| session_id.to_string()),
            backend: self.settings.backend,
            status: SessionStatus::Provisioning,
            api_port: None,
            code_port: None,
            workspace_path: self.workspace.path_for(session_id),
            repo_url: spec.repo_url.clone(),
            branch: spec.branch.clone(),
            container_id: None,
            created_at: now,
            last_activity_at: now,
            failure_reason: None,
        };
        self.live.insert(session_id.to_string(), record.clone());
        self.repo.upsert(&record).await?;

        match self.provision_inner(session_id, &spec, &mut record).await {
            Ok(()) => {
                record.status = SessionStatus::Ready;
                self.live.insert(session_id.to_string(), record.clone());
                self.repo.upsert(&record).await?;
                info!("session {session_id} ready");
                Ok(record)
            }
            Err(err) => {
                warn!("session {session_id} failed to provision: {err}");
                record.status = SessionStatus::Failed;
                record.failure_reason = Some(err.to_string());
                self.live.remove(session_id);
                self.failed.insert(session_id.to_string(), record.clone());
                self.repo.upsert(&record).await?;
                Err(err)
            }
        }
    }

    async fn provision_inner(
        &self,
        session_id: &str,
        spec: &SessionSpec,
        record: &mut SessionRecord,
    ) -> AppResult<()> {
        let workspace_path = self.workspace.create(session_id).await?;

        if let Some(repo_url) = &spec.repo_url {
            let branch = spec.branch.as_deref().unwrap_or("main");
            self.workspace
                .clone(
                    &workspace_path,
                    session_id,
                    repo_url,
                    branch,
                    spec.credential.as_deref(),
                )
                .await?;
        }

        if self.settings.backend != Backend::Sandbox {
            // Local backend provisioning is driven by the legacy local
            // executor, not the Container Manager; no ports are leased,
            // only the ephemeral port the spawned process claims for itself.
            record.status = SessionStatus::Starting;
            let port = match self.local.spawn(session_id, &workspace_path).await {
                Ok(port) => port,
                Err(err) => {
                    self.workspace.destroy(&workspace_path).await;
                    return Err(err);
                }
            };
            record.api_port = Some(port);
            return Ok(());
        }

        record.status = SessionStatus::Starting;
        let workspace_str = workspace_path.to_string_lossy().to_string();

        let (mut api_port, mut code_port) = self.ports.lease_pair().await?;
        let mut attempt = 1;
        let handle = loop {
            // Secondary consistency check: a persisted, non-terminal row
            // may still reference a port the in-memory allocator just
            // handed back out (e.g. after a crash restart reset the
            // allocator but left stale rows behind). Best-effort: a
            // repository error here doesn't block provisioning.
            let claimed = self.repo.is_port_claimed(api_port).await.unwrap_or(false)
                || self.repo.is_port_claimed(code_port).await.unwrap_or(false);
            if claimed {
                if attempt >= PORT_COLLISION_RETRIES {
                    self.ports.release_pair(api_port, code_port).await;
                    self.workspace.destroy(&workspace_path).await;
                    return Err(AppError::PortCollision(format!(
                        "session {session_id}: ports {api_port}/{code_port} still claimed by a persisted session row after {attempt} attempts"
                    )));
                }
                warn!(
                    "session {session_id} ports {api_port}/{code_port} claimed by a persisted row on attempt {attempt}/{PORT_COLLISION_RETRIES}, releasing and re-leasing"
                );
                self.ports.release_pair(api_port, code_port).await;
                attempt += 1;
                match self.ports.lease_pair().await {
                    Ok((new_api, new_code)) => {
                        api_port = new_api;
                        code_port = new_code;
                    }
                    Err(lease_err) => {
                        self.workspace.destroy(&workspace_path).await;
                        return Err(lease_err);
                    }
                }
                continue;
            }

            let result = self
                .containers
                .provision(session_id, &workspace_str, api_port, code_port)
                .await;
            match result {
                Ok(handle) => break handle,
                Err(err) if matches!(err, AppError::PortCollision(_)) && attempt < PORT_COLLISION_RETRIES => {
                    warn!(
                        "session {session_id} port collision on attempt {attempt}/{PORT_COLLISION_RETRIES} \
                         ({api_port}, {code_port}), releasing and re-leasing: {err}"
                    );
                    self.ports.release_pair(api_port, code_port).await;
                    attempt += 1;
                    match self.ports.lease_pair().await {
                        Ok((new_api, new_code)) => {
                            api_port = new_api;
                            code_port = new_code;
                        }
                        Err(lease_err) => {
                            self.workspace.destroy(&workspace_path).await;
                            return Err(lease_err);
                        }
                    }
                }
                Err(err) => {
                    self.ports.release_pair(api_port, code_port).await;
                    self.workspace.destroy(&workspace_path).await;
                    return Err(err);
                }
            }
        };

        record.api_port = Some(api_port);
        record.code_port = Some(code_port);
        record.container_id = Some(handle.container_id.clone());
        self.handles.insert(session_id.to_string(), handle);
        Ok(())
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(mut entry) = self.live.get_mut(session_id) {
            entry.last_activity_at = Utc::now();
        }
    }

    pub fn lookup(&self, session_id: &str) -> Option<SessionRecord> {
        self.live
            .get(session_id)
            .map(|r| r.clone())
            .or_else(|| self.failed.get(session_id).map(|r| r.clone()))
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        self.live.iter().map(|r| r.clone()).collect()
    }

    /// `close` (spec §4.1): idempotent teardown. Releases ports and stops
    /// the container; destroys the workspace only when `reason` is
    /// `UserRequested` (spec §3 "Destroyed only when the session is
    /// explicitly deleted").
    pub async fn close(&self, session_id: &str, reason: CloseReason) -> AppResult<()> {
        let Some((_, mut record)) = self.live.remove(session_id) else {
            return Ok(());
        };
        record.status = SessionStatus::Stopping;
        self.repo.upsert(&record).await?;

        if let Some((_, handle)) = self.handles.remove(session_id) {
            if let Err(e) = self.containers.stop(&handle, STOP_GRACE).await {
                warn!("session {session_id} container stop reported an error: {e}");
            }
            if let (Some(api_port), Some(code_port)) = (record.api_port, record.code_port) {
                self.ports.release_pair(api_port, code_port).await;
            }
        }
        self.local.stop(session_id).await;

        if reason.destroys_workspace() {
            self.workspace.destroy(&record.workspace_path).await;
        }

        record.status = SessionStatus::Stopped;
        self.repo.upsert(&record).await?;
        self.locks.remove(session_id);
        self.health_failures.remove(session_id);
        info!("session {session_id} closed (reason={})", reason.as_str());
        Ok(())
    }

    /// Probes a live session's backend and updates its degraded state (spec
    /// §4.6 step 3, §3 `ready <-> degraded` transition). Returns the
    /// consecutive failure count after this probe; the supervisor closes
    /// the session once that count reaches its configured ceiling.
    pub async fn health_check(&self, session_id: &str) -> u32 {
        let healthy = match self.settings.backend {
            Backend::Sandbox => match self.handles.get(session_id) {
                Some(handle) => self.containers.health(&handle).await.is_ok(),
                None => return 0,
            },
            Backend::Local => self.local.is_running(session_id).await,
        };

        if healthy {
            self.health_failures.remove(session_id);
            if let Some(mut entry) = self.live.get_mut(session_id) {
                if entry.status == SessionStatus::Degraded {
                    entry.status = SessionStatus::Ready;
                }
            }
            if let Some(mut handle) = self.handles.get_mut(session_id) {
                handle.status = ContainerStatus::Ready;
                handle.consecutive_health_failures = 0;
            }
            0
        } else {
            let failures = {
                let mut entry = self.health_failures.entry(session_id.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            if let Some(mut entry) = self.live.get_mut(session_id) {
                entry.status = SessionStatus::Degraded;
            }
            if let Some(mut handle) = self.handles.get_mut(session_id) {
                handle.status = ContainerStatus::Degraded;
                handle.consecutive_health_failures = failures;
            }
            failures
        }
    }

    /// The ids of every container this service has labelled that have no
    /// corresponding non-terminal session row (spec §4.6 startup
    /// reconciliation: orphans left by a prior unclean shutdown). Consults
    /// the repository rather than the in-memory `live` map since this runs
    /// before any session has reattached in the new process.
    pub async fn find_container_orphans(&self) -> AppResult<Vec<String>> {
        let live_ids: Vec<String> = self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.session_id)
            .collect();
        self.containers.find_orphans(&live_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::runtime::{
        Container, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi,
    };
    use crate::db::Database;
    use crate::port::PortRange;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener as TokioTcpListener;

    /// A container that, unlike a real `docker run`, never binds the port it
    /// was asked to publish. Tests that exercise the `starting -> ready`
    /// health-probe gate need *something* answering on the host port, so this
    /// fake spawns a one-shot HTTP/1.1 responder on each configured
    /// `host_port` as part of `create_container` — standing in for the
    /// container process's own bind, which is what a real container health
    /// probe is actually waiting on.
    struct AlwaysOkRuntime;

    fn spawn_fake_health_server(port: u16) {
        tokio::spawn(async move {
            let listener = match TokioTcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(_) => return,
            };
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                        .await;
                });
            }
        });
    }

    #[async_trait]
    impl ContainerRuntimeApi for AlwaysOkRuntime {
        async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
            for mapping in &config.ports {
                spawn_fake_health_server(mapping.host_port);
            }
            Ok(format!("fake-{}", config.name.clone().unwrap_or_default()))
        }
        async fn stop_container(&self, _id: &str, _timeout: u32) -> ContainerResult<()> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str, _force: bool) -> ContainerResult<()> {
            Ok(())
        }
        async fn container_state_status(&self, _id: &str) -> ContainerResult<Option<String>> {
            Ok(Some("running".to_string()))
        }
        async fn list_by_label(&self, _label: &str, _value: &str) -> ContainerResult<Vec<Container>> {
            Ok(Vec::new())
        }
    }

    /// Fails its first two `create_container` calls with the docker
    /// "port is already allocated" message, then succeeds on the third —
    /// exercising the release-and-re-lease retry.
    struct CollidesTwiceThenOkRuntime {
        attempts: std::sync::atomic::AtomicU32,
    }

    impl CollidesTwiceThenOkRuntime {
        fn new() -> Self {
            Self {
                attempts: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntimeApi for CollidesTwiceThenOkRuntime {
        async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
            let attempt = self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if attempt <= 2 {
                return Err(ContainerError::CommandFailed {
                    command: "run".into(),
                    message: format!("Bind for 0.0.0.0:{} failed: port is already allocated", attempt),
                });
            }
            for mapping in &config.ports {
                spawn_fake_health_server(mapping.host_port);
            }
            Ok(format!("fake-{}", config.name.clone().unwrap_or_default()))
        }
        async fn stop_container(&self, _id: &str, _timeout: u32) -> ContainerResult<()> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str, _force: bool) -> ContainerResult<()> {
            Ok(())
        }
        async fn container_state_status(&self, _id: &str) -> ContainerResult<Option<String>> {
            Ok(Some("running".to_string()))
        }
        async fn list_by_label(&self, _label: &str, _value: &str) -> ContainerResult<Vec<Container>> {
            Ok(Vec::new())
        }
    }

    struct AlwaysCollidesRuntime;

    #[async_trait]
    impl ContainerRuntimeApi for AlwaysCollidesRuntime {
        async fn create_container(&self, _config: &ContainerConfig) -> ContainerResult<String> {
            Err(ContainerError::CommandFailed {
                command: "run".into(),
                message: "Bind for 0.0.0.0:10001 failed: port is already allocated".into(),
            })
        }
        async fn stop_container(&self, _id: &str, _timeout: u32) -> ContainerResult<()> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str, _force: bool) -> ContainerResult<()> {
            Ok(())
        }
        async fn container_state_status(&self, _id: &str) -> ContainerResult<Option<String>> {
            Ok(None)
        }
        async fn list_by_label(&self, _label: &str, _value: &str) -> ContainerResult<Vec<Container>> {
            Ok(Vec::new())
        }
    }

    struct NeverCreatesRuntime;

    #[async_trait]
    impl ContainerRuntimeApi for NeverCreatesRuntime {
        async fn create_container(&self, _config: &ContainerConfig) -> ContainerResult<String> {
            Err(ContainerError::CommandFailed {
                command: "run".into(),
                message: "no such image".into(),
            })
        }
        async fn stop_container(&self, _id: &str, _timeout: u32) -> ContainerResult<()> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str, _force: bool) -> ContainerResult<()> {
            Ok(())
        }
        async fn container_state_status(&self, _id: &str) -> ContainerResult<Option<String>> {
            Ok(None)
        }
        async fn list_by_label(&self, _label: &str, _value: &str) -> ContainerResult<Vec<Container>> {
            Ok(Vec::new())
        }
    }

    fn test_settings(workspace_root: PathBuf) -> Settings {
        Settings {
            image: "sandboxd/agent:latest".into(),
            api_port_range: (21001, 21010),
            code_port_range: (22001, 22010),
            request_timeout_secs: 5,
            stream_timeout_secs: 30,
            health_check_timeout_secs: 1,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
            mem_limit_mb: 512,
            cpu_limit_cores: 1.0,
            agent_key: "test".into(),
            agent_base_url: "http://api.example/v1".into(),
            agent_model: "claude".into(),
            local_agent_binary: "sandboxd-agent".into(),
            host_loopback: "host.docker.internal".into(),
            workspace_root,
            backend: Backend::Sandbox,
            container_runtime: "docker".into(),
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            database_path: PathBuf::from("test.db"),
            log_level: "info".into(),
            log_format: crate::config::LogFormat::Text,
            max_consecutive_health_failures: 3,
            max_provision_retries: 1,
        }
    }

    async fn registry_with(
        runtime: Arc<dyn ContainerRuntimeApi>,
        root: &std::path::Path,
    ) -> SessionRegistry {
        let settings = Arc::new(test_settings(root.to_path_buf()));
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let ports = Arc::new(PortAllocator::new(
            settings.api_port_range(),
            settings.code_port_range(),
        ));
        let workspace = Arc::new(WorkspaceProvisioner::new(
            settings.workspace_root.clone(),
            tempdir().unwrap().into_path(),
        ));
        let containers = Arc::new(ContainerManager::new(runtime, settings.clone()));
        let local = Arc::new(LocalExecutor::new(
            settings.local_agent_binary.clone(),
            settings.agent_key.clone(),
            settings.agent_base_url.clone(),
            settings.agent_model.clone(),
            settings.health_check_timeout(),
        ));
        SessionRegistry::new(repo, ports, workspace, containers, local, settings)
    }

    #[tokio::test]
    async fn get_or_create_provisions_once_and_reattaches() {
        let root = tempdir().unwrap();
        let registry = registry_with(Arc::new(AlwaysOkRuntime), root.path()).await;

        let (first, created_first) = registry
            .get_or_create("s1", SessionSpec::default())
            .await
            .unwrap();
        assert!(created_first);
        assert_eq!(first.status, SessionStatus::Ready);
        assert!(first.api_port.is_some());

        let (second, created_second) = registry
            .get_or_create("s1", SessionSpec::default())
            .await
            .unwrap();
        assert!(!created_second);
        assert_eq!(second.session_id, "s1");
    }

    #[tokio::test]
    async fn provision_retries_through_port_collisions() {
        let root = tempdir().unwrap();
        let registry = registry_with(Arc::new(CollidesTwiceThenOkRuntime::new()), root.path()).await;

        let (record, created) = registry
            .get_or_create("s-collide", SessionSpec::default())
            .await
            .unwrap();
        assert!(created);
        assert_eq!(record.status, SessionStatus::Ready);
        assert!(record.api_port.is_some());
    }

    #[tokio::test]
    async fn provision_gives_up_after_three_port_collisions() {
        let root = tempdir().unwrap();
        let registry = registry_with(Arc::new(AlwaysCollidesRuntime), root.path()).await;

        let result = registry.get_or_create("s-stuck", SessionSpec::default()).await;
        assert!(matches!(result, Err(AppError::PortCollision(_))));

        let diagnostic = registry.lookup("s-stuck").unwrap();
        assert_eq!(diagnostic.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn provisioning_failure_is_retained_as_diagnostic_copy() {
        let root = tempdir().unwrap();
        let registry = registry_with(Arc::new(NeverCreatesRuntime), root.path()).await;

        let result = registry.get_or_create("s2", SessionSpec::default()).await;
        assert!(result.is_err());
        assert!(registry.lookup("s2").is_none() == false);
        let diagnostic = registry.lookup("s2").unwrap();
        assert_eq!(diagnostic.status, SessionStatus::Failed);
        assert!(diagnostic.failure_reason.is_some());
    }

    #[tokio::test]
    async fn close_releases_ports_and_is_idempotent() {
        let root = tempdir().unwrap();
        let registry = registry_with(Arc::new(AlwaysOkRuntime), root.path()).await;
        let (record, _) = registry
            .get_or_create("s3", SessionSpec::default())
            .await
            .unwrap();
        let api_port = record.api_port.unwrap();

        registry.close("s3", CloseReason::Idle).await.unwrap();
        assert!(registry.lookup("s3").is_none());

        // Idle close must not destroy the workspace.
        assert!(record.workspace_path.exists());

        // Port is free again; a fresh session can claim it.
        let pool_has_port = !registry.ports.api.is_leased(api_port).await;
        assert!(pool_has_port);

        // Idempotent: closing an already-closed session is a no-op.
        registry.close("s3", CloseReason::Idle).await.unwrap();
    }

    #[tokio::test]
    async fn user_requested_close_destroys_workspace() {
        let root = tempdir().unwrap();
        let registry = registry_with(Arc::new(AlwaysOkRuntime), root.path()).await;
        let (record, _) = registry
            .get_or_create("s4", SessionSpec::default())
            .await
            .unwrap();
        let workspace_path = record.workspace_path.clone();
        assert!(workspace_path.exists());

        registry
            .close("s4", CloseReason::UserRequested)
            .await
            .unwrap();
        assert!(!workspace_path.exists());
    }
}
