//! Test utilities and common setup (integration tests, spec §6).

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use sandboxd::api::{self, AppState};
use sandboxd::chat::ChatProxy;
use sandboxd::config::{Backend, LogFormat, Settings};
use sandboxd::container::{
    Container, ContainerConfig, ContainerManager, ContainerResult, ContainerRuntimeApi,
};
use sandboxd::db::Database;
use sandboxd::local::LocalExecutor;
use sandboxd::port::PortAllocator;
use sandboxd::session::{SessionRegistry, SessionRepository};
use sandboxd::workspace::WorkspaceProvisioner;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Answers every container create with a container whose published port
/// actually has something listening, mimicking the process a real
/// `docker run` would eventually start, so the registry's health-probe gate
/// can pass without a real container runtime.
struct FakeRuntime;

fn spawn_fake_health_server(port: u16) {
    tokio::spawn(async move {
        let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
            return;
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
impl ContainerRuntimeApi for FakeRuntime {
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

fn test_settings(workspace_root: std::path::PathBuf) -> Settings {
    Settings {
        image: "sandboxd/agent:latest".into(),
        api_port_range: (25001, 25010),
        code_port_range: (26001, 26010),
        request_timeout_secs: 5,
        stream_timeout_secs: 30,
        health_check_timeout_secs: 2,
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
        database_path: std::path::PathBuf::from("test.db"),
        log_level: "info".into(),
        log_format: LogFormat::Text,
        max_consecutive_health_failures: 3,
        max_provision_retries: 1,
    }
}

/// Build a full router against an in-memory database and a fake container
/// runtime, the same shape `main.rs` wires up for real at startup.
pub async fn test_app() -> Router {
    let settings = Arc::new(test_settings(tempfile::tempdir().unwrap().into_path()));

    let db = Database::in_memory().await.unwrap();
    let repo = SessionRepository::new(db.pool().clone());
    let ports = Arc::new(PortAllocator::new(
        settings.api_port_range(),
        settings.code_port_range(),
    ));
    let workspace = Arc::new(WorkspaceProvisioner::new(
        settings.workspace_root.clone(),
        tempfile::tempdir().unwrap().into_path(),
    ));
    let containers = Arc::new(ContainerManager::new(Arc::new(FakeRuntime), settings.clone()));
    let local = Arc::new(LocalExecutor::new(
        settings.local_agent_binary.clone(),
        settings.agent_key.clone(),
        settings.agent_base_url.clone(),
        settings.agent_model.clone(),
        settings.health_check_timeout(),
    ));
    let sessions = Arc::new(SessionRegistry::new(
        repo, ports, workspace, containers, local, settings.clone(),
    ));
    let chat = Arc::new(ChatProxy::new(
        sessions.clone(),
        settings.request_timeout(),
        settings.stream_timeout(),
    ));

    let state = AppState { sessions, chat, settings };
    api::router(state)
}
