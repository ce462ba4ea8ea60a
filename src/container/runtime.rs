//! Shell-out container runtime (spec §4.4, "runtime shell-out contract"):
//! talks to `docker`/`podman` as a subprocess, never a daemon socket client.
//!
//! Grounded on the teacher's `container/mod.rs` + `container/container.rs`
//! (`ContainerRuntime`, `RuntimeType`, the `ContainerRuntimeApi` trait, and
//! the charset-validation helpers run before any value reaches argv).

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("failed to parse container output: {0}")]
    ParseError(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Transient failures (runtime socket hiccup, resource pressure) are
    /// worth retrying; non-transient ones (missing image, port collision)
    /// are not (spec §4.4 failure semantics).
    pub fn is_transient(&self) -> bool {
        let message = match self {
            Self::CommandFailed { message, .. } => message.to_lowercase(),
            Self::Io(e) => e.to_string().to_lowercase(),
            _ => return false,
        };
        const TRANSIENT_MARKERS: &[&str] = &[
            "cannot connect",
            "connection refused",
            "timed out",
            "timeout",
            "resource temporarily unavailable",
            "no space left",
            "i/o timeout",
        ];
        TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
    }

    /// A port already bound on the host surfaces from the runtime only once
    /// it tries to publish it, after our own probe already said it was free.
    pub fn is_port_collision(&self) -> bool {
        if let Self::CommandFailed { message, .. } = self {
            let message = message.to_lowercase();
            return message.contains("port is already allocated")
                || message.contains("address already in use");
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    #[default]
    Podman,
}

impl RuntimeKind {
    pub fn default_binary(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, Self::Podman)
    }

    pub fn from_binary_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("docker") {
            Self::Docker
        } else {
            Self::Podman
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// A single published port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Everything needed to create one session's container (spec §4.4).
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<(String, String)>,
    pub env: HashMap<String, String>,
    pub workdir: Option<String>,
    pub labels: HashMap<String, String>,
    pub mem_limit_mb: u64,
    pub cpu_limit_cores: f64,
}

impl ContainerConfig {
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        if let Some(name) = &self.name {
            validate_container_id_or_name(name)?;
        }
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        for (host, container) in &self.volumes {
            validate_volume_path(host)?;
            validate_volume_path(container)?;
        }
        if let Some(workdir) = &self.workdir {
            validate_container_path(workdir)?;
        }
        for key in self.labels.keys() {
            validate_env_var_key(key.replace('.', "_").as_str())?;
        }
        Ok(())
    }
}

/// Container inspect summary, as returned by `ps --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    #[serde(alias = "Id")]
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub state: String,
}

pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length".to_string(),
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid) || image.contains("..") {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    Ok(())
}

pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container id/name has invalid length".to_string(),
        ));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "container id/name '{id}' contains invalid characters"
        )));
    }
    Ok(())
}

fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() || key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key has invalid length".to_string(),
        ));
    }
    let first = key.chars().next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_')
        || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{key}' is invalid"
        )));
    }
    Ok(())
}

fn validate_volume_path(path: &str) -> ContainerResult<()> {
    if path.is_empty() || path.len() > 4096 || path.contains('\0') {
        return Err(ContainerError::InvalidInput(
            "volume path is invalid".to_string(),
        ));
    }
    const DANGEROUS: &[char] = &[
        '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '*', '?', '\\', '"', '\'',
        '\n', '\r',
    ];
    if path.chars().any(|c| DANGEROUS.contains(&c)) {
        return Err(ContainerError::InvalidInput(format!(
            "volume path '{path}' contains a shell metacharacter"
        )));
    }
    Ok(())
}

fn validate_container_path(path: &str) -> ContainerResult<()> {
    if path.is_empty() || !path.starts_with('/') || path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{path}' must be an absolute, null-free path"
        )));
    }
    Ok(())
}

/// Async abstraction over the container CLI, so the manager can swap in a
/// fake runtime under test (teacher's `MockContainerRuntime` pattern).
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn stop_container(&self, container_id: &str, timeout_seconds: u32) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;
    async fn list_by_label(&self, label: &str, value: &str) -> ContainerResult<Vec<Container>>;
}

#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    kind: RuntimeKind,
    binary: String,
}

impl ContainerRuntime {
    pub fn new(kind: RuntimeKind) -> Self {
        Self {
            binary: kind.default_binary().to_string(),
            kind,
        }
    }

    pub fn with_binary(kind: RuntimeKind, binary: impl Into<String>) -> Self {
        Self {
            kind,
            binary: binary.into(),
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub async fn health_check(&self) -> ContainerResult<()> {
        let output = Command::new(&self.binary)
            .args(["version", "--format", "json"])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "version".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: "version".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn build_run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into()];

        if let Some(name) = &config.name {
            args.push("--name".into());
            args.push(name.clone());
        }

        args.push("--memory".into());
        args.push(format!("{}m", config.mem_limit_mb));
        args.push("--cpus".into());
        args.push(format!("{}", config.cpu_limit_cores));
        args.push("--restart".into());
        args.push("no".into());

        for port in &config.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }

        for (host, container) in &config.volumes {
            args.push("-v".into());
            if self.kind.needs_selinux_labels() {
                args.push(format!("{host}:{container}:Z"));
            } else {
                args.push(format!("{host}:{container}"));
            }
        }

        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }

        for (key, value) in &config.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }

        if let Some(workdir) = &config.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }

        args.push(config.image.clone());
        args
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let args = self.build_run_args(config);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "run".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn stop_container(&self, container_id: &str, timeout_seconds: u32) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        let output = Command::new(&self.binary)
            .args(["stop", "-t", &timeout_seconds.to_string(), container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "stop".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: "stop".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // "no such container" after a failed stop just means it's already gone.
            if stderr.to_lowercase().contains("no such container") {
                return Ok(());
            }
            return Err(ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Status}}", id_or_name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Ok(None);
        }
        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        Ok(if status.is_empty() { None } else { Some(status) })
    }

    async fn list_by_label(&self, label: &str, value: &str) -> ContainerResult<Vec<Container>> {
        let filter = format!("label={label}={value}");
        let output = Command::new(&self.binary)
            .args(["ps", "-a", "--filter", &filter, "--format", "json"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "ps".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: "ps".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        // docker emits one JSON object per line; podman emits a single JSON array.
        if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()))
        } else {
            trimmed
                .lines()
                .map(|line| serde_json::from_str(line).map_err(|e| ContainerError::ParseError(e.to_string())))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_image_names_with_shell_metacharacters() {
        assert!(validate_image_name("alpine:latest").is_ok());
        assert!(validate_image_name("alpine;rm -rf /").is_err());
        assert!(validate_image_name("$(whoami)").is_err());
    }

    #[test]
    fn rejects_volume_paths_with_shell_metacharacters() {
        assert!(validate_volume_path("/workspace/s1").is_ok());
        assert!(validate_volume_path("/workspace/$(whoami)").is_err());
    }

    #[test]
    fn config_validate_rejects_bad_env_key() {
        let mut config = ContainerConfig {
            image: "sandboxd/agent:latest".into(),
            ..Default::default()
        };
        config.env.insert("1BAD".into(), "x".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn build_run_args_includes_resource_limits_and_ports() {
        let runtime = ContainerRuntime::new(RuntimeKind::Docker);
        let mut config = ContainerConfig {
            image: "sandboxd/agent:latest".into(),
            name: Some("sandboxd-s1".into()),
            mem_limit_mb: 512,
            cpu_limit_cores: 1.5,
            ..Default::default()
        };
        config.ports.push(PortMapping::new(10001, 4096));
        let args = runtime.build_run_args(&config);
        assert!(args.contains(&"512m".to_string()));
        assert!(args.contains(&"1.5".to_string()));
        assert!(args.contains(&"10001:4096".to_string()));
    }

    #[test]
    fn transient_error_classification() {
        let transient = ContainerError::CommandFailed {
            command: "run".into(),
            message: "Cannot connect to the Docker daemon".into(),
        };
        assert!(transient.is_transient());

        let non_transient = ContainerError::CommandFailed {
            command: "run".into(),
            message: "No such image: sandboxd/agent:latest".into(),
        };
        assert!(!non_transient.is_transient());
    }

    #[test]
    fn port_collision_classification() {
        let err = ContainerError::CommandFailed {
            command: "run".into(),
            message: "Bind for 0.0.0.0:10001 failed: port is already allocated".into(),
        };
        assert!(err.is_port_collision());
    }
}
