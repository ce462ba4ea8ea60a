//! Global configuration (spec §6): layered defaults -> TOML file -> env -> CLI,
//! validated once at startup and never mutated afterward.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use config::{Config as ConfigSource, Environment, File, FileFormat};
use serde::Deserialize;

use crate::port::PortRange;

/// CLI surface. Only `serve` exists today; the shape mirrors the teacher's
/// `CommonOpts`/`Cli` split between cross-cutting flags and the subcommand.
#[derive(Debug, Parser)]
#[command(author, version, about = "Sandbox session executor")]
pub struct Cli {
    /// Override the config file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
    /// Increase log verbosity (stackable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Bind address override for the HTTP edge.
    #[arg(long, global = true)]
    pub bind_addr: Option<SocketAddr>,
}

/// The validated, immutable-after-startup configuration (spec §3, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub image: String,
    pub api_port_range: (u16, u16),
    pub code_port_range: (u16, u16),
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    pub mem_limit_mb: u64,
    pub cpu_limit_cores: f64,
    pub agent_key: String,
    pub agent_base_url: String,
    pub agent_model: String,
    /// Path to the agent binary the Legacy Local Executor spawns per
    /// session. Only consulted when `backend = "local"`.
    #[serde(default = "default_local_agent_binary")]
    pub local_agent_binary: String,
    #[serde(default = "default_host_loopback")]
    pub host_loopback: String,
    pub workspace_root: PathBuf,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_max_health_failures")]
    pub max_consecutive_health_failures: u32,
    #[serde(default = "default_max_provision_retries")]
    pub max_provision_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sandbox,
    Local,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Sandbox
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_request_timeout_secs() -> u64 {
    30
}
fn default_stream_timeout_secs() -> u64 {
    300
}
fn default_health_check_timeout_secs() -> u64 {
    30
}
fn default_idle_timeout_secs() -> u64 {
    1800
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_host_loopback() -> String {
    "host.docker.internal".to_string()
}
fn default_local_agent_binary() -> String {
    "sandboxd-agent".to_string()
}
fn default_container_runtime() -> String {
    "docker".to_string()
}
fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("valid default bind addr")
}
fn default_database_path() -> PathBuf {
    PathBuf::from("sandboxd.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_health_failures() -> u32 {
    3
}
fn default_max_provision_retries() -> u32 {
    3
}

impl Settings {
    /// Load layered configuration: built-in defaults, then an optional TOML
    /// file, then `SANDBOXD_*` environment variables, then explicit CLI
    /// overrides. Unknown keys in the TOML file are rejected (ConfigInvalid).
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = ConfigSource::builder();

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.clone()).format(FileFormat::Toml));
        } else if let Some(dir) = dirs::config_dir() {
            let candidate = dir.join("sandboxd").join("config.toml");
            if candidate.exists() {
                builder = builder.add_source(File::from(candidate).format(FileFormat::Toml));
            }
        }

        builder = builder.add_source(Environment::with_prefix("SANDBOXD").separator("__"));

        let source = builder
            .build()
            .context("assembling configuration sources")?;

        let mut settings: Settings = source
            .try_deserialize()
            .context("configuration failed validation (unknown key or missing field)")?;

        if let Some(addr) = cli.bind_addr {
            settings.bind_addr = addr;
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            bail!("configuration invalid: `image` must not be empty");
        }
        if self.api_port_range.0 > self.api_port_range.1 {
            bail!("configuration invalid: api_port_range is inverted");
        }
        if self.code_port_range.0 > self.code_port_range.1 {
            bail!("configuration invalid: code_port_range is inverted");
        }
        if ranges_overlap(self.api_port_range, self.code_port_range) {
            bail!("configuration invalid: api_port_range and code_port_range must be disjoint");
        }
        Ok(())
    }

    pub fn api_port_range(&self) -> PortRange {
        PortRange::new(self.api_port_range.0, self.api_port_range.1)
    }

    pub fn code_port_range(&self) -> PortRange {
        PortRange::new(self.code_port_range.0, self.code_port_range.1)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn health_check_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

fn ranges_overlap(a: (u16, u16), b: (u16, u16)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings {
            image: "sandboxd/agent:latest".into(),
            api_port_range: (10001, 10100),
            code_port_range: (20001, 20100),
            request_timeout_secs: 30,
            stream_timeout_secs: 300,
            health_check_timeout_secs: 30,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
            mem_limit_mb: 512,
            cpu_limit_cores: 1.0,
            agent_key: "test".into(),
            agent_base_url: "http://api.example/v1".into(),
            agent_model: "claude".into(),
            local_agent_binary: default_local_agent_binary(),
            host_loopback: default_host_loopback(),
            workspace_root: PathBuf::from("/tmp/workspaces"),
            backend: Backend::Sandbox,
            container_runtime: "docker".into(),
            bind_addr: default_bind_addr(),
            database_path: PathBuf::from("test.db"),
            log_level: "info".into(),
            log_format: LogFormat::Text,
            max_consecutive_health_failures: 3,
            max_provision_retries: 3,
        }
    }

    #[test]
    fn rejects_overlapping_port_ranges() {
        let mut settings = base();
        settings.code_port_range = (10050, 10150);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_empty_image() {
        let mut settings = base();
        settings.image = "".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn accepts_disjoint_ranges() {
        assert!(base().validate().is_ok());
    }
}
