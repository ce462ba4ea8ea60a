//! Session data model (spec §3 "Session record").
//!
//! Grounded on the teacher's `session/models.rs` (`SessionStatus`,
//! `is_active`/`is_terminal`), generalized to the state machine the
//! Container Manager actually drives (§4.4) rather than the teacher's
//! simpler pending/starting/running/stopping/stopped/failed set.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Provisioning,
    Starting,
    Ready,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "degraded" => Ok(Self::Degraded),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// In-flight or live session state (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub name: String,
    pub backend: Backend,
    pub status: SessionStatus,
    pub api_port: Option<u16>,
    pub code_port: Option<u16>,
    pub workspace_path: PathBuf,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Ready | SessionStatus::Degraded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SessionStatus::Stopped | SessionStatus::Failed)
    }
}

/// Parameters for `SessionRegistry::get_or_create` (spec §3/§4.1).
#[derive(Debug, Clone, Default)]
pub struct SessionSpec {
    pub name: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub credential: Option<String>,
}

/// Why a session is being closed — governs whether the workspace directory
/// is destroyed (spec §3: "Destroyed only when the session is explicitly
/// deleted (not on idle eviction)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    UserRequested,
    Idle,
    Degraded,
}

impl CloseReason {
    pub fn destroys_workspace(self) -> bool {
        matches!(self, Self::UserRequested)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserRequested => "user_requested",
            Self::Idle => "idle",
            Self::Degraded => "degraded",
        }
    }
}
