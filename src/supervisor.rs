//! Lifecycle Supervisor (spec §4.6): the single background task that evicts
//! idle sessions, reaps degraded ones, and reconciles orphan containers left
//! by an unclean shutdown. Never creates sessions, only destroys.
//!
//! Grounded on the teacher's boot-time orphan cleanup idiom (scan labelled
//! containers, diff against known-live rows, remove what's left) and its
//! general periodic-sweep background task shape.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};

use crate::chat::ChatProxy;
use crate::config::Settings;
use crate::container::ContainerManager;
use crate::session::{CloseReason, SessionRegistry, SessionStatus};

pub struct Supervisor {
    sessions: Arc<SessionRegistry>,
    chat: Arc<ChatProxy>,
    containers: Arc<ContainerManager>,
    settings: Arc<Settings>,
}

/// Per-pass telemetry (spec §4.6 step 4: "count live, count evicted, count
/// failed").
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub live: usize,
    pub evicted: usize,
    pub closed_degraded: usize,
}

impl Supervisor {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        chat: Arc<ChatProxy>,
        containers: Arc<ContainerManager>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            sessions,
            chat,
            containers,
            settings,
        }
    }

    /// One-shot boot-time reconciliation (spec §4.6): remove containers
    /// labelled by this service with no corresponding live session row.
    pub async fn reconcile_orphans(&self) {
        let orphans = match self.sessions.find_container_orphans().await {
            Ok(orphans) => orphans,
            Err(e) => {
                warn!("orphan reconciliation failed to list containers: {e}");
                return;
            }
        };
        if orphans.is_empty() {
            return;
        }
        info!("reconciling {} orphan container(s) from a prior shutdown", orphans.len());
        for container_id in orphans {
            if let Err(e) = self.containers.remove_orphan(&container_id).await {
                warn!("failed to remove orphan container {container_id}: {e}");
            }
        }
    }

    /// Runs the periodic sweep forever at `sweep_interval`. Intended to be
    /// spawned as its own task alongside the HTTP edge.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval());
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            let report = self.sweep_once().await;
            info!(
                "supervisor sweep: live={} evicted={} closed_degraded={}",
                report.live, report.evicted, report.closed_degraded
            );
        }
    }

    /// A single sweep pass (spec §4.6 steps 1-4). Exposed separately from
    /// [`Self::run`] so it can be driven deterministically in tests.
    pub async fn sweep_once(&self) -> SweepReport {
        let idle_timeout = self.settings.idle_timeout();
        let max_failures = self.settings.max_consecutive_health_failures;
        let now = Utc::now();

        let snapshot = self.sessions.list();
        let mut report = SweepReport {
            live: snapshot.len(),
            ..Default::default()
        };

        for record in snapshot {
            if !matches!(record.status, SessionStatus::Ready | SessionStatus::Degraded) {
                continue;
            }

            let idle_for = now.signed_duration_since(record.last_activity_at);
            if idle_for.to_std().unwrap_or(Duration::ZERO) > idle_timeout {
                self.chat.interrupt(&record.session_id);
                if let Err(e) = self.sessions.close(&record.session_id, CloseReason::Idle).await {
                    warn!("idle eviction of session {} failed: {e}", record.session_id);
                } else {
                    report.evicted += 1;
                }
                continue;
            }

            let failures = self.sessions.health_check(&record.session_id).await;
            if failures >= max_failures {
                warn!(
                    "session {} failed {failures} consecutive health probes, closing",
                    record.session_id
                );
                self.chat.interrupt(&record.session_id);
                if let Err(e) = self
                    .sessions
                    .close(&record.session_id, CloseReason::Degraded)
                    .await
                {
                    warn!("closing degraded session {} failed: {e}", record.session_id);
                } else {
                    report.closed_degraded += 1;
                }
            }
        }

        report
    }
}
