//! Persistence boundary for session rows (spec §3 "Session row").
//!
//! Grounded on `backend/src/session/repository.rs` (sqlx query style) and
//! `backend/src/db/mod.rs` (pool ownership). The registry talks to this
//! through a narrow interface and never issues ad hoc SQL elsewhere.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::config::Backend;

use super::models::{SessionRecord, SessionStatus};

#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

struct SessionRow {
    session_id: String,
    name: String,
    backend: String,
    status: String,
    api_port: Option<i64>,
    code_port: Option<i64>,
    workspace_path: String,
    repo_url: Option<String>,
    branch: Option<String>,
    container_id: Option<String>,
    created_at: String,
    last_activity_at: String,
    failure_reason: Option<String>,
}

impl FromRow<'_, SqliteRow> for SessionRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            session_id: row.try_get("session_id")?,
            name: row.try_get("name")?,
            backend: row.try_get("backend")?,
            status: row.try_get("status")?,
            api_port: row.try_get("api_port")?,
            code_port: row.try_get("code_port")?,
            workspace_path: row.try_get("workspace_path")?,
            repo_url: row.try_get("repo_url")?,
            branch: row.try_get("branch")?,
            container_id: row.try_get("container_id")?,
            created_at: row.try_get("created_at")?,
            last_activity_at: row.try_get("last_activity_at")?,
            failure_reason: row.try_get("failure_reason")?,
        })
    }
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(SessionRecord {
            session_id: row.session_id,
            name: row.name,
            backend: if row.backend == "local" {
                Backend::Local
            } else {
                Backend::Sandbox
            },
            status: SessionStatus::from_str(&row.status).map_err(anyhow::Error::msg)?,
            api_port: row.api_port.map(|p| p as u16),
            code_port: row.code_port.map(|p| p as u16),
            workspace_path: PathBuf::from(row.workspace_path),
            repo_url: row.repo_url,
            branch: row.branch,
            container_id: row.container_id,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .context("parsing created_at")?
                .with_timezone(&Utc),
            last_activity_at: DateTime::parse_from_rfc3339(&row.last_activity_at)
                .context("parsing last_activity_at")?
                .with_timezone(&Utc),
            failure_reason: row.failure_reason,
        })
    }
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        let backend = match record.backend {
            Backend::Sandbox => "sandbox",
            Backend::Local => "local",
        };
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, name, backend, status, api_port, code_port,
                workspace_path, repo_url, branch, container_id,
                created_at, last_activity_at, failure_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                name = excluded.name,
                backend = excluded.backend,
                status = excluded.status,
                api_port = excluded.api_port,
                code_port = excluded.code_port,
                workspace_path = excluded.workspace_path,
                repo_url = excluded.repo_url,
                branch = excluded.branch,
                container_id = excluded.container_id,
                last_activity_at = excluded.last_activity_at,
                failure_reason = excluded.failure_reason
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.name)
        .bind(backend)
        .bind(record.status.to_string())
        .bind(record.api_port.map(|p| p as i64))
        .bind(record.code_port.map(|p| p as i64))
        .bind(record.workspace_path.to_string_lossy().to_string())
        .bind(&record.repo_url)
        .bind(&record.branch)
        .bind(&record.container_id)
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_activity_at.to_rfc3339())
        .bind(&record.failure_reason)
        .execute(&self.pool)
        .await
        .context("upserting session row")?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session row")?;
        row.map(SessionRecord::try_from).transpose()
    }

    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("listing session rows")?;
        rows.into_iter().map(SessionRecord::try_from).collect()
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("deleting session row")?;
        Ok(())
    }

    /// Secondary consistency check alongside the in-memory Port Allocator:
    /// true if a non-terminal session row already claims `port` as either
    /// its `api_port` or `code_port`. The allocator remains authoritative
    /// for lease state; this only catches drift after a crash restart where
    /// persisted rows outlive the in-memory pool that produced them.
    ///
    /// Grounded on the teacher's `find_free_port_range` conflict scan.
    pub async fn is_port_claimed(&self, port: u16) -> Result<bool> {
        let port = port as i64;
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM sessions
            WHERE status NOT IN ('stopped', 'failed')
              AND (api_port = ? OR code_port = ?)
            LIMIT 1
            "#,
        )
        .bind(port)
        .bind(port)
        .fetch_optional(&self.pool)
        .await
        .context("checking port claim")?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> SessionRepository {
        let db = Database::in_memory().await.unwrap();
        SessionRepository::new(db.pool().clone())
    }

    fn sample(session_id: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            session_id: session_id.to_string(),
            name: "test".to_string(),
            backend: Backend::Sandbox,
            status: SessionStatus::Provisioning,
            api_port: Some(10001),
            code_port: Some(20001),
            workspace_path: PathBuf::from("/tmp/workspaces/s1"),
            repo_url: None,
            branch: None,
            container_id: None,
            created_at: now,
            last_activity_at: now,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let repo = repo().await;
        let record = sample("s1");
        repo.upsert(&record).await.unwrap();

        let fetched = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.session_id, "s1");
        assert_eq!(fetched.api_port, Some(10001));
        assert_eq!(fetched.status, SessionStatus::Provisioning);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_updates_status() {
        let repo = repo().await;
        let mut record = sample("s2");
        repo.upsert(&record).await.unwrap();

        record.status = SessionStatus::Ready;
        repo.upsert(&record).await.unwrap();

        let fetched = repo.get("s2").await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Ready);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let repo = repo().await;
        let record = sample("s3");
        repo.upsert(&record).await.unwrap();
        repo.delete("s3").await.unwrap();
        assert!(repo.get("s3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn is_port_claimed_ignores_terminal_sessions() {
        let repo = repo().await;
        let mut record = sample("s4");
        record.api_port = Some(30001);
        repo.upsert(&record).await.unwrap();

        assert!(repo.is_port_claimed(30001).await.unwrap());
        assert!(!repo.is_port_claimed(30002).await.unwrap());

        record.status = SessionStatus::Stopped;
        repo.upsert(&record).await.unwrap();
        assert!(!repo.is_port_claimed(30001).await.unwrap());
    }
}
