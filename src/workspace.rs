//! Workspace Provisioner (spec §4.3): per-session directory creation,
//! configuration-template copy, git clone with credential scrubbing, and
//! destroy-on-explicit-delete.
//!
//! Grounded on the teacher's `templates/service.rs` clone/pull shell-out
//! pattern (`tokio::process::Command` -> `git`, `.output()`, stderr surfaced
//! on non-zero exit).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use tokio::process::Command;

use crate::error::{AppError, AppResult};

const CLONE_RETRY_ATTEMPTS: u32 = 3;
const CLONE_RETRY_BACKOFF: Duration = Duration::from_secs(2);

pub struct WorkspaceProvisioner {
    workspace_root: PathBuf,
    /// Read-only configuration template (agent prompt library, tool
    /// manifests) copied into every new workspace. Process-wide, established
    /// at startup (spec §3 "Workspace").
    template_dir: PathBuf,
}

impl WorkspaceProvisioner {
    pub fn new(workspace_root: PathBuf, template_dir: PathBuf) -> Self {
        Self {
            workspace_root,
            template_dir,
        }
    }

    /// Refuse to start if the workspace root is not writable (spec §6).
    pub async fn check_root_writable(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.workspace_root)
            .await
            .with_context(|| {
                format!(
                    "workspace_root {} is not writable",
                    self.workspace_root.display()
                )
            })?;
        let probe = self.workspace_root.join(".sandboxd-write-probe");
        tokio::fs::write(&probe, b"").await.with_context(|| {
            format!(
                "workspace_root {} is not writable",
                self.workspace_root.display()
            )
        })?;
        let _ = tokio::fs::remove_file(&probe).await;
        Ok(())
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.workspace_root.join(session_id)
    }

    /// Create `{workspace_root}/{session_id}` and seed it from the
    /// configuration template. Fails if the directory already exists and is
    /// non-empty.
    pub async fn create(&self, session_id: &str) -> AppResult<PathBuf> {
        let path = self.path_for(session_id);

        if path.exists() {
            let mut entries = tokio::fs::read_dir(&path)
                .await
                .map_err(|e| AppError::ProvisioningFailed(e.to_string()))?;
            if entries
                .next_entry()
                .await
                .map_err(|e| AppError::ProvisioningFailed(e.to_string()))?
                .is_some()
            {
                return Err(AppError::ProvisioningFailed(format!(
                    "workspace already exists and is non-empty: {}",
                    path.display()
                )));
            }
        } else {
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| AppError::ProvisioningFailed(e.to_string()))?;
        }

        if self.template_dir.exists() {
            copy_dir_recursive(&self.template_dir, &path)
                .await
                .map_err(|e| AppError::ProvisioningFailed(e.to_string()))?;
        }

        Ok(path)
    }

    /// Clone `repo_url` into `path` and check out `{branch}-{session_id}`.
    /// Credentials are embedded in the remote URL only for the clone
    /// invocation; the worktree's `.git/config` is rewritten afterward to a
    /// credential-free URL.
    pub async fn clone(
        &self,
        path: &Path,
        session_id: &str,
        repo_url: &str,
        branch: &str,
        credential: Option<&str>,
    ) -> AppResult<()> {
        let clone_url = with_credential(repo_url, credential);

        let mut last_err = None;
        for attempt in 1..=CLONE_RETRY_ATTEMPTS {
            match self.try_clone(path, &clone_url).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        "git clone attempt {}/{} for session {} failed: {:#}",
                        attempt, CLONE_RETRY_ATTEMPTS, session_id, e
                    );
                    last_err = Some(e);
                    if attempt < CLONE_RETRY_ATTEMPTS {
                        tokio::time::sleep(CLONE_RETRY_BACKOFF).await;
                    }
                }
            }
        }

        if let Some(err) = last_err {
            self.destroy(path).await;
            return Err(AppError::ProvisioningFailed(format!(
                "git clone failed after {} attempts: {:#}",
                CLONE_RETRY_ATTEMPTS, err
            )));
        }

        // Scrub credentials from the persisted remote URL before anything
        // else touches the worktree.
        if let Err(e) = self.set_remote_url(path, repo_url).await {
            self.destroy(path).await;
            return Err(AppError::ProvisioningFailed(format!(
                "failed to scrub clone credentials: {:#}",
                e
            )));
        }

        let feature_branch = format!("{}-{}", branch, session_id);
        if let Err(e) = self.checkout_feature_branch(path, &feature_branch).await {
            self.destroy(path).await;
            return Err(AppError::ProvisioningFailed(format!(
                "failed to create branch {}: {:#}",
                feature_branch, e
            )));
        }

        info!(
            "cloned {} into {} on branch {}",
            repo_url,
            path.display(),
            feature_branch
        );
        Ok(())
    }

    async fn try_clone(&self, path: &Path, clone_url: &str) -> Result<()> {
        let output = Command::new("git")
            .arg("clone")
            .arg(clone_url)
            .arg(path)
            .output()
            .await
            .context("failed to run git clone")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git clone failed: {}", stderr.trim());
        }
        Ok(())
    }

    async fn set_remote_url(&self, path: &Path, clean_url: &str) -> Result<()> {
        let output = Command::new("git")
            .arg("-C")
            .arg(path)
            .arg("remote")
            .arg("set-url")
            .arg("origin")
            .arg(clean_url)
            .output()
            .await
            .context("failed to run git remote set-url")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git remote set-url failed: {}", stderr.trim());
        }
        Ok(())
    }

    async fn checkout_feature_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let output = Command::new("git")
            .arg("-C")
            .arg(path)
            .arg("checkout")
            .arg("-b")
            .arg(branch)
            .output()
            .await
            .context("failed to run git checkout -b")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git checkout -b {} failed: {}", branch, stderr.trim());
        }
        Ok(())
    }

    /// Recursive delete. Only called on explicit session deletion, never on
    /// idle eviction (spec §3, §8 scenario 5).
    pub async fn destroy(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("failed to remove workspace {}: {}", path.display(), e);
            }
        }
    }
}

/// Embeds a credential into a `https://` remote URL for the clone step only.
fn with_credential(repo_url: &str, credential: Option<&str>) -> String {
    let Some(cred) = credential else {
        return repo_url.to_string();
    };
    if let Some(rest) = repo_url.strip_prefix("https://") {
        format!("https://{}@{}", cred, rest)
    } else {
        repo_url.to_string()
    }
}

fn copy_dir_recursive<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&src_path, &dst_path).await?;
            } else {
                tokio::fs::copy(&src_path, &dst_path).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_seeds_from_template() {
        let root = tempdir().unwrap();
        let template = tempdir().unwrap();
        tokio::fs::write(template.path().join("AGENTS.md"), b"hello")
            .await
            .unwrap();

        let provisioner =
            WorkspaceProvisioner::new(root.path().to_path_buf(), template.path().to_path_buf());
        let path = provisioner.create("s1").await.unwrap();

        assert!(path.join("AGENTS.md").exists());
    }

    #[tokio::test]
    async fn create_rejects_nonempty_existing_directory() {
        let root = tempdir().unwrap();
        let template = tempdir().unwrap();
        let provisioner =
            WorkspaceProvisioner::new(root.path().to_path_buf(), template.path().to_path_buf());

        let existing = root.path().join("s1");
        tokio::fs::create_dir_all(&existing).await.unwrap();
        tokio::fs::write(existing.join("stray.txt"), b"x")
            .await
            .unwrap();

        let result = provisioner.create("s1").await;
        assert!(matches!(result, Err(AppError::ProvisioningFailed(_))));
    }

    #[test]
    fn credential_is_embedded_only_in_https_urls() {
        assert_eq!(
            with_credential("https://git.example/x.git", Some("tok")),
            "https://tok@git.example/x.git"
        );
        assert_eq!(
            with_credential("git@git.example:x.git", Some("tok")),
            "git@git.example:x.git"
        );
    }

    #[tokio::test]
    async fn destroy_is_idempotent_on_missing_path() {
        let root = tempdir().unwrap();
        let template = tempdir().unwrap();
        let provisioner =
            WorkspaceProvisioner::new(root.path().to_path_buf(), template.path().to_path_buf());
        provisioner.destroy(&root.path().join("never-existed")).await;
    }
}
