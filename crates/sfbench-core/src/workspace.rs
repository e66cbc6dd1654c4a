//! Task-scoped repository workspaces: clone, checkout, cleanup.
//!
//! Each task owns `<workspace>/<instance_id>` exclusively for the duration
//! of one evaluation. Cleanup is best-effort; a failed removal is logged
//! and never fails the task.

use std::path::Path;

use tracing::{info, warn};

use crate::config::get_config;
use crate::domain::error::{Result, SfBenchError};
use crate::process::run_command;

/// Clone a repository into `target_dir`, replacing any previous contents.
pub async fn clone_repository(repo_url: &str, target_dir: &Path, timeout_secs: u64) -> Result<()> {
    if target_dir.exists() {
        std::fs::remove_dir_all(target_dir)?;
    }
    if let Some(parent) = target_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!(repo = repo_url, dir = %target_dir.display(), "cloning repository");

    let command = format!("git clone {} {}", repo_url, target_dir.display());
    match run_command(&command, None, timeout_secs, false).await {
        Ok(_) => Ok(()),
        Err(SfBenchError::Timeout { timeout_secs, .. }) => Err(SfBenchError::Git(format!(
            "git clone timed out after {timeout_secs} seconds"
        ))),
        Err(SfBenchError::Command { stderr, .. }) => {
            Err(SfBenchError::Git(format!("failed to clone repository: {stderr}")))
        }
        Err(e) => Err(SfBenchError::Git(format!(
            "unexpected error cloning repository: {e}"
        ))),
    }
}

/// Check out a revision in an existing clone.
pub async fn checkout_commit(repo_dir: &Path, commit: &str, timeout_secs: u64) -> Result<()> {
    let command = format!("git checkout {commit}");
    match run_command(&command, Some(repo_dir), timeout_secs, false).await {
        Ok(_) => Ok(()),
        Err(SfBenchError::Timeout { timeout_secs, .. }) => Err(SfBenchError::Git(format!(
            "git checkout timed out after {timeout_secs} seconds"
        ))),
        Err(SfBenchError::Command { stderr, .. }) => Err(SfBenchError::Git(format!(
            "failed to checkout commit {commit}: {stderr}"
        ))),
        Err(e) => Err(SfBenchError::Git(format!(
            "unexpected error checking out commit: {e}"
        ))),
    }
}

/// Clone at the default git timeout from config.
pub async fn clone_repository_default(repo_url: &str, target_dir: &Path) -> Result<()> {
    clone_repository(repo_url, target_dir, get_config().timeout_git()).await
}

/// Recursively remove a task workspace. Failures are logged, never raised.
pub fn remove_workspace(dir: &Path) {
    if !dir.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), "failed to clean up workspace: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::run_command;

    async fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for cmd in [
            "git init -b main",
            "git config user.name test-user",
            "git config user.email test@example.com",
            "git commit --allow-empty -m initial",
        ] {
            run_command(cmd, Some(dir.path()), 30, false).await.unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_clone_and_checkout_local_repo() {
        let source = make_git_repo().await;
        let sha = run_command("git rev-parse HEAD", Some(source.path()), 30, false)
            .await
            .unwrap()
            .stdout
            .trim()
            .to_string();

        let workspace = tempfile::tempdir().unwrap();
        let target = workspace.path().join("task-001");
        let url = format!("file://{}", source.path().display());

        clone_repository(&url, &target, 60).await.unwrap();
        assert!(target.join(".git").exists());

        checkout_commit(&target, &sha, 60).await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_replaces_existing_dir() {
        let source = make_git_repo().await;
        let workspace = tempfile::tempdir().unwrap();
        let target = workspace.path().join("task-002");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.txt"), "old").unwrap();

        let url = format!("file://{}", source.path().display());
        clone_repository(&url, &target, 60).await.unwrap();

        assert!(!target.join("stale.txt").exists());
        assert!(target.join(".git").exists());
    }

    #[tokio::test]
    async fn test_clone_invalid_url_is_git_error() {
        let workspace = tempfile::tempdir().unwrap();
        let target = workspace.path().join("task-003");
        let err = clone_repository("file:///nonexistent/repo.git", &target, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, SfBenchError::Git(_)));
    }

    #[tokio::test]
    async fn test_checkout_unknown_commit_is_git_error() {
        let repo = make_git_repo().await;
        let err = checkout_commit(repo.path(), "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef", 60)
            .await
            .unwrap_err();
        assert!(matches!(err, SfBenchError::Git(_)));
    }

    #[test]
    fn test_remove_workspace_tolerates_missing_dir() {
        remove_workspace(Path::new("/nonexistent/workspace/task"));
    }
}
