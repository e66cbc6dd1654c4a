//! Runner for Lightning Web Component tasks.
//!
//! LWC validation is local: `npm install` during setup, then the task's
//! validation command (typically the Jest unit suite). No scratch org.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::error::{Result, SfBenchError};
use crate::domain::result::{TaskResult, TaskStatus};
use crate::domain::task::Task;
use crate::process::run_command;
use crate::workspace;

use super::{clone_and_checkout, task_repo_dir, TaskRunner};

pub struct LwcRunner {
    task: Task,
    repo_dir: PathBuf,
}

impl LwcRunner {
    pub fn new(task: Task, workspace_dir: &Path) -> Self {
        let repo_dir = task_repo_dir(workspace_dir, &task);
        Self { task, repo_dir }
    }
}

#[async_trait]
impl TaskRunner for LwcRunner {
    fn task(&self) -> &Task {
        &self.task
    }

    fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn setup(&mut self) -> Result<()> {
        clone_and_checkout(&self.task, &self.repo_dir).await?;

        run_command(
            "npm install",
            Some(&self.repo_dir),
            self.task.timeouts.setup,
            false,
        )
        .await
        .map_err(|e| match e {
            SfBenchError::Timeout { timeout_secs, .. } => SfBenchError::Timeout {
                command: "npm install".into(),
                timeout_secs,
            },
            SfBenchError::Command { stderr, .. } => {
                SfBenchError::Unexpected(format!("npm install failed: {stderr}"))
            }
            other => other,
        })?;
        Ok(())
    }

    async fn evaluate(&mut self) -> Result<TaskResult> {
        match run_command(
            &self.task.validation.command,
            Some(&self.repo_dir),
            self.task.timeouts.run,
            false,
        )
        .await
        {
            Ok(out) => Ok(
                TaskResult::new(&self.task.instance_id, TaskStatus::Pass, 0.0)
                    .with_detail("exit_code", serde_json::json!(0))
                    .with_detail("stdout", serde_json::json!(tail(&out.stdout)))
                    .with_detail("stderr", serde_json::json!(tail(&out.stderr))),
            ),
            Err(SfBenchError::Command {
                exit_code, stderr, ..
            }) => Ok(
                TaskResult::new(&self.task.instance_id, TaskStatus::Fail, 0.0)
                    .with_detail("exit_code", serde_json::json!(exit_code))
                    .with_detail("stderr", serde_json::json!(tail(&stderr))),
            ),
            Err(e) => Err(e),
        }
    }

    async fn teardown(&mut self) {
        workspace::remove_workspace(&self.repo_dir);
    }
}

/// Last 500 characters of a stream, for result details.
fn tail(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let start = chars.len().saturating_sub(500);
    chars[start..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{TaskType, TimeoutConfig, ValidationConfig};

    fn lwc_task(command: &str, run_timeout: u64) -> Task {
        Task {
            instance_id: "lwc-001".into(),
            task_type: TaskType::Lwc,
            repo_url: "file:///placeholder".into(),
            base_commit: "main".into(),
            problem_description: "component work".into(),
            validation: ValidationConfig {
                command: command.into(),
                expected_outcome: "exit 0".into(),
                code_checks: None,
                additional_checks: None,
            },
            timeouts: TimeoutConfig {
                setup: 60,
                run: run_timeout,
                functional_test: None,
            },
            metadata: None,
            functional_validation: None,
            test_scripts: None,
            golden_patch: None,
            golden_patch_path: None,
        }
    }

    /// Evaluate directly against a prepared directory, skipping setup.
    async fn evaluate_in_dir(command: &str, run_timeout: u64) -> TaskResult {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = LwcRunner::new(lwc_task(command, run_timeout), dir.path());
        std::fs::create_dir_all(&runner.repo_dir).unwrap();
        runner.evaluate().await.unwrap()
    }

    #[tokio::test]
    async fn test_exit_zero_is_pass() {
        let result = evaluate_in_dir("echo test output", 30).await;
        assert_eq!(result.status, TaskStatus::Pass);
        assert!(result.details["stdout"].as_str().unwrap().contains("test output"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_fail_with_stderr_tail() {
        let result = evaluate_in_dir("echo 'jest failed' 1>&2; exit 1", 30).await;
        assert_eq!(result.status, TaskStatus::Fail);
        assert_eq!(result.details["exit_code"], serde_json::json!(1));
        assert!(result.details["stderr"].as_str().unwrap().contains("jest failed"));
    }

    #[tokio::test]
    async fn test_sleeping_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = LwcRunner::new(lwc_task("sleep 2", 1), dir.path());
        std::fs::create_dir_all(&runner.repo_dir).unwrap();
        let err = runner.evaluate().await.unwrap_err();
        assert!(matches!(err, SfBenchError::Timeout { .. }));
    }

    #[test]
    fn test_tail_truncates_long_output() {
        let long = "a".repeat(600);
        assert_eq!(tail(&long).len(), 500);
        assert_eq!(tail("short"), "short");
    }

}
