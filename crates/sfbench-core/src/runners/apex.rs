//! Runner for Apex development tasks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::error::{Result, SfBenchError};
use crate::domain::result::{TaskResult, TaskStatus};
use crate::domain::task::Task;
use crate::functional::FunctionalValidator;
use crate::process::{parse_json_output, run_command};

use super::{
    acquire_org, clone_and_checkout, push_metadata, release_resources, task_repo_dir, TaskRunner,
};

/// Clone, provision, deploy; evaluate by running the task's apex test
/// command and parsing the test summary.
pub struct ApexRunner {
    task: Task,
    repo_dir: PathBuf,
    scratch_org_alias: Option<String>,
    org_username: Option<String>,
    owns_org: bool,
}

impl ApexRunner {
    pub fn new(task: Task, workspace_dir: &Path, scratch_org_alias: Option<String>) -> Self {
        let repo_dir = task_repo_dir(workspace_dir, &task);
        Self {
            task,
            repo_dir,
            scratch_org_alias,
            org_username: None,
            owns_org: false,
        }
    }
}

#[async_trait]
impl TaskRunner for ApexRunner {
    fn task(&self) -> &Task {
        &self.task
    }

    fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn setup(&mut self) -> Result<()> {
        clone_and_checkout(&self.task, &self.repo_dir).await?;

        let (org, owned) =
            acquire_org(&self.task, &self.repo_dir, self.scratch_org_alias.as_deref()).await?;
        self.org_username = Some(org.username);
        self.owns_org = owned;

        push_metadata(&self.repo_dir, self.task.timeouts.setup).await
    }

    async fn evaluate(&mut self) -> Result<TaskResult> {
        // Re-deploy so the patched sources are the ones under test. A
        // deploy broken by the patch is a model failure.
        match push_metadata(&self.repo_dir, self.task.timeouts.setup).await {
            Ok(()) => {}
            Err(SfBenchError::Command { message, .. }) => {
                return Ok(
                    TaskResult::new(&self.task.instance_id, TaskStatus::Fail, 0.0)
                        .with_error(format!("deploy failed: {message}"))
                        .with_detail("deploy_status", serde_json::json!("failed")),
                );
            }
            Err(e) => return Err(e),
        }

        let out = match run_command(
            &self.task.validation.command,
            Some(&self.repo_dir),
            self.task.timeouts.run,
            true,
        )
        .await
        {
            Ok(out) => out,
            Err(SfBenchError::Command { message, .. }) => {
                return Ok(
                    TaskResult::new(&self.task.instance_id, TaskStatus::Fail, 0.0)
                        .with_error(message),
                );
            }
            Err(e) => return Err(e),
        };

        let data = parse_json_output(&out.stdout)?;
        let summary = data
            .get("result")
            .and_then(|r| r.get("summary"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        let outcome = summary
            .get("outcome")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_lowercase();
        let failing = summary.get("failing").and_then(|v| v.as_u64()).unwrap_or(0);

        let mut status = if outcome == "passed" || failing == 0 {
            TaskStatus::Pass
        } else {
            TaskStatus::Fail
        };

        let mut result = TaskResult::new(&self.task.instance_id, status, 0.0)
            .with_detail(
                "tests_run",
                summary.get("testsRan").cloned().unwrap_or(0.into()),
            )
            .with_detail("passed", summary.get("passing").cloned().unwrap_or(0.into()))
            .with_detail("failed", serde_json::json!(failing))
            .with_detail("outcome", serde_json::json!(outcome));

        // A declared functional-validation recipe runs the richer rubric;
        // its resolution gate supersedes the bare test outcome.
        if self.task.functional_validation.is_some() {
            if let Some(org) = &self.org_username {
                let validator = FunctionalValidator::new(org.clone(), &self.repo_dir);
                let functional = validator
                    .validate_apex(
                        &self.task.instance_id,
                        self.task.functional_validation.as_ref(),
                        &self.repo_dir,
                    )
                    .await;
                status = if functional.is_resolved() {
                    TaskStatus::Pass
                } else {
                    TaskStatus::Fail
                };
                result.status = status;
                result = result
                    .with_detail("functional_score", serde_json::json!(functional.score))
                    .with_detail("functional_validation", serde_json::to_value(&functional)?);
            }
        }

        Ok(result)
    }

    async fn teardown(&mut self) {
        release_resources(self.org_username.as_deref(), self.owns_org, &self.repo_dir).await;
    }
}
