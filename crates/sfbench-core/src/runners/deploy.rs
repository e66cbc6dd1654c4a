//! Runner for deployment and metadata-configuration tasks.
//!
//! Also serves the PROFILE and PERMISSION_SET aliases: anything whose
//! validation is "the metadata deploys" routes here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::error::{Result, SfBenchError};
use crate::domain::result::{TaskResult, TaskStatus};
use crate::domain::task::Task;
use crate::process::{parse_json_output, run_command};

use super::{acquire_org, clone_and_checkout, release_resources, task_repo_dir, TaskRunner};

pub struct DeployRunner {
    task: Task,
    repo_dir: PathBuf,
    scratch_org_alias: Option<String>,
    org_username: Option<String>,
    owns_org: bool,
}

impl DeployRunner {
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
impl TaskRunner for DeployRunner {
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
        Ok(())
    }

    async fn evaluate(&mut self) -> Result<TaskResult> {
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
                        .with_error(message)
                        .with_detail("deploy_status", serde_json::json!("failed")),
                );
            }
            Err(e) => return Err(e),
        };

        let data = parse_json_output(&out.stdout)?;
        let deploy_result = data.get("result").cloned().unwrap_or_else(|| serde_json::json!({}));

        let status_value = deploy_result
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_lowercase();
        let success = deploy_result
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let status = if status_value == "succeeded" || success {
            TaskStatus::Pass
        } else {
            TaskStatus::Fail
        };

        Ok(TaskResult::new(&self.task.instance_id, status, 0.0)
            .with_detail("deploy_status", serde_json::json!(status_value))
            .with_detail(
                "components_deployed",
                deploy_result
                    .get("numberComponentsDeployed")
                    .cloned()
                    .unwrap_or(0.into()),
            )
            .with_detail(
                "components_total",
                deploy_result
                    .get("numberComponentsTotal")
                    .cloned()
                    .unwrap_or(0.into()),
            ))
    }

    async fn teardown(&mut self) {
        release_resources(self.org_username.as_deref(), self.owns_org, &self.repo_dir).await;
    }
}
