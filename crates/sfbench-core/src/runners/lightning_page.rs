//! Runner for Lightning Page and Page Layout configuration tasks.
//!
//! These are metadata-shape tasks: the patched sources must survive a
//! dry-run deploy, and the outcome validator checks that the declared
//! fields and components are present in the metadata.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::domain::error::{Result, SfBenchError};
use crate::domain::result::{TaskResult, TaskStatus};
use crate::domain::task::Task;
use crate::outcome::OutcomeValidator;
use crate::process::run_command;

use super::{
    acquire_org, clone_and_checkout, push_metadata, release_resources, task_repo_dir, TaskRunner,
};

pub struct LightningPageRunner {
    task: Task,
    repo_dir: PathBuf,
    scratch_org_alias: Option<String>,
    org_username: Option<String>,
    owns_org: bool,
}

impl LightningPageRunner {
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

    /// Dry-run deploy the patched metadata; true when it validates.
    async fn dry_run_deploy(&self) -> std::result::Result<bool, SfBenchError> {
        match run_command(
            "sf project deploy start --dry-run",
            Some(&self.repo_dir),
            self.task.timeouts.run,
            true,
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(SfBenchError::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TaskRunner for LightningPageRunner {
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
        let page_valid = self.dry_run_deploy().await?;

        let outcome = OutcomeValidator::new(&self.task, &self.repo_dir)
            .validate_outcome()
            .await;

        let status = if page_valid && outcome.matches_requirements {
            TaskStatus::Pass
        } else {
            TaskStatus::Fail
        };

        Ok(TaskResult::new(&self.task.instance_id, status, 0.0)
            .with_detail("page_validation", json!({"valid": page_valid}))
            .with_detail("match_score", json!(outcome.match_score))
            .with_detail("outcome_validation", serde_json::to_value(outcome)?))
    }

    async fn teardown(&mut self) {
        release_resources(self.org_username.as_deref(), self.owns_org, &self.repo_dir).await;
    }
}
