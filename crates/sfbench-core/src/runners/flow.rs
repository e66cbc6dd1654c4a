//! Runner for Flow automation tasks.
//!
//! Flows are metadata-based and need activation: a Flow that deploys is
//! not a Flow that runs. The evaluation queries the org for an Active
//! flow version matching the task's developer name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::domain::error::{Result, SfBenchError};
use crate::domain::result::{TaskResult, TaskStatus};
use crate::domain::task::Task;
use crate::functional::FunctionalValidator;
use crate::outcome::OutcomeValidator;
use crate::process::{parse_json_output, run_command};

use super::{
    acquire_org, clone_and_checkout, push_metadata, release_resources, task_repo_dir, TaskRunner,
};

pub struct FlowRunner {
    task: Task,
    repo_dir: PathBuf,
    scratch_org_alias: Option<String>,
    org_username: Option<String>,
    owns_org: bool,
}

impl FlowRunner {
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

    /// Developer name declared in the functional-validation recipe, when
    /// present; otherwise any flow in the org qualifies.
    fn flow_name(&self) -> Option<String> {
        self.task
            .functional_validation
            .as_ref()
            .and_then(|v| v.get("flow_name"))
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    /// Query Flow metadata and report whether an Active version exists.
    async fn validate_flow(&self) -> serde_json::Value {
        let clause = match self.flow_name() {
            Some(name) => format!("DeveloperName = '{name}'"),
            None => "DeveloperName LIKE '%'".to_string(),
        };
        let command = format!(
            "sf data query --query \"SELECT Id, MasterLabel, Status FROM Flow WHERE {clause}\" --use-tooling-api --json"
        );

        let mut validation = json!({"valid": false, "active": false, "errors": []});
        match run_command(&command, Some(&self.repo_dir), 60, false).await {
            Ok(out) => {
                if let Ok(data) = parse_json_output(&out.stdout) {
                    let records = data
                        .get("result")
                        .and_then(|r| r.get("records"))
                        .and_then(|r| r.as_array())
                        .cloned()
                        .unwrap_or_default();
                    let active = records
                        .iter()
                        .any(|r| r.get("Status").and_then(|v| v.as_str()) == Some("Active"));
                    validation["active"] = json!(active);
                    validation["valid"] = json!(active);
                }
            }
            Err(e) => {
                validation["errors"] = json!([e.to_string()]);
            }
        }
        validation
    }
}

#[async_trait]
impl TaskRunner for FlowRunner {
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
        // Deploy the patched flow metadata.
        match push_metadata(&self.repo_dir, self.task.timeouts.setup).await {
            Ok(()) => {}
            Err(SfBenchError::Command { message, .. }) => {
                return Ok(
                    TaskResult::new(&self.task.instance_id, TaskStatus::Fail, 0.0)
                        .with_error(format!("flow deploy failed: {message}")),
                );
            }
            Err(e) => return Err(e),
        }

        let flow_validation = self.validate_flow().await;

        // With a declared recipe, the full trigger-and-verify sequence is
        // the signal; otherwise an Active flow version is the bar.
        if self.task.functional_validation.is_some() {
            if let Some(org) = &self.org_username {
                let validator = FunctionalValidator::new(org.clone(), &self.repo_dir);
                let functional = validator
                    .validate_flow(
                        &self.task.instance_id,
                        self.task.functional_validation.as_ref(),
                        &self.repo_dir,
                    )
                    .await;
                let status = if functional.is_resolved() {
                    TaskStatus::Pass
                } else {
                    TaskStatus::Fail
                };
                return Ok(TaskResult::new(&self.task.instance_id, status, 0.0)
                    .with_detail("flow_validation", flow_validation)
                    .with_detail("functional_score", json!(functional.score))
                    .with_detail(
                        "functional_validation",
                        serde_json::to_value(&functional)?,
                    ));
            }
        }

        let outcome = OutcomeValidator::new(&self.task, &self.repo_dir)
            .validate_outcome()
            .await;

        let active = flow_validation
            .get("valid")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let status = if active {
            TaskStatus::Pass
        } else {
            TaskStatus::Fail
        };

        Ok(TaskResult::new(&self.task.instance_id, status, 0.0)
            .with_detail("flow_validation", flow_validation)
            .with_detail("match_score", json!(outcome.match_score))
            .with_detail("outcome_validation", serde_json::to_value(outcome)?))
    }

    async fn teardown(&mut self) {
        release_resources(self.org_username.as_deref(), self.owns_org, &self.repo_dir).await;
    }
}
