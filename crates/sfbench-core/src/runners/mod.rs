//! Task runners: one lifecycle, seven variants.
//!
//! Every runner implements `setup -> inject_patch -> evaluate -> teardown`.
//! The shared [`drive`] function owns the one non-negotiable invariant:
//! **teardown runs on every exit path** (setup failures, patch failures,
//! evaluation errors included) so no scratch org outlives its task.
//!
//! Status mapping is attribution-grade: patch-application failures and
//! platform limitations are FAIL (the model produced something that cannot
//! be tested), subprocess timeouts are TIMEOUT, and only unclassified tool
//! trouble is ERROR.

mod apex;
mod architecture;
mod community;
mod deploy;
mod flow;
mod lightning_page;
mod lwc;

pub use apex::ApexRunner;
pub use architecture::ArchitectureRunner;
pub use community::CommunityRunner;
pub use deploy::DeployRunner;
pub use flow::FlowRunner;
pub use lightning_page::LightningPageRunner;
pub use lwc::LwcRunner;

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::get_config;
use crate::domain::error::{Result, SfBenchError};
use crate::domain::result::{TaskResult, TaskStatus};
use crate::domain::task::{RunnerKind, Task};
use crate::org::{self, OrgInfo, OrgRequest};
use crate::patch::apply_patch_with_retry;
use crate::process::run_command;
use crate::workspace;

/// One evaluation lifecycle over a single task.
#[async_trait]
pub trait TaskRunner: Send {
    fn task(&self) -> &Task;
    fn repo_dir(&self) -> &Path;

    /// Acquire resources: clone, provision, deploy as the variant requires.
    async fn setup(&mut self) -> Result<()>;

    /// Run the variant's validation and produce a result. Never called
    /// when `setup` failed.
    async fn evaluate(&mut self) -> Result<TaskResult>;

    /// Release resources. Must tolerate partial setup; failures are
    /// logged by the implementation and never surfaced.
    async fn teardown(&mut self);
}

/// Build the runner variant for a task.
pub fn create_runner(
    task: Task,
    workspace_dir: &Path,
    scratch_org_alias: Option<String>,
) -> Box<dyn TaskRunner> {
    match task.task_type.runner_kind() {
        RunnerKind::Apex => Box::new(ApexRunner::new(task, workspace_dir, scratch_org_alias)),
        RunnerKind::Lwc => Box::new(LwcRunner::new(task, workspace_dir)),
        RunnerKind::Deploy => Box::new(DeployRunner::new(task, workspace_dir, scratch_org_alias)),
        RunnerKind::Flow => Box::new(FlowRunner::new(task, workspace_dir, scratch_org_alias)),
        RunnerKind::LightningPage => {
            Box::new(LightningPageRunner::new(task, workspace_dir, scratch_org_alias))
        }
        RunnerKind::Community => {
            Box::new(CommunityRunner::new(task, workspace_dir, scratch_org_alias))
        }
        RunnerKind::Architecture => {
            Box::new(ArchitectureRunner::new(task, workspace_dir, scratch_org_alias))
        }
    }
}

/// Drive one runner through its full lifecycle.
///
/// Teardown is invoked exactly once, after the lifecycle body finishes on
/// any path. A teardown failure is logged, never surfaced.
pub async fn drive(runner: &mut dyn TaskRunner, patch: Option<&str>) -> TaskResult {
    let start = Instant::now();
    let task_id = runner.task().instance_id.clone();

    let result = run_lifecycle(runner, patch, &task_id, start).await;

    runner.teardown().await;

    info!(task = %task_id, status = result.status.as_str(), "task finished");
    result
}

async fn run_lifecycle(
    runner: &mut dyn TaskRunner,
    patch: Option<&str>,
    task_id: &str,
    start: Instant,
) -> TaskResult {
    if let Err(e) = runner.setup().await {
        return classify_error(task_id, start.elapsed().as_secs_f64(), e);
    }

    if let Some(diff) = patch {
        info!(
            task = %task_id,
            chars = diff.len(),
            lines = diff.lines().count(),
            "applying model patch"
        );
        let timeout = get_config().timeout_patch();
        if let Err(e) = apply_patch_with_retry(runner.repo_dir(), diff, timeout).await {
            return classify_error(task_id, start.elapsed().as_secs_f64(), e);
        }
    }

    match runner.evaluate().await {
        Ok(mut result) => {
            result.duration_seconds = (start.elapsed().as_secs_f64() * 100.0).round() / 100.0;
            result
        }
        Err(e) => classify_error(task_id, start.elapsed().as_secs_f64(), e),
    }
}

/// Map a lifecycle failure onto the result taxonomy.
///
/// ERROR is reserved: it must never be used for a model-attributable kind.
fn classify_error(task_id: &str, duration: f64, e: SfBenchError) -> TaskResult {
    match &e {
        SfBenchError::PatchApplication(_) => {
            warn!(task = task_id, "patch application failed (model issue): {e}");
            TaskResult::new(task_id, TaskStatus::Fail, duration).with_error(e.to_string())
        }
        SfBenchError::PlatformLimitation { .. } => {
            warn!(task = task_id, "platform limitation (model issue): {e}");
            TaskResult::new(task_id, TaskStatus::Fail, duration).with_error(e.to_string())
        }
        SfBenchError::Timeout { .. } => {
            warn!(task = task_id, "task timed out: {e}");
            TaskResult::new(task_id, TaskStatus::Timeout, duration).with_error(e.to_string())
        }
        _ => {
            error!(task = task_id, "task errored: {e}");
            TaskResult::new(task_id, TaskStatus::Error, duration).with_error(e.to_string())
        }
    }
}

// ── shared setup steps ────────────────────────────────────────────────────

/// Clone the task repository and check out the pinned revision.
///
/// Transient git failures (network hiccups, registry blips) are retried
/// with exponential backoff before being surfaced as ERROR.
pub(crate) async fn clone_and_checkout(task: &Task, repo_dir: &Path) -> Result<()> {
    let config = get_config();
    let max_retries = config.max_retries();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let outcome = async {
            workspace::clone_repository(&task.repo_url, repo_dir, task.timeouts.setup).await?;
            workspace::checkout_commit(repo_dir, &task.base_commit, config.timeout_git()).await
        }
        .await;

        match outcome {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = config.initial_delay() * 2f64.powi(attempt as i32 - 1);
                warn!(
                    task = %task.instance_id,
                    attempt,
                    "git setup failed: {e}; retrying in {delay:.1}s"
                );
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Provision a scratch org for a task, or adopt the externally provided
/// alias. Returns the org info and whether this runner owns the org.
pub(crate) async fn acquire_org(
    task: &Task,
    repo_dir: &Path,
    shared_alias: Option<&str>,
) -> Result<(OrgInfo, bool)> {
    if let Some(alias) = shared_alias {
        // Ownership belongs to the caller; never deleted on teardown.
        let username = org::get_scratch_org_username(alias)
            .await
            .unwrap_or_else(|| alias.to_string());
        return Ok((
            OrgInfo {
                username,
                org_id: None,
            },
            false,
        ));
    }

    let mut request = OrgRequest::new(unique_alias(&task.instance_id));
    request.definition_file = org::default_definition_file(Path::new("data/templates"));
    request.cwd = Some(repo_dir.to_path_buf());
    let info = org::create_scratch_org(&request).await?;
    Ok((info, true))
}

/// Deploy the workspace's metadata sources to the default org.
pub(crate) async fn push_metadata(repo_dir: &Path, timeout_secs: u64) -> Result<()> {
    run_command("sf project deploy start", Some(repo_dir), timeout_secs, true)
        .await
        .map(|_| ())
}

/// Delete an owned org and remove the workspace. Shared orgs are left
/// alone. Failures are logged, never raised.
pub(crate) async fn release_resources(
    org_username: Option<&str>,
    owns_org: bool,
    repo_dir: &Path,
) {
    if let Some(username) = org_username {
        if owns_org {
            org::delete_scratch_org(username).await;
        }
    }
    workspace::remove_workspace(repo_dir);
}

fn unique_alias(instance_id: &str) -> String {
    format!("sfbench-{}-{}", instance_id, Utc::now().timestamp())
}

/// Workspace path for a task: `<workspace>/<instance_id>`.
pub(crate) fn task_repo_dir(workspace_dir: &Path, task: &Task) -> PathBuf {
    workspace_dir.join(&task.instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{TaskType, TimeoutConfig, ValidationConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn stub_task(command: &str) -> Task {
        Task {
            instance_id: "lifecycle-test".into(),
            task_type: TaskType::Lwc,
            repo_url: "https://example.com/repo.git".into(),
            base_commit: "main".into(),
            problem_description: "stub".into(),
            validation: ValidationConfig {
                command: command.into(),
                expected_outcome: "exit 0".into(),
                code_checks: None,
                additional_checks: None,
            },
            timeouts: TimeoutConfig {
                setup: 30,
                run: 30,
                functional_test: None,
            },
            metadata: None,
            functional_validation: None,
            test_scripts: None,
            golden_patch: None,
            golden_patch_path: None,
        }
    }

    struct StubRunner {
        task: Task,
        repo_dir: PathBuf,
        fail_setup: bool,
        fail_evaluate: Option<SfBenchError>,
        teardown_count: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskRunner for StubRunner {
        fn task(&self) -> &Task {
            &self.task
        }

        fn repo_dir(&self) -> &Path {
            &self.repo_dir
        }

        async fn setup(&mut self) -> Result<()> {
            if self.fail_setup {
                Err(SfBenchError::Git("clone exploded".into()))
            } else {
                Ok(())
            }
        }

        async fn evaluate(&mut self) -> Result<TaskResult> {
            if let Some(e) = self.fail_evaluate.take() {
                Err(e)
            } else {
                Ok(TaskResult::new(&self.task.instance_id, TaskStatus::Pass, 0.0))
            }
        }

        async fn teardown(&mut self) {
            self.teardown_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stub_runner(fail_setup: bool, fail_evaluate: Option<SfBenchError>) -> StubRunner {
        StubRunner {
            task: stub_task("true"),
            repo_dir: std::env::temp_dir(),
            fail_setup,
            fail_evaluate,
            teardown_count: Arc::new(AtomicU32::new(0)),
        }
    }

    #[tokio::test]
    async fn test_teardown_runs_on_success() {
        let mut runner = stub_runner(false, None);
        let count = runner.teardown_count.clone();
        let result = drive(&mut runner, None).await;
        assert_eq!(result.status, TaskStatus::Pass);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_runs_when_setup_fails() {
        let mut runner = stub_runner(true, None);
        let count = runner.teardown_count.clone();
        let result = drive(&mut runner, None).await;
        assert_eq!(result.status, TaskStatus::Error);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_runs_when_evaluate_fails() {
        let mut runner = stub_runner(
            false,
            Some(SfBenchError::Unexpected("runner bug".into())),
        );
        let count = runner.teardown_count.clone();
        let result = drive(&mut runner, None).await;
        assert_eq!(result.status, TaskStatus::Error);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_patch_is_fail_and_teardown_runs() {
        let mut runner = stub_runner(false, None);
        let count = runner.teardown_count.clone();
        let result = drive(&mut runner, Some("hello world")).await;
        assert_eq!(result.status, TaskStatus::Fail);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("does not contain valid diff"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_status() {
        let mut runner = stub_runner(
            false,
            Some(SfBenchError::Timeout {
                command: "sleep".into(),
                timeout_secs: 1,
            }),
        );
        let result = drive(&mut runner, None).await;
        assert_eq!(result.status, TaskStatus::Timeout);
    }

    #[tokio::test]
    async fn test_platform_limitation_maps_to_fail() {
        let mut runner = stub_runner(
            false,
            Some(SfBenchError::PlatformLimitation {
                message: "ancestorVersion".into(),
                exit_code: 1,
                stderr: String::new(),
            }),
        );
        let result = drive(&mut runner, None).await;
        assert_eq!(result.status, TaskStatus::Fail);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("platform limitation"));
    }

    #[test]
    fn test_unique_alias_contains_instance() {
        let alias = unique_alias("sf-apex-001");
        assert!(alias.starts_with("sfbench-sf-apex-001-"));
    }
}
