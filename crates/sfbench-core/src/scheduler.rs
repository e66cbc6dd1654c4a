//! Task scheduler: bounded worker pool, immediate result persistence,
//! and checkpoint-based resume.
//!
//! Workers are parallel, not cooperative: each runs one task from setup
//! through teardown before pulling the next. Result writing is serialized
//! by a single mutex so per-task JSON files and `summary.json` are never
//! torn. No data is shared between tasks beyond read-only configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::audit::AuditLogger;
use crate::checkpoint::CheckpointManager;
use crate::domain::error::{Result, SfBenchError};
use crate::domain::result::{RunStatistics, TaskResult, TaskStatus};
use crate::domain::task::{Task, TaskValidator};
use crate::runners::{self, TaskRunner};

/// Builds a runner for one task. The default is [`runners::create_runner`];
/// tests inject stubs through this seam.
pub type RunnerFactory =
    Arc<dyn Fn(Task, &Path, Option<String>) -> Box<dyn TaskRunner> + Send + Sync>;

/// Options for one evaluation run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Identifier used for checkpoint files and the audit trail.
    pub evaluation_id: String,
    /// Model identity recorded in audit records.
    pub model_name: String,
    /// Enables checkpoint/resume when set.
    pub checkpoint_dir: Option<PathBuf>,
    /// Enables the append-only audit trail when set.
    pub audit_dir: Option<PathBuf>,
    /// Root of the organized per-step log tree when set.
    pub log_dir: Option<PathBuf>,
    /// Externally provided scratch-org alias. Ownership stays with the
    /// caller; only valid for single-task runs since org ownership is
    /// exclusive per task.
    pub scratch_org_alias: Option<String>,
}

struct SharedState {
    results: Vec<TaskResult>,
    completed: Vec<String>,
    result_map: serde_json::Map<String, serde_json::Value>,
}

/// Dispatches tasks to a bounded worker pool and collects results.
pub struct Scheduler {
    workspace_dir: PathBuf,
    results_dir: PathBuf,
    max_workers: usize,
    factory: RunnerFactory,
}

impl Scheduler {
    pub fn new(
        workspace_dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
        max_workers: usize,
    ) -> Self {
        Self::with_factory(
            workspace_dir,
            results_dir,
            max_workers,
            Arc::new(|task, workspace, alias| runners::create_runner(task, workspace, alias)),
        )
    }

    /// Construct with a custom runner factory.
    pub fn with_factory(
        workspace_dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
        max_workers: usize,
        factory: RunnerFactory,
    ) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            results_dir: results_dir.into(),
            max_workers: max_workers.max(1),
            factory,
        }
    }

    /// Load and validate a task file (JSON array or single object).
    pub fn load_tasks(tasks_file: &Path) -> Result<Vec<Task>> {
        TaskValidator::validate_and_load(tasks_file)
    }

    /// Run every task, skipping ones a verified checkpoint marks complete.
    ///
    /// Each result is written to `<results>/<task_id>.json` the moment it
    /// exists; `summary.json` is written at the end. Individual task
    /// failures never fail the run.
    pub async fn run_all(
        &self,
        tasks: Vec<Task>,
        solutions: &HashMap<String, String>,
        options: &RunOptions,
    ) -> Result<Vec<TaskResult>> {
        std::fs::create_dir_all(&self.results_dir)?;

        let checkpoint_manager = match &options.checkpoint_dir {
            Some(dir) => Some(Arc::new(CheckpointManager::new(dir.clone())?)),
            None => None,
        };

        // Checkpoints and audit records need a stable id even when the
        // caller did not name the run.
        let evaluation_id = if options.evaluation_id.is_empty() {
            format!("eval-{}", uuid::Uuid::new_v4())
        } else {
            options.evaluation_id.clone()
        };

        let audit_logger = match &options.audit_dir {
            Some(dir) => Some(Arc::new(Mutex::new(AuditLogger::new(
                evaluation_id.clone(),
                dir,
            )?))),
            None => None,
        };

        // Resume: merge prior results and skip completed tasks.
        let mut state = SharedState {
            results: Vec::new(),
            completed: Vec::new(),
            result_map: serde_json::Map::new(),
        };
        if let Some(manager) = &checkpoint_manager {
            if let Some(checkpoint) = manager.load_checkpoint(&evaluation_id) {
                for (task_id, value) in &checkpoint.results {
                    match serde_json::from_value::<TaskResult>(value.clone()) {
                        Ok(result) => state.results.push(result),
                        Err(e) => warn!(task = %task_id, "skipping unreadable checkpoint result: {e}"),
                    }
                }
                state.completed = checkpoint.completed_tasks.clone();
                state.result_map = checkpoint.results.clone();
                info!(
                    evaluation = %evaluation_id,
                    resumed = state.completed.len(),
                    "resuming from checkpoint"
                );
            }
        }

        let completed: HashSet<String> = state.completed.iter().cloned().collect();
        let pending: Vec<Task> = tasks
            .into_iter()
            .filter(|t| !completed.contains(&t.instance_id))
            .collect();

        if options.scratch_org_alias.is_some() && pending.len() > 1 {
            // Org ownership is exclusive per task; a shared alias across
            // concurrent tasks would violate it.
            return Err(SfBenchError::InvalidTask(
                "a shared scratch_org_alias is only valid for single-task runs".into(),
            ));
        }

        info!(
            pending = pending.len(),
            skipped = completed.len(),
            workers = self.max_workers,
            "dispatching tasks"
        );

        let state = Arc::new(Mutex::new(state));
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, String> = HashMap::new();

        for task in pending {
            let task_id = task.instance_id.clone();
            let patch = solutions.get(&task_id).cloned();
            let factory = Arc::clone(&self.factory);
            let semaphore = Arc::clone(&semaphore);
            let state = Arc::clone(&state);
            let workspace_dir = self.workspace_dir.clone();
            let results_dir = self.results_dir.clone();
            let alias = options.scratch_org_alias.clone();
            let checkpoint_manager = checkpoint_manager.clone();
            let evaluation_id = evaluation_id.clone();
            let audit_logger = audit_logger.clone();
            let model_name = options.model_name.clone();
            let log_manager = options.log_dir.clone().map(crate::logs::LogManager::new);

            let handle = join_set.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");

                let audit_handle = match &audit_logger {
                    Some(logger) => Some(
                        logger.lock().await.create_audit(
                            &model_name,
                            &task.instance_id,
                            &task.problem_description,
                            patch.as_deref().unwrap_or(""),
                            None,
                        ),
                    ),
                    None => None,
                };

                let mut runner = factory(task, &workspace_dir, alias);
                let result = runners::drive(runner.as_mut(), patch.as_deref()).await;

                if let (Some(logger), Some(audit)) = (&audit_logger, audit_handle) {
                    let mut logger = logger.lock().await;
                    if let Some(message) = &result.error_message {
                        logger.log_execution(audit, message, "ERROR");
                    }
                    logger.update_validation_results(
                        audit,
                        serde_json::to_value(&result.details).unwrap_or_default(),
                    );
                    logger.finalize_audit(audit, result.status.as_str(), None);
                }

                if let Some(logs) = &log_manager {
                    let line = format!(
                        "{} {} ({:.1}s){}",
                        result.task_id,
                        result.status.as_str(),
                        result.duration_seconds,
                        result
                            .error_message
                            .as_deref()
                            .map(|m| format!(": {m}"))
                            .unwrap_or_default()
                    );
                    if let Err(e) = logs.write_log(
                        &evaluation_id,
                        &model_name,
                        &result.task_id,
                        "run_instance",
                        &line,
                    ) {
                        warn!(task = %result.task_id, "failed to write instance log: {e}");
                    }
                }

                // Serialize all result writes through the shared mutex.
                let mut state = state.lock().await;
                if let Err(e) = persist_result(&results_dir, &result) {
                    error!(task = %result.task_id, "failed to persist result: {e}");
                }
                info!(
                    "completed: {} - {} ({:.1}s)",
                    result.task_id,
                    result.status.as_str(),
                    result.duration_seconds
                );

                state.completed.push(result.task_id.clone());
                if let Ok(value) = serde_json::to_value(&result) {
                    state.result_map.insert(result.task_id.clone(), value);
                }
                state.results.push(result);

                if let Some(manager) = &checkpoint_manager {
                    if let Err(e) = manager.create_checkpoint(
                        &evaluation_id,
                        state.completed.clone(),
                        state.result_map.clone(),
                        serde_json::Map::new(),
                    ) {
                        warn!("failed to write checkpoint: {e}");
                    }
                }
            });
            spawned.insert(handle.id(), task_id);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((id, ())) => {
                    spawned.remove(&id);
                }
                Err(join_error) => {
                    // A panicking worker must not take the run down; it
                    // surfaces as ERROR on its own task.
                    let task_id = spawned
                        .remove(&join_error.id())
                        .unwrap_or_else(|| "unknown".to_string());
                    error!(task = %task_id, "worker panicked: {join_error}");
                    let result = TaskResult::new(&task_id, TaskStatus::Error, 0.0)
                        .with_error(format!("worker panicked: {join_error}"));
                    let mut state = state.lock().await;
                    if let Err(e) = persist_result(&self.results_dir, &result) {
                        error!(task = %task_id, "failed to persist result: {e}");
                    }
                    state.results.push(result);
                }
            }
        }

        let state = Arc::try_unwrap(state)
            .map_err(|_| SfBenchError::Unexpected("scheduler state still shared".into()))?
            .into_inner();

        self.save_summary(&state.results)?;
        Ok(state.results)
    }

    fn save_summary(&self, results: &[TaskResult]) -> Result<()> {
        let statistics = RunStatistics::from_results(results);
        let summary = serde_json::json!({
            "statistics": statistics,
            "results": results,
        });
        let path = self.results_dir.join("summary.json");
        std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;

        info!(
            summary = %path.display(),
            total = statistics.total,
            passed = statistics.passed,
            failed = statistics.failed,
            timeout = statistics.timeout,
            error = statistics.error,
            pass_rate = statistics.pass_rate,
            "run complete"
        );
        Ok(())
    }
}

fn persist_result(results_dir: &Path, result: &TaskResult) -> Result<()> {
    let path = results_dir.join(format!("{}.json", result.task_id));
    std::fs::write(&path, serde_json::to_string_pretty(result)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{TaskType, TimeoutConfig, ValidationConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_task(id: &str, command: &str, run_timeout: u64) -> Task {
        Task {
            instance_id: id.into(),
            task_type: TaskType::Lwc,
            repo_url: "file:///placeholder".into(),
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

    /// Runner that executes the task's validation command directly,
    /// with no clone/org/deploy machinery.
    struct CommandRunner {
        task: Task,
        repo_dir: PathBuf,
    }

    #[async_trait]
    impl TaskRunner for CommandRunner {
        fn task(&self) -> &Task {
            &self.task
        }

        fn repo_dir(&self) -> &Path {
            &self.repo_dir
        }

        async fn setup(&mut self) -> crate::domain::Result<()> {
            std::fs::create_dir_all(&self.repo_dir)?;
            Ok(())
        }

        async fn evaluate(&mut self) -> crate::domain::Result<TaskResult> {
            match crate::process::run_command(
                &self.task.validation.command,
                Some(&self.repo_dir),
                self.task.timeouts.run,
                false,
            )
            .await
            {
                Ok(_) => Ok(TaskResult::new(&self.task.instance_id, TaskStatus::Pass, 0.0)),
                Err(SfBenchError::Command { .. }) => {
                    Ok(TaskResult::new(&self.task.instance_id, TaskStatus::Fail, 0.0))
                }
                Err(e) => Err(e),
            }
        }

        async fn teardown(&mut self) {
            crate::workspace::remove_workspace(&self.repo_dir);
        }
    }

    fn command_factory() -> RunnerFactory {
        Arc::new(|task, workspace: &Path, _alias| {
            let repo_dir = workspace.join(&task.instance_id);
            Box::new(CommandRunner { task, repo_dir }) as Box<dyn TaskRunner>
        })
    }

    fn scheduler_in(dir: &Path, workers: usize) -> Scheduler {
        Scheduler::with_factory(
            dir.join("workspace"),
            dir.join("results"),
            workers,
            command_factory(),
        )
    }

    #[tokio::test]
    async fn test_results_written_per_task_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path(), 3);

        let tasks = vec![
            make_task("t-pass", "true", 30),
            make_task("t-fail", "false", 30),
        ];
        let results = scheduler
            .run_all(tasks, &HashMap::new(), &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(dir.path().join("results/t-pass.json").exists());
        assert!(dir.path().join("results/t-fail.json").exists());

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("results/summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["statistics"]["total"], 2);
        assert_eq!(summary["statistics"]["passed"], 1);
        assert_eq!(summary["statistics"]["failed"], 1);
    }

    #[tokio::test]
    async fn test_hanging_task_times_out_while_others_complete() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path(), 3);

        let mut tasks: Vec<Task> = (0..9)
            .map(|i| make_task(&format!("quick-{i}"), "true", 30))
            .collect();
        tasks.push(make_task("hanger", "sleep 30", 1));

        let results = scheduler
            .run_all(tasks, &HashMap::new(), &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 10);
        let statuses: HashMap<&str, TaskStatus> = results
            .iter()
            .map(|r| (r.task_id.as_str(), r.status))
            .collect();
        assert_eq!(statuses["hanger"], TaskStatus::Timeout);
        for i in 0..9 {
            assert_eq!(statuses[format!("quick-{i}").as_str()], TaskStatus::Pass);
        }
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let dir = tempfile::tempdir().unwrap();

        static PEAK: AtomicUsize = AtomicUsize::new(0);
        static ACTIVE: AtomicUsize = AtomicUsize::new(0);

        struct GaugeRunner {
            task: Task,
            repo_dir: PathBuf,
        }

        #[async_trait]
        impl TaskRunner for GaugeRunner {
            fn task(&self) -> &Task {
                &self.task
            }
            fn repo_dir(&self) -> &Path {
                &self.repo_dir
            }
            async fn setup(&mut self) -> crate::domain::Result<()> {
                Ok(())
            }
            async fn evaluate(&mut self) -> crate::domain::Result<TaskResult> {
                let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                ACTIVE.fetch_sub(1, Ordering::SeqCst);
                Ok(TaskResult::new(&self.task.instance_id, TaskStatus::Pass, 0.0))
            }
            async fn teardown(&mut self) {}
        }

        let factory: RunnerFactory = Arc::new(|task, workspace: &Path, _| {
            let repo_dir = workspace.join(&task.instance_id);
            Box::new(GaugeRunner { task, repo_dir }) as Box<dyn TaskRunner>
        });
        let scheduler =
            Scheduler::with_factory(dir.path().join("ws"), dir.path().join("res"), 2, factory);

        let tasks: Vec<Task> = (0..8)
            .map(|i| make_task(&format!("g-{i}"), "true", 30))
            .collect();
        scheduler
            .run_all(tasks, &HashMap::new(), &RunOptions::default())
            .await
            .unwrap();

        assert!(PEAK.load(Ordering::SeqCst) <= 2, "pool exceeded bound");
    }

    #[tokio::test]
    async fn test_checkpoint_resume_skips_completed() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path(), 2);
        let options = RunOptions {
            evaluation_id: "eval-resume".into(),
            checkpoint_dir: Some(dir.path().join("checkpoints")),
            ..Default::default()
        };

        let first_batch = vec![
            make_task("a", "true", 30),
            make_task("b", "true", 30),
        ];
        let results = scheduler
            .run_all(first_batch, &HashMap::new(), &options)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        // Rerun with a superset: completed tasks are merged, not re-run.
        // Task "a" would now fail if executed again; the checkpointed PASS
        // must survive.
        let second_batch = vec![
            make_task("a", "false", 30),
            make_task("b", "false", 30),
            make_task("c", "true", 30),
        ];
        let results = scheduler
            .run_all(second_batch, &HashMap::new(), &options)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        let by_id: HashMap<&str, TaskStatus> = results
            .iter()
            .map(|r| (r.task_id.as_str(), r.status))
            .collect();
        assert_eq!(by_id["a"], TaskStatus::Pass);
        assert_eq!(by_id["b"], TaskStatus::Pass);
        assert_eq!(by_id["c"], TaskStatus::Pass);
    }

    #[tokio::test]
    async fn test_audit_trail_written_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path(), 1);
        let options = RunOptions {
            evaluation_id: "eval-audit".into(),
            model_name: "test-model".into(),
            audit_dir: Some(dir.path().join("audit")),
            ..Default::default()
        };

        scheduler
            .run_all(
                vec![make_task("audited", "true", 30)],
                &HashMap::new(),
                &options,
            )
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("audit/audit.json")).unwrap();
        let records: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["task_id"], "audited");
        assert_eq!(records[0]["model_name"], "test-model");
        assert_eq!(records[0]["final_status"], "PASS");
        // Hashes, not payloads.
        assert_eq!(records[0]["input_hash"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_shared_alias_rejected_for_parallel_runs() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path(), 3);
        let options = RunOptions {
            evaluation_id: "eval-alias".into(),
            scratch_org_alias: Some("shared-org".into()),
            ..Default::default()
        };

        let tasks = vec![make_task("x", "true", 30), make_task("y", "true", 30)];
        let err = scheduler
            .run_all(tasks, &HashMap::new(), &options)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("single-task"));
    }

    #[tokio::test]
    async fn test_invalid_patch_surfaces_as_fail() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path(), 1);

        let mut solutions = HashMap::new();
        solutions.insert("patched".to_string(), "hello world".to_string());

        let results = scheduler
            .run_all(
                vec![make_task("patched", "true", 30)],
                &solutions,
                &RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(results[0].status, TaskStatus::Fail);
        assert!(results[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("does not contain valid diff"));
    }
}
