//! End-to-end evaluation flow: task file -> scheduler -> results ->
//! checkpoint resume -> report artifacts.
//!
//! Runners are stubbed at the factory seam so no Salesforce CLI or git
//! remote is needed; the commands under test are plain shell.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sfbench_core::reporting::instance_from_test_result;
use sfbench_core::{
    make_run_report, EvaluationReport, Result, RunOptions, RunnerFactory, Scheduler, SfBenchError,
    Task, TaskResult, TaskRunner, TaskStatus,
};

fn task_json(id: &str, command: &str, run_timeout: u64) -> serde_json::Value {
    serde_json::json!({
        "instance_id": id,
        "task_type": "LWC",
        "repo_url": "https://example.com/repo.git",
        "base_commit": "abc123",
        "problem_description": "stub task",
        "validation": {
            "command": command,
            "expected_outcome": "exit 0"
        },
        "timeouts": {"setup": 30, "run": run_timeout}
    })
}

fn write_task_file(dir: &Path, tasks: &[serde_json::Value]) -> PathBuf {
    let path = dir.join("tasks.json");
    std::fs::write(&path, serde_json::to_string_pretty(tasks).unwrap()).unwrap();
    path
}

struct ShellRunner {
    task: Task,
    repo_dir: PathBuf,
}

#[async_trait]
impl TaskRunner for ShellRunner {
    fn task(&self) -> &Task {
        &self.task
    }

    fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn setup(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.repo_dir)?;
        Ok(())
    }

    async fn evaluate(&mut self) -> Result<TaskResult> {
        match sfbench_core::run_command(
            &self.task.validation.command,
            Some(&self.repo_dir),
            self.task.timeouts.run,
            false,
        )
        .await
        {
            Ok(_) => Ok(TaskResult::new(&self.task.instance_id, TaskStatus::Pass, 0.0)),
            Err(SfBenchError::Command { stderr, .. }) => {
                Ok(TaskResult::new(&self.task.instance_id, TaskStatus::Fail, 0.0)
                    .with_error(stderr))
            }
            Err(e) => Err(e),
        }
    }

    async fn teardown(&mut self) {
        let _ = std::fs::remove_dir_all(&self.repo_dir);
    }
}

fn shell_factory() -> RunnerFactory {
    Arc::new(|task, workspace: &Path, _alias| {
        let repo_dir = workspace.join(&task.instance_id);
        Box::new(ShellRunner { task, repo_dir }) as Box<dyn TaskRunner>
    })
}

#[tokio::test]
async fn full_run_produces_results_and_report() {
    let dir = tempfile::tempdir().unwrap();
    let tasks_file = write_task_file(
        dir.path(),
        &[
            task_json("pass-1", "true", 30),
            task_json("fail-1", "false", 30),
            task_json("slow-1", "sleep 2", 1),
        ],
    );

    let tasks = Scheduler::load_tasks(&tasks_file).unwrap();
    let scheduler = Scheduler::with_factory(
        dir.path().join("workspace"),
        dir.path().join("results"),
        3,
        shell_factory(),
    );

    let mut solutions = HashMap::new();
    solutions.insert("fail-1".to_string(), String::new());

    let results = scheduler
        .run_all(tasks, &solutions, &RunOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 3);

    let mut report = EvaluationReport::new("test-model", "verified");
    for result in &results {
        let mut instance = instance_from_test_result(result, "test-model", None);
        instance.solution_patch = solutions.get(&result.task_id).cloned();
        report.add_instance(instance);
    }

    let files = make_run_report(&mut report, &dir.path().join("results"), true, true).unwrap();
    let raw = std::fs::read_to_string(&files["json"]).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();

    assert_eq!(parsed["schema_version"], "2.0");
    assert_eq!(parsed["resolved_ids"], serde_json::json!(["pass-1"]));
    assert_eq!(parsed["unresolved_ids"], serde_json::json!(["fail-1"]));
    // The timeout surfaces in error_ids; every instance here had an
    // empty or absent patch.
    assert_eq!(parsed["error_ids"], serde_json::json!(["slow-1"]));
    assert_eq!(
        parsed["empty_patch_ids"],
        serde_json::json!(["fail-1", "pass-1", "slow-1"])
    );
    assert!(sfbench_core::validate_schema(&parsed));
}

#[tokio::test]
async fn killed_run_resumes_without_reexecuting_completed_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let options = RunOptions {
        evaluation_id: "resume-flow".into(),
        checkpoint_dir: Some(checkpoint_dir.clone()),
        ..Default::default()
    };

    let scheduler = Scheduler::with_factory(
        dir.path().join("workspace"),
        dir.path().join("results"),
        2,
        shell_factory(),
    );

    // First partial run: tasks 1-4 complete.
    let first: Vec<Task> = Scheduler::load_tasks(&write_task_file(
        dir.path(),
        &(1..=4)
            .map(|i| task_json(&format!("task-{i}"), "true", 30))
            .collect::<Vec<_>>(),
    ))
    .unwrap();
    let results = scheduler
        .run_all(first, &HashMap::new(), &options)
        .await
        .unwrap();
    assert_eq!(results.len(), 4);

    // Resume with the full set of 10. Tasks 1-4 must come back unchanged
    // from the checkpoint even though re-running them would now fail.
    let mut full: Vec<serde_json::Value> = (1..=4)
        .map(|i| task_json(&format!("task-{i}"), "false", 30))
        .collect();
    full.extend((5..=10).map(|i| task_json(&format!("task-{i}"), "true", 30)));
    let full_tasks = Scheduler::load_tasks(&write_task_file(dir.path(), &full)).unwrap();

    let results = scheduler
        .run_all(full_tasks, &HashMap::new(), &options)
        .await
        .unwrap();

    assert_eq!(results.len(), 10);
    for result in &results {
        assert_eq!(
            result.status,
            TaskStatus::Pass,
            "task {} should be PASS",
            result.task_id
        );
    }
}

#[tokio::test]
async fn corrupted_checkpoint_restarts_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let options = RunOptions {
        evaluation_id: "corrupt-flow".into(),
        checkpoint_dir: Some(checkpoint_dir.clone()),
        ..Default::default()
    };

    let scheduler = Scheduler::with_factory(
        dir.path().join("workspace"),
        dir.path().join("results"),
        1,
        shell_factory(),
    );

    let tasks = Scheduler::load_tasks(&write_task_file(
        dir.path(),
        &[task_json("only-task", "true", 30)],
    ))
    .unwrap();
    scheduler
        .run_all(tasks.clone(), &HashMap::new(), &options)
        .await
        .unwrap();

    // Corrupt the checkpoint; a resumed run must ignore it and re-execute.
    let checkpoint_file = checkpoint_dir.join("corrupt-flow_checkpoint.json");
    let raw = std::fs::read_to_string(&checkpoint_file).unwrap();
    std::fs::write(&checkpoint_file, raw.replace("only-task", "onlx-task")).unwrap();

    let results = scheduler
        .run_all(tasks, &HashMap::new(), &options)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id, "only-task");
}
