//! Task definitions and schema validation.
//!
//! A [`Task`] is the immutable description of one evaluation instance,
//! loaded from a JSON task file (array or single object). Validation
//! rejects malformed entries before any worker is dispatched.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{Result, SfBenchError};

/// Task categories. Aliases route to one of the seven concrete runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    // Development tasks
    Apex,
    Lwc,
    Flow,
    Deploy,

    // Configuration tasks
    LightningPage,
    PageLayout,
    Community,
    Profile,
    PermissionSet,

    // Cloud-specific tasks (routed to the architecture runner)
    SalesCloud,
    ServiceCloud,
    MarketingCloud,
    CommerceCloud,
    PlatformCloud,

    // Architecture tasks
    Architecture,
    Integration,
    DataModel,
    Security,
}

/// The concrete runner a task type is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Apex,
    Lwc,
    Deploy,
    Flow,
    LightningPage,
    Community,
    Architecture,
}

impl TaskType {
    /// Map a task type to its runner. Metadata-only aliases use the deploy
    /// runner; cloud and complex aliases use the architecture runner.
    pub fn runner_kind(self) -> RunnerKind {
        match self {
            TaskType::Apex => RunnerKind::Apex,
            TaskType::Lwc => RunnerKind::Lwc,
            TaskType::Deploy | TaskType::Profile | TaskType::PermissionSet => RunnerKind::Deploy,
            TaskType::Flow => RunnerKind::Flow,
            TaskType::LightningPage | TaskType::PageLayout => RunnerKind::LightningPage,
            TaskType::Community => RunnerKind::Community,
            TaskType::SalesCloud
            | TaskType::ServiceCloud
            | TaskType::MarketingCloud
            | TaskType::CommerceCloud
            | TaskType::PlatformCloud
            | TaskType::Architecture
            | TaskType::Integration
            | TaskType::DataModel
            | TaskType::Security => RunnerKind::Architecture,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Serialize without quotes for log lines and error messages.
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Validation configuration for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    /// External CLI invocation that decides PASS/FAIL.
    pub command: String,
    /// Human description of the expected outcome.
    pub expected_outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_checks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_checks: Option<HashMap<String, serde_json::Value>>,
}

/// Timeout configuration, all values in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    #[serde(default = "TimeoutConfig::default_setup")]
    pub setup: u64,
    #[serde(default = "TimeoutConfig::default_run")]
    pub run: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functional_test: Option<u64>,
}

impl TimeoutConfig {
    fn default_setup() -> u64 {
        600
    }

    fn default_run() -> u64 {
        300
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            setup: Self::default_setup(),
            run: Self::default_run(),
            functional_test: None,
        }
    }
}

/// A benchmark task definition.
///
/// Each task should carry a `golden_patch` (verified human solution) so the
/// task is known solvable before asking an AI to solve it; the golden patch
/// is not consulted at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub instance_id: String,
    pub task_type: TaskType,
    pub repo_url: String,
    pub base_commit: String,
    pub problem_description: String,
    pub validation: ValidationConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functional_validation: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_scripts: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_patch_path: Option<String>,
}

/// A single schema violation found while validating a task entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSchemaError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for TaskSchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validates task definitions against the SF-Bench schema.
pub struct TaskValidator;

impl TaskValidator {
    /// Validate a single already-deserialized task.
    pub fn validate(task: &Task) -> Vec<TaskSchemaError> {
        let mut errors = Vec::new();

        if task.instance_id.is_empty() {
            errors.push(TaskSchemaError {
                field: "instance_id".into(),
                message: "must be a non-empty string".into(),
            });
        } else if !task
            .instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            errors.push(TaskSchemaError {
                field: "instance_id".into(),
                message:
                    "should contain only alphanumeric characters, hyphens, and underscores"
                        .into(),
            });
        }

        if !is_valid_repo_url(&task.repo_url) {
            errors.push(TaskSchemaError {
                field: "repo_url".into(),
                message: format!("not a valid git URL: {}", task.repo_url),
            });
        }

        if task.base_commit.is_empty() {
            errors.push(TaskSchemaError {
                field: "base_commit".into(),
                message: "must be a non-empty revision".into(),
            });
        }

        if task.problem_description.is_empty() {
            errors.push(TaskSchemaError {
                field: "problem_description".into(),
                message: "must be a non-empty string".into(),
            });
        }

        if task.validation.command.is_empty() {
            errors.push(TaskSchemaError {
                field: "validation.command".into(),
                message: "must be a non-empty command".into(),
            });
        }

        if task.validation.expected_outcome.is_empty() {
            errors.push(TaskSchemaError {
                field: "validation.expected_outcome".into(),
                message: "must be a non-empty string".into(),
            });
        }

        if task.timeouts.setup == 0 {
            errors.push(TaskSchemaError {
                field: "timeouts.setup".into(),
                message: "must be a positive integer".into(),
            });
        }

        if task.timeouts.run == 0 {
            errors.push(TaskSchemaError {
                field: "timeouts.run".into(),
                message: "must be a positive integer".into(),
            });
        }

        if let Some(0) = task.timeouts.functional_test {
            errors.push(TaskSchemaError {
                field: "timeouts.functional_test".into(),
                message: "must be a positive integer when present".into(),
            });
        }

        errors
    }

    /// Load a task file (JSON array or single object), validating each entry.
    ///
    /// Any invalid entry aborts the load with the collected validation report.
    pub fn validate_and_load(path: &Path) -> Result<Vec<Task>> {
        let raw = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;

        let entries = match value {
            serde_json::Value::Array(items) => items,
            obj @ serde_json::Value::Object(_) => vec![obj],
            other => {
                return Err(SfBenchError::InvalidTask(format!(
                    "task file must be a JSON array or object, got {}",
                    type_name(&other)
                )))
            }
        };

        let mut tasks = Vec::with_capacity(entries.len());
        let mut all_errors = Vec::new();

        for (index, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<Task>(entry) {
                Ok(task) => {
                    let errors = Self::validate(&task);
                    if errors.is_empty() {
                        tasks.push(task);
                    } else {
                        for e in errors {
                            all_errors.push(format!("[{}] {}: {}", index, task.instance_id, e));
                        }
                    }
                }
                Err(e) => all_errors.push(format!("[{index}] failed to parse: {e}")),
            }
        }

        if !all_errors.is_empty() {
            return Err(SfBenchError::InvalidTask(all_errors.join("; ")));
        }

        Ok(tasks)
    }
}

fn is_valid_repo_url(url: &str) -> bool {
    url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("ssh://")
        || url.starts_with("git@")
        || url.starts_with("file://")
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
