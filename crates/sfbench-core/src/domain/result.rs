//! Per-task results and run-level pass-rate statistics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pass,
    Fail,
    Timeout,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pass => "PASS",
            TaskStatus::Fail => "FAIL",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Error => "ERROR",
        }
    }
}

/// The outcome of one task run. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    /// Wall-clock duration in seconds, rounded to centiseconds.
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_log: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>, status: TaskStatus, duration_seconds: f64) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            duration_seconds: (duration_seconds * 100.0).round() / 100.0,
            error_message: None,
            details: HashMap::new(),
            execution_log: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Aggregate counts and pass rate over a result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStatistics {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub error: usize,
    /// Percentage in [0, 100], rounded to two decimals.
    pub pass_rate: f64,
}

impl RunStatistics {
    pub fn from_results(results: &[TaskResult]) -> Self {
        let total = results.len();
        if total == 0 {
            return Self::default();
        }

        let count = |s: TaskStatus| results.iter().filter(|r| r.status == s).count();
        let passed = count(TaskStatus::Pass);

        Self {
            total,
            passed,
            failed: count(TaskStatus::Fail),
            timeout: count(TaskStatus::Timeout),
            error: count(TaskStatus::Error),
            pass_rate: ((passed as f64 / total as f64) * 10_000.0).round() / 100.0,
        }
    }
}
