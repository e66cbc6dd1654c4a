//! SF-Bench Core Library
//!
//! Evaluation execution engine for benchmarking AI code-generation agents
//! on Salesforce engineering tasks. Drives each candidate solution through
//! a reproducible pipeline: fetch the task repository at a pinned revision,
//! apply the model's unified-diff patch, provision an ephemeral scratch
//! org, deploy, validate, score against a weighted rubric, and emit a
//! signed machine-readable report.

pub mod agent;
pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod functional;
pub mod inventory;
pub mod logs;
pub mod org;
pub mod outcome;
pub mod patch;
pub mod process;
pub mod reporting;
pub mod runners;
pub mod scheduler;
pub mod solutions;
pub mod telemetry;
pub mod workspace;

pub use domain::{
    migrate_v1_to_v2, validate_schema, ComponentStatus, EvaluationReport, EvaluationSummary,
    InstanceResult, InstanceStatus, Result, RunStatistics, RunnerKind, SfBenchError, Task,
    TaskResult, TaskSchemaError, TaskStatus, TaskType, TaskValidator, TimeoutConfig,
    ValidationBreakdown, ValidationConfig, SCHEMA_VERSION,
};

pub use agent::{resolve_api_key, HttpPatchProducer, PatchProducer, RateLimiter};
pub use audit::{AuditHandle, AuditLogger, EvaluationAudit};
pub use checkpoint::{generate_evaluation_hash, Checkpoint, CheckpointManager};
pub use config::{get_config, set_config, EvalConfig};
pub use functional::{
    FunctionalValidationResult, FunctionalValidator, StepStatus, ValidationLevel, ValidationStep,
};
pub use inventory::{check_capacity, get_connected_devhubs, select_best_devhub, CapacityReport};
pub use logs::LogManager;
pub use org::{create_scratch_org, delete_scratch_org, OrgInfo, OrgRequest};
pub use outcome::{OutcomeCheck, OutcomeReport, OutcomeValidator};
pub use patch::{apply_patch, apply_patch_with_retry, clean_patch, validate_patch_structure};
pub use process::{parse_json_output, run_command, CommandOutput};
pub use reporting::{generate_markdown_summary, make_run_report};
pub use runners::{create_runner, drive, TaskRunner};
pub use scheduler::{RunOptions, RunnerFactory, Scheduler};
pub use solutions::SolutionLoader;
pub use telemetry::init_tracing;

/// SF-Bench version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
