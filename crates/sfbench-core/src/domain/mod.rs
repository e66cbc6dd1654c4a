//! Domain types: tasks, results, report schema, and the error taxonomy.

pub mod error;
pub mod report;
pub mod result;
pub mod task;

pub use error::{Result, SfBenchError};
pub use report::{
    migrate_v1_to_v2, validate_schema, ComponentStatus, EvaluationReport, EvaluationSummary,
    InstanceResult, InstanceStatus, ValidationBreakdown, SCHEMA_VERSION,
};
pub use result::{RunStatistics, TaskResult, TaskStatus};
pub use task::{
    RunnerKind, Task, TaskSchemaError, TaskType, TaskValidator, TimeoutConfig, ValidationConfig,
};
