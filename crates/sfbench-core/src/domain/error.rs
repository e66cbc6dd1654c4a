//! Domain-level error taxonomy for SF-Bench.
//!
//! Each failure kind carries enough structured context to attribute the
//! failure: model-caused kinds ([`SfBenchError::PatchApplication`],
//! [`SfBenchError::PlatformLimitation`]) surface as FAIL on the task,
//! tool-caused kinds surface as ERROR, and [`SfBenchError::Timeout`]
//! surfaces as TIMEOUT. Conflating these would invalidate the scoreboard.

/// Maximum stderr excerpt length carried in error messages.
pub const STDERR_EXCERPT_LEN: usize = 500;

/// SF-Bench domain errors.
#[derive(Debug, thiserror::Error)]
pub enum SfBenchError {
    /// A subprocess exceeded its wall-clock budget and was killed.
    #[error("command timed out after {timeout_secs} seconds: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    /// Scratch-org creation failed after the JSON-authoritative check.
    #[error("org creation failed: {message}")]
    OrgCreation {
        message: String,
        exit_code: i32,
        stderr: String,
    },

    /// Org creation failed due to a platform constraint the solution relies
    /// on (package dependencies, ancestor versions). Model issue, not tool.
    #[error("platform limitation: {message}")]
    PlatformLimitation {
        message: String,
        exit_code: i32,
        stderr: String,
    },

    /// The model-produced diff could not be applied by any strategy.
    /// Model issue, not tool.
    #[error("patch application failed: {0}")]
    PatchApplication(String),

    /// A validation or tool command exited non-zero with no JSON success
    /// indicator.
    #[error("command failed: {message}")]
    Command {
        message: String,
        exit_code: i32,
        stderr: String,
    },

    /// Git clone/checkout failure.
    #[error("git error: {0}")]
    Git(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("checkpoint integrity failure: {0}")]
    CheckpointIntegrity(String),

    #[error("patch producer error: {0}")]
    PatchProducer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything not covered by a classified kind. Always surfaced as ERROR.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SfBenchError {
    /// Whether this failure is attributable to the model under evaluation.
    ///
    /// Model-attributable failures surface as FAIL on the task, never ERROR.
    pub fn is_model_failure(&self) -> bool {
        matches!(
            self,
            SfBenchError::PatchApplication(_) | SfBenchError::PlatformLimitation { .. }
        )
    }

    /// Whether a retry could plausibly change the outcome.
    ///
    /// Patch-content failures and platform limitations are deterministic
    /// and never retried; org-creation and git failures are transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SfBenchError::OrgCreation { .. } | SfBenchError::Git(_) | SfBenchError::Io(_)
        )
    }

    /// Truncate a stderr payload to the excerpt length carried in messages.
    pub fn stderr_excerpt(stderr: &str) -> String {
        let trimmed = stderr.trim();
        if trimmed.len() <= STDERR_EXCERPT_LEN {
            trimmed.to_string()
        } else {
            let tail_start = trimmed.len() - STDERR_EXCERPT_LEN;
            // Avoid splitting a UTF-8 code point.
            let mut start = tail_start;
            while !trimmed.is_char_boundary(start) {
                start += 1;
            }
            trimmed[start..].to_string()
        }
    }
}

/// Result type for SF-Bench domain operations.
pub type Result<T> = std::result::Result<T, SfBenchError>;
