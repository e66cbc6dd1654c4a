//! Organized per-step log files.
//!
//! Layout: `logs/<run_id>/<model_name>/<instance_id>/` with one file per
//! lifecycle step, plus `logs/<run_id>/audit/` for the audit trail.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domain::error::Result;

/// Known per-instance log files.
pub const LOG_TYPES: &[&str] = &[
    "run_instance",
    "scratch_org",
    "deployment",
    "test_output",
    "functional_validation",
];

/// Manages the organized log directory for a run.
#[derive(Debug, Clone)]
pub struct LogManager {
    base_dir: PathBuf,
}

impl LogManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// `logs/<run_id>`.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    /// `logs/<run_id>/audit`.
    pub fn audit_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("audit")
    }

    /// `logs/<run_id>/<model>/<instance_id>`, created on first use.
    pub fn instance_dir(&self, run_id: &str, model_name: &str, instance_id: &str) -> Result<PathBuf> {
        let dir = self.run_dir(run_id).join(model_name).join(instance_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Path of one step log for an instance.
    pub fn log_path(
        &self,
        run_id: &str,
        model_name: &str,
        instance_id: &str,
        log_type: &str,
    ) -> Result<PathBuf> {
        let dir = self.instance_dir(run_id, model_name, instance_id)?;
        let name = if LOG_TYPES.contains(&log_type) {
            log_type
        } else {
            "run_instance"
        };
        Ok(dir.join(format!("{name}.log")))
    }

    /// Append content to a step log, ensuring a trailing newline.
    pub fn write_log(
        &self,
        run_id: &str,
        model_name: &str,
        instance_id: &str,
        log_type: &str,
        content: &str,
    ) -> Result<PathBuf> {
        let path = self.log_path(run_id, model_name, instance_id, log_type)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(content.as_bytes())?;
        if !content.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(path)
    }

    /// Path relative to the process working directory when possible, for
    /// embedding in result schemas.
    pub fn relative_log_path(&self, absolute: &Path) -> String {
        std::env::current_dir()
            .ok()
            .and_then(|cwd| {
                absolute
                    .strip_prefix(&cwd)
                    .ok()
                    .map(|p| p.display().to_string())
            })
            .unwrap_or_else(|| absolute.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_layout() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogManager::new(dir.path());

        let path = logs
            .write_log("run-1", "test-model", "apex-001", "deployment", "deployed 12 components")
            .unwrap();

        assert!(path.ends_with("run-1/test-model/apex-001/deployment.log"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "deployed 12 components\n");
    }

    #[test]
    fn test_unknown_log_type_falls_back_to_run_instance() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogManager::new(dir.path());
        let path = logs
            .log_path("run-1", "m", "t", "nonsense")
            .unwrap();
        assert!(path.ends_with("run_instance.log"));
    }

    #[test]
    fn test_append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogManager::new(dir.path());
        logs.write_log("r", "m", "t", "scratch_org", "created").unwrap();
        let path = logs.write_log("r", "m", "t", "scratch_org", "deleted").unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content, "created\ndeleted\n");
    }

    #[test]
    fn test_audit_dir_location() {
        let logs = LogManager::new("/logs");
        assert_eq!(logs.audit_dir("run-9"), PathBuf::from("/logs/run-9/audit"));
    }
}
