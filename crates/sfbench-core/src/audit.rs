//! Append-only audit trail with cryptographic content hashes.
//!
//! Every external interaction during an evaluation (provider API calls,
//! platform CLI commands, git operations, free-form execution events)
//! is recorded against its task. Payloads are hashed (SHA-256) rather
//! than stored verbatim, and request headers that could carry secrets
//! are redacted before hashing.
//!
//! One writer per evaluation; the whole audit file is rewritten on every
//! append, so readers see an eventually-consistent array.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::domain::error::Result;

/// Replacement value for redacted header entries.
pub const REDACTED: &str = "***REDACTED***";

/// Audit record for one task evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationAudit {
    pub evaluation_id: String,
    pub timestamp: String,
    pub model_name: String,
    pub task_id: String,
    /// SHA-256 of the task input (problem description / prompt).
    pub input_hash: String,
    /// SHA-256 of the solution patch.
    pub output_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_org_id: Option<String>,
    #[serde(default)]
    pub api_calls: Vec<serde_json::Value>,
    #[serde(default)]
    pub subprocess_commands: Vec<serde_json::Value>,
    #[serde(default)]
    pub git_operations: Vec<serde_json::Value>,
    #[serde(default)]
    pub execution_logs: Vec<serde_json::Value>,
    #[serde(default)]
    pub validation_results: serde_json::Value,
    pub final_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_hash: Option<String>,
}

/// Index of an audit record within its logger. Stable for the lifetime of
/// the evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditHandle(usize);

/// Centralized audit logger for one evaluation.
pub struct AuditLogger {
    evaluation_id: String,
    audit_file: PathBuf,
    audits: Vec<EvaluationAudit>,
}

impl AuditLogger {
    /// Open (or create) the audit trail at `<audit_dir>/audit.json`.
    /// Existing records are loaded so a resumed run appends to them.
    pub fn new(evaluation_id: impl Into<String>, audit_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(audit_dir)?;
        let audit_file = audit_dir.join("audit.json");

        let audits = if audit_file.exists() {
            match std::fs::read_to_string(&audit_file)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
            {
                Some(existing) => existing,
                None => {
                    warn!(file = %audit_file.display(), "failed to load existing audit file; starting fresh");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            evaluation_id: evaluation_id.into(),
            audit_file,
            audits,
        })
    }

    /// Path of the audit file.
    pub fn audit_file(&self) -> &Path {
        &self.audit_file
    }

    /// Start a new audit record for a task.
    pub fn create_audit(
        &mut self,
        model_name: &str,
        task_id: &str,
        input_data: &str,
        output_data: &str,
        scratch_org_id: Option<String>,
    ) -> AuditHandle {
        self.audits.push(EvaluationAudit {
            evaluation_id: self.evaluation_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            model_name: model_name.to_string(),
            task_id: task_id.to_string(),
            input_hash: hash_data(input_data),
            output_hash: hash_data(output_data),
            scratch_org_id,
            api_calls: Vec::new(),
            subprocess_commands: Vec::new(),
            git_operations: Vec::new(),
            execution_logs: Vec::new(),
            validation_results: serde_json::Value::Null,
            final_status: "unknown".to_string(),
            checkpoint_hash: None,
        });
        AuditHandle(self.audits.len() - 1)
    }

    /// Record a provider API call. Headers are sanitized before hashing.
    pub fn log_api_call(
        &mut self,
        handle: AuditHandle,
        provider: &str,
        model: &str,
        request: &serde_json::Value,
        response: &serde_json::Value,
        duration_ms: f64,
    ) {
        let safe_request = sanitize_request(request);
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "provider": provider,
            "model": model,
            "request_hash": hash_json(&safe_request),
            "response_hash": hash_json(response),
            "duration_ms": duration_ms,
            "status": if response.get("error").is_some() { "error" } else { "success" },
        });
        self.audits[handle.0].api_calls.push(entry);
        self.save();
    }

    /// Record a platform CLI command execution.
    pub fn log_subprocess_command(
        &mut self,
        handle: AuditHandle,
        command: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        duration_ms: f64,
    ) {
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "command": command,
            "exit_code": exit_code,
            "stdout_hash": hash_data(stdout),
            "stderr_hash": hash_data(stderr),
            "duration_ms": duration_ms,
        });
        self.audits[handle.0].subprocess_commands.push(entry);
        self.save();
    }

    /// Record a git operation (clone, checkout, apply_patch).
    pub fn log_git_operation(
        &mut self,
        handle: AuditHandle,
        operation: &str,
        command: &str,
        success: bool,
        duration_ms: f64,
    ) {
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "operation": operation,
            "command": command,
            "success": success,
            "duration_ms": duration_ms,
        });
        self.audits[handle.0].git_operations.push(entry);
        self.save();
    }

    /// Record a free-form execution event.
    pub fn log_execution(&mut self, handle: AuditHandle, message: &str, level: &str) {
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "message": message,
        });
        self.audits[handle.0].execution_logs.push(entry);
        self.save();
    }

    /// Attach validation results to the record.
    pub fn update_validation_results(&mut self, handle: AuditHandle, results: serde_json::Value) {
        self.audits[handle.0].validation_results = results;
        self.save();
    }

    /// Finalize the record with a terminal status.
    pub fn finalize_audit(
        &mut self,
        handle: AuditHandle,
        status: &str,
        checkpoint_hash: Option<String>,
    ) {
        self.audits[handle.0].final_status = status.to_string();
        self.audits[handle.0].checkpoint_hash = checkpoint_hash;
        self.save();
    }

    /// Access a record for inspection.
    pub fn audit(&self, handle: AuditHandle) -> &EvaluationAudit {
        &self.audits[handle.0]
    }

    /// Summary statistics over all records.
    pub fn generate_audit_report(&self) -> serde_json::Value {
        let mut status_counts: HashMap<String, usize> = HashMap::new();
        let mut api_calls = 0;
        let mut subprocess_commands = 0;
        let mut git_operations = 0;

        for audit in &self.audits {
            *status_counts.entry(audit.final_status.clone()).or_insert(0) += 1;
            api_calls += audit.api_calls.len();
            subprocess_commands += audit.subprocess_commands.len();
            git_operations += audit.git_operations.len();
        }

        serde_json::json!({
            "evaluation_id": self.evaluation_id,
            "total_tasks": self.audits.len(),
            "status_counts": status_counts,
            "total_api_calls": api_calls,
            "total_subprocess_commands": subprocess_commands,
            "total_git_operations": git_operations,
            "audit_file": self.audit_file.to_string_lossy(),
        })
    }

    fn save(&self) {
        match serde_json::to_string_pretty(&self.audits) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.audit_file, json) {
                    warn!(file = %self.audit_file.display(), "failed to save audit file: {e}");
                }
            }
            Err(e) => warn!("failed to serialize audit records: {e}"),
        }
    }
}

/// SHA-256 hex digest of a string payload.
pub fn hash_data(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn hash_json(value: &serde_json::Value) -> String {
    // serde_json maps are sorted, so this serialization is canonical.
    hash_data(&serde_json::to_string(value).unwrap_or_default())
}

/// Redact header entries whose key contains `key`, `token`, or
/// `authorization` (case-insensitive). Applied before hashing so the
/// hash never commits to a secret.
pub fn sanitize_request(request: &serde_json::Value) -> serde_json::Value {
    let mut sanitized = request.clone();
    if let Some(headers) = sanitized.get_mut("headers").and_then(|h| h.as_object_mut()) {
        let keys: Vec<String> = headers.keys().cloned().collect();
        for key in keys {
            let lowered = key.to_lowercase();
            if lowered.contains("key") || lowered.contains("token") || lowered.contains("authorization")
            {
                headers.insert(key, serde_json::Value::String(REDACTED.to_string()));
            }
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let a = hash_data("same input");
        let b = hash_data("same input");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(hash_data("other input"), a);
    }

    #[test]
    fn test_sanitize_redacts_secret_headers() {
        let request = serde_json::json!({
            "url": "https://api.example.com/v1/chat",
            "headers": {
                "Authorization": "Bearer sk-secret",
                "X-Api-Key": "secret-key",
                "openai-token": "tok",
                "Content-Type": "application/json"
            }
        });

        let sanitized = sanitize_request(&request);
        let headers = sanitized["headers"].as_object().unwrap();
        assert_eq!(headers["Authorization"], REDACTED);
        assert_eq!(headers["X-Api-Key"], REDACTED);
        assert_eq!(headers["openai-token"], REDACTED);
        assert_eq!(headers["Content-Type"], "application/json");
    }

    #[test]
    fn test_redaction_applied_before_hashing() {
        let with_secret = serde_json::json!({
            "headers": {"Authorization": "Bearer sk-A"}
        });
        let with_other_secret = serde_json::json!({
            "headers": {"Authorization": "Bearer sk-B"}
        });

        // Different secrets, identical hashes: the secret never reaches
        // the digest.
        assert_eq!(
            hash_json(&sanitize_request(&with_secret)),
            hash_json(&sanitize_request(&with_other_secret))
        );
    }

    #[test]
    fn test_audit_lifecycle_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = AuditLogger::new("eval-001", dir.path()).unwrap();

        let handle = logger.create_audit(
            "test-model",
            "task-1",
            "fix the trigger",
            "diff --git a/x b/x\n",
            Some("00D000000000001".into()),
        );
        logger.log_subprocess_command(handle, "sf project deploy start --json", 0, "{}", "", 1200.0);
        logger.log_git_operation(handle, "clone", "git clone url dir", true, 800.0);
        logger.log_execution(handle, "patch applied", "INFO");
        logger.update_validation_results(handle, serde_json::json!({"score": 90}));
        logger.finalize_audit(handle, "passed", Some("abc123".into()));

        // Reload from disk: records survive.
        let reloaded = AuditLogger::new("eval-001", dir.path()).unwrap();
        let report = reloaded.generate_audit_report();
        assert_eq!(report["total_tasks"], 1);
        assert_eq!(report["total_subprocess_commands"], 1);
        assert_eq!(report["total_git_operations"], 1);
        assert_eq!(report["status_counts"]["passed"], 1);
    }

    #[test]
    fn test_audit_hashes_not_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = AuditLogger::new("eval-002", dir.path()).unwrap();
        let handle = logger.create_audit("m", "t", "input", "output", None);
        logger.log_subprocess_command(handle, "sf org list", 0, "very large stdout payload", "", 10.0);

        let raw = std::fs::read_to_string(logger.audit_file()).unwrap();
        assert!(!raw.contains("very large stdout payload"));
        assert!(raw.contains(&hash_data("very large stdout payload")));
    }
}
