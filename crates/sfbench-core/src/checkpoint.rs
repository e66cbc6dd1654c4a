//! Checkpoint and resume support for long evaluations.
//!
//! A checkpoint records which tasks have completed and their results, so
//! a killed run can resume without re-executing finished work. Integrity
//! is enforced with a SHA-256 over the canonically serialized record with
//! the hash field omitted; a checkpoint that fails verification is
//! treated as absent.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::domain::error::Result;

/// Persisted evaluation checkpoint.
///
/// `results` and `metadata` use `serde_json::Map` (sorted keys), keeping
/// the canonical serialization stable across writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub evaluation_id: String,
    pub timestamp: String,
    pub completed_tasks: Vec<String>,
    pub results: serde_json::Map<String, serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_hash: Option<String>,
}

impl Checkpoint {
    /// SHA-256 over the canonical serialization with the hash field omitted.
    pub fn compute_hash(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("checkpoint_hash");
        }
        let canonical = serde_json::to_string_pretty(&value)?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Whether the stored hash matches a recomputation.
    pub fn verify(&self) -> bool {
        match (&self.checkpoint_hash, self.compute_hash()) {
            (Some(stored), Ok(computed)) => *stored == computed,
            _ => false,
        }
    }
}

/// Summary line for `list_checkpoints`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub file: PathBuf,
    pub evaluation_id: String,
    pub timestamp: String,
    pub completed_count: usize,
}

/// Manages checkpoint files for evaluation runs.
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.into();
        std::fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self { checkpoint_dir })
    }

    /// Path of the checkpoint file for an evaluation.
    pub fn checkpoint_path(&self, evaluation_id: &str) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{evaluation_id}_checkpoint.json"))
    }

    /// Write a checkpoint (and its sibling `.sha256`) atomically: the file
    /// is written to a temp path and renamed into place.
    pub fn create_checkpoint(
        &self,
        evaluation_id: &str,
        completed_tasks: Vec<String>,
        results: serde_json::Map<String, serde_json::Value>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PathBuf> {
        let mut checkpoint = Checkpoint {
            evaluation_id: evaluation_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            completed_tasks,
            results,
            metadata,
            checkpoint_hash: None,
        };
        let hash = checkpoint.compute_hash()?;
        checkpoint.checkpoint_hash = Some(hash.clone());

        let path = self.checkpoint_path(evaluation_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&checkpoint)?)?;
        std::fs::rename(&tmp, &path)?;

        let hash_path = self
            .checkpoint_dir
            .join(format!("{evaluation_id}_checkpoint.sha256"));
        std::fs::write(&hash_path, &hash)?;

        info!(
            checkpoint = %path.display(),
            hash = &hash[..16],
            completed = checkpoint.completed_tasks.len(),
            "checkpoint written"
        );
        Ok(path)
    }

    /// Load and verify a checkpoint for an evaluation.
    ///
    /// Returns `None` when no checkpoint exists or when integrity
    /// verification fails (logged at ERROR; the run starts fresh).
    pub fn load_checkpoint(&self, evaluation_id: &str) -> Option<Checkpoint> {
        let path = self.checkpoint_path(evaluation_id);
        if !path.exists() {
            return None;
        }

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(checkpoint = %path.display(), "failed to read checkpoint: {e}");
                return None;
            }
        };

        let checkpoint: Checkpoint = match serde_json::from_str(&raw) {
            Ok(cp) => cp,
            Err(e) => {
                error!(checkpoint = %path.display(), "failed to parse checkpoint: {e}");
                return None;
            }
        };

        if !checkpoint.verify() {
            error!(
                checkpoint = %path.display(),
                "checkpoint integrity check failed: hash mismatch; ignoring checkpoint"
            );
            return None;
        }

        info!(
            checkpoint = %path.display(),
            evaluation = %checkpoint.evaluation_id,
            completed = checkpoint.completed_tasks.len(),
            "checkpoint loaded"
        );
        Some(checkpoint)
    }

    /// Completed task ids from the checkpoint, empty when absent.
    pub fn get_completed_tasks(&self, evaluation_id: &str) -> Vec<String> {
        self.load_checkpoint(evaluation_id)
            .map(|cp| cp.completed_tasks)
            .unwrap_or_default()
    }

    /// Enumerate checkpoints in the directory, newest first.
    pub fn list_checkpoints(&self) -> Vec<CheckpointInfo> {
        let Ok(entries) = std::fs::read_dir(&self.checkpoint_dir) else {
            return Vec::new();
        };

        let mut infos: Vec<CheckpointInfo> = entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .ends_with("_checkpoint.json")
            })
            .filter_map(|e| {
                let raw = std::fs::read_to_string(e.path()).ok()?;
                let cp: Checkpoint = serde_json::from_str(&raw).ok()?;
                Some(CheckpointInfo {
                    file: e.path(),
                    evaluation_id: cp.evaluation_id,
                    timestamp: cp.timestamp,
                    completed_count: cp.completed_tasks.len(),
                })
            })
            .collect();

        infos.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        infos
    }
}

/// Content hash identifying an evaluation run: model, tasks file bytes,
/// and resolved configuration. Written into the report so downstream
/// consumers can confirm provenance.
pub fn generate_evaluation_hash(
    model_name: &str,
    tasks_file: &Path,
    config: &serde_json::Value,
) -> Result<String> {
    let tasks_file_hash = if tasks_file.exists() {
        let bytes = std::fs::read(tasks_file)?;
        hex::encode(Sha256::digest(&bytes))
    } else {
        String::new()
    };

    let input = serde_json::json!({
        "model_name": model_name,
        "tasks_file": tasks_file.to_string_lossy(),
        "tasks_file_hash": tasks_file_hash,
        "config": config,
    });
    let canonical = serde_json::to_string(&input)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}
