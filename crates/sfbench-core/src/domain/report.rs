//! Result schema v2: per-instance breakdowns, run summaries, and the
//! top-level evaluation report.
//!
//! The JSON report is the canonical artifact; `summary.md` is a rendering
//! of it. A v1-to-v2 migration is provided for reading historical results.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Schema version emitted by this crate.
pub const SCHEMA_VERSION: &str = "2.0";

/// Individual component validation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Pass,
    Fail,
    Error,
    #[default]
    Skipped,
}

/// Instance-level status in the report schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Resolved,
    Fail,
    #[default]
    Error,
    Skipped,
}

/// Detailed validation results for each scored component.
///
/// Weights: deploy 10, unit tests 20, functional 50, bulk 10, no-tweaks 10.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ValidationBreakdown {
    pub deployment_status: ComponentStatus,
    #[serde(default)]
    pub deployment_message: String,
    pub deployment_points: u32,

    pub unit_test_status: ComponentStatus,
    #[serde(default)]
    pub unit_test_message: String,
    pub unit_test_passed: u32,
    pub unit_test_failed: u32,
    pub unit_test_total: u32,
    pub unit_test_points: u32,

    pub functional_status: ComponentStatus,
    #[serde(default)]
    pub functional_message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub functional_details: HashMap<String, serde_json::Value>,
    pub functional_points: u32,

    pub bulk_status: ComponentStatus,
    #[serde(default)]
    pub bulk_message: String,
    pub bulk_records_processed: u32,
    pub bulk_records_expected: u32,
    pub bulk_points: u32,

    pub no_tweaks_status: ComponentStatus,
    #[serde(default)]
    pub no_tweaks_message: String,
    pub no_tweaks_points: u32,

    pub total_score: u32,
}

impl ValidationBreakdown {
    pub const DEPLOY_WEIGHT: u32 = 10;
    pub const UNIT_TEST_WEIGHT: u32 = 20;
    pub const FUNCTIONAL_WEIGHT: u32 = 50;
    pub const BULK_WEIGHT: u32 = 10;
    pub const NO_TWEAKS_WEIGHT: u32 = 10;

    /// Set each component's points from its status and recompute the total.
    pub fn calculate_total(&mut self) -> u32 {
        self.deployment_points = if self.deployment_status == ComponentStatus::Pass {
            Self::DEPLOY_WEIGHT
        } else {
            0
        };
        self.unit_test_points = if self.unit_test_status == ComponentStatus::Pass {
            Self::UNIT_TEST_WEIGHT
        } else {
            0
        };
        self.functional_points = if self.functional_status == ComponentStatus::Pass {
            Self::FUNCTIONAL_WEIGHT
        } else {
            0
        };
        self.bulk_points = if self.bulk_status == ComponentStatus::Pass {
            Self::BULK_WEIGHT
        } else {
            0
        };
        self.no_tweaks_points = if self.no_tweaks_status == ComponentStatus::Pass {
            Self::NO_TWEAKS_WEIGHT
        } else {
            0
        };

        self.total_score = self.deployment_points
            + self.unit_test_points
            + self.functional_points
            + self.bulk_points
            + self.no_tweaks_points;
        self.total_score
    }

    /// Binary resolution: deployment, unit tests, and functional outcome
    /// must all pass. Bulk and no-tweaks affect score only.
    pub fn is_resolved(&self) -> bool {
        self.functional_status == ComponentStatus::Pass
            && self.deployment_status == ComponentStatus::Pass
            && self.unit_test_status == ComponentStatus::Pass
    }
}

/// Result for a single task instance: one model attempting one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceResult {
    pub instance_id: String,
    pub model_name: String,

    pub status: InstanceStatus,
    pub resolved: bool,

    #[serde(default)]
    pub validation: ValidationBreakdown,

    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_org_username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,

    /// The patch the model produced, verbatim. Absent means no solution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution_patch: Option<String>,
}

impl InstanceResult {
    pub fn new(instance_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            model_name: model_name.into(),
            status: InstanceStatus::Error,
            resolved: false,
            validation: ValidationBreakdown::default(),
            duration_seconds: 0.0,
            scratch_org_username: None,
            error_message: None,
            error_type: None,
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            log_path: None,
            solution_patch: None,
        }
    }

    pub fn mark_resolved(&mut self) {
        self.status = InstanceStatus::Resolved;
        self.resolved = true;
        self.end_time = Some(Utc::now().to_rfc3339());
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = InstanceStatus::Fail;
        self.resolved = false;
        self.error_message = Some(message.into());
        self.end_time = Some(Utc::now().to_rfc3339());
    }

    pub fn mark_error(&mut self, error_type: impl Into<String>, message: impl Into<String>) {
        self.status = InstanceStatus::Error;
        self.resolved = false;
        self.error_type = Some(error_type.into());
        self.error_message = Some(message.into());
        self.end_time = Some(Utc::now().to_rfc3339());
    }

    fn has_empty_patch(&self) -> bool {
        self.solution_patch
            .as_deref()
            .map(|p| p.trim().is_empty())
            .unwrap_or(true)
    }
}

/// Summary statistics for an evaluation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationSummary {
    pub total_instances: usize,
    pub instances_submitted: usize,
    pub instances_completed: usize,
    pub resolved_instances: usize,
    pub instances_unresolved: usize,
    pub failed_instances: usize,
    pub error_instances: usize,
    pub instances_empty_patch: usize,

    /// resolved / total as a ratio in [0, 1].
    pub resolve_rate: f64,
    /// resolved / total as a percentage in [0, 100].
    pub resolution_rate: f64,

    pub avg_score: f64,
    pub avg_functional_score: f64,
    pub median_score: f64,
    pub min_score: u32,
    pub max_score: u32,

    pub deployment_pass_rate: f64,
    pub unit_test_pass_rate: f64,
    pub functional_pass_rate: f64,
    pub bulk_pass_rate: f64,
    pub no_tweaks_pass_rate: f64,

    pub avg_duration_seconds: f64,
    pub total_duration_seconds: f64,
}

/// Complete evaluation report for a model run. The top-level artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub schema_version: String,
    pub run_id: String,
    pub model_name: String,
    pub dataset: String,

    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub environment: HashMap<String, serde_json::Value>,

    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,

    pub instances: Vec<InstanceResult>,
    #[serde(default)]
    pub summary: EvaluationSummary,

    #[serde(default)]
    pub resolved_ids: Vec<String>,
    #[serde(default)]
    pub unresolved_ids: Vec<String>,
    #[serde(default)]
    pub error_ids: Vec<String>,
    #[serde(default)]
    pub empty_patch_ids: Vec<String>,
    #[serde(default)]
    pub completed_ids: Vec<String>,
}

impl EvaluationReport {
    pub fn new(model_name: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            model_name: model_name.into(),
            dataset: dataset.into(),
            config: HashMap::new(),
            environment: HashMap::new(),
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            instances: Vec::new(),
            summary: EvaluationSummary::default(),
            resolved_ids: Vec::new(),
            unresolved_ids: Vec::new(),
            error_ids: Vec::new(),
            empty_patch_ids: Vec::new(),
            completed_ids: Vec::new(),
        }
    }

    pub fn add_instance(&mut self, instance: InstanceResult) {
        self.instances.push(instance);
    }

    /// Compute summary statistics and the sorted instance-id lists.
    pub fn finalize(&mut self) {
        let instances = &self.instances;
        let total = instances.len();

        let mut summary = EvaluationSummary {
            total_instances: total,
            instances_submitted: total,
            ..Default::default()
        };

        if total == 0 {
            self.summary = summary;
            self.end_time = Some(Utc::now().to_rfc3339());
            return;
        }

        let resolved = instances.iter().filter(|i| i.resolved).count();
        let errored = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Error)
            .count();

        summary.resolved_instances = resolved;
        summary.failed_instances = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Fail)
            .count();
        summary.error_instances = errored;
        summary.instances_completed = total - errored;
        summary.instances_unresolved = instances
            .iter()
            .filter(|i| !i.resolved && i.status == InstanceStatus::Fail)
            .count();
        summary.instances_empty_patch =
            instances.iter().filter(|i| i.has_empty_patch()).count();

        summary.resolve_rate = resolved as f64 / total as f64;
        summary.resolution_rate = summary.resolve_rate * 100.0;

        let mut scores: Vec<u32> = instances.iter().map(|i| i.validation.total_score).collect();
        scores.sort_unstable();
        summary.avg_score = scores.iter().map(|&s| s as f64).sum::<f64>() / scores.len() as f64;
        summary.median_score = scores[scores.len() / 2] as f64;
        summary.min_score = *scores.first().unwrap_or(&0);
        summary.max_score = *scores.last().unwrap_or(&0);

        let functional_scores: Vec<u32> = instances
            .iter()
            .map(|i| i.validation.functional_points)
            .filter(|&p| p > 0)
            .collect();
        if !functional_scores.is_empty() {
            summary.avg_functional_score = functional_scores
                .iter()
                .map(|&s| s as f64)
                .sum::<f64>()
                / functional_scores.len() as f64;
        }

        let pass_rate = |f: fn(&ValidationBreakdown) -> ComponentStatus| {
            instances
                .iter()
                .filter(|i| f(&i.validation) == ComponentStatus::Pass)
                .count() as f64
                / total as f64
        };
        summary.deployment_pass_rate = pass_rate(|v| v.deployment_status);
        summary.unit_test_pass_rate = pass_rate(|v| v.unit_test_status);
        summary.functional_pass_rate = pass_rate(|v| v.functional_status);
        summary.bulk_pass_rate = pass_rate(|v| v.bulk_status);
        summary.no_tweaks_pass_rate = pass_rate(|v| v.no_tweaks_status);

        let durations: Vec<f64> = instances
            .iter()
            .map(|i| i.duration_seconds)
            .filter(|&d| d > 0.0)
            .collect();
        if !durations.is_empty() {
            summary.total_duration_seconds = durations.iter().sum();
            summary.avg_duration_seconds =
                summary.total_duration_seconds / durations.len() as f64;
        }

        let collect_ids = |pred: &dyn Fn(&InstanceResult) -> bool| -> Vec<String> {
            let mut v: Vec<String> = instances
                .iter()
                .filter(|i| pred(i))
                .map(|i| i.instance_id.clone())
                .collect();
            v.sort();
            v
        };
        let resolved_ids = collect_ids(&|i| i.resolved);
        let unresolved_ids = collect_ids(&|i| !i.resolved && i.status == InstanceStatus::Fail);
        let error_ids = collect_ids(&|i| i.status == InstanceStatus::Error);
        let empty_patch_ids = collect_ids(&|i| i.has_empty_patch());
        let completed_ids = collect_ids(&|i| i.status != InstanceStatus::Error);

        self.summary = summary;
        self.resolved_ids = resolved_ids;
        self.unresolved_ids = unresolved_ids;
        self.error_ids = error_ids;
        self.empty_patch_ids = empty_patch_ids;
        self.completed_ids = completed_ids;
        self.end_time = Some(Utc::now().to_rfc3339());
    }
}

/// Shallow structural check over a deserialized report document.
pub fn validate_schema(data: &serde_json::Value) -> bool {
    let Some(obj) = data.as_object() else {
        return false;
    };

    for field in ["schema_version", "run_id", "model_name", "instances", "summary"] {
        if !obj.contains_key(field) {
            return false;
        }
    }

    if obj["schema_version"].as_str() != Some(SCHEMA_VERSION) {
        return false;
    }

    let Some(instances) = obj["instances"].as_array() else {
        return false;
    };
    instances.iter().all(|inst| {
        inst.get("instance_id").is_some() && inst.get("status").is_some()
    })
}

/// Migrate a flat v1 result document to the v2 schema.
///
/// v1 scores are carried into `total_score`; missing component data is
/// zero-filled. The instance-id set is preserved exactly.
pub fn migrate_v1_to_v2(v1: &serde_json::Value) -> EvaluationReport {
    let model_name = v1
        .get("model_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let dataset = v1
        .get("dataset")
        .and_then(|v| v.as_str())
        .unwrap_or("verified")
        .to_string();

    let mut report = EvaluationReport::new(model_name.clone(), dataset);

    if let Some(instances) = v1.get("instances").and_then(|v| v.as_array()) {
        for v1_inst in instances {
            let mut instance = InstanceResult::new(
                v1_inst
                    .get("instance_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown"),
                model_name.clone(),
            );

            instance.status = match v1_inst.get("status").and_then(|v| v.as_str()) {
                Some("resolved") => InstanceStatus::Resolved,
                Some("fail") => InstanceStatus::Fail,
                Some("skipped") => InstanceStatus::Skipped,
                _ => InstanceStatus::Error,
            };
            instance.resolved = v1_inst
                .get("resolved")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            instance.duration_seconds = v1_inst
                .get("duration")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            instance.error_message = v1_inst
                .get("error_message")
                .and_then(|v| v.as_str())
                .map(String::from);

            if let Some(score) = v1_inst.get("score").and_then(|v| v.as_u64()) {
                instance.validation.total_score = score as u32;
            }

            report.add_instance(instance);
        }
    }

    report.finalize();
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored_instance(id: &str, resolved: bool) -> InstanceResult {
        let mut inst = InstanceResult::new(id, "test-model");
        inst.solution_patch = Some("diff --git a/x b/x\n".into());
        inst.duration_seconds = 10.0;
        if resolved {
            inst.validation.deployment_status = ComponentStatus::Pass;
            inst.validation.unit_test_status = ComponentStatus::Pass;
            inst.validation.functional_status = ComponentStatus::Pass;
            inst.validation.bulk_status = ComponentStatus::Pass;
            inst.validation.no_tweaks_status = ComponentStatus::Pass;
            inst.validation.calculate_total();
            inst.mark_resolved();
        } else {
            inst.validation.deployment_status = ComponentStatus::Pass;
            inst.validation.calculate_total();
            inst.mark_failed("functional check failed");
        }
        inst
    }

    #[test]
    fn test_score_is_sum_of_true_weights() {
        let mut v = ValidationBreakdown {
            deployment_status: ComponentStatus::Pass,
            unit_test_status: ComponentStatus::Pass,
            functional_status: ComponentStatus::Fail,
            bulk_status: ComponentStatus::Pass,
            no_tweaks_status: ComponentStatus::Skipped,
            ..Default::default()
        };
        assert_eq!(v.calculate_total(), 40);

        v.functional_status = ComponentStatus::Pass;
        v.no_tweaks_status = ComponentStatus::Pass;
        assert_eq!(v.calculate_total(), 100);
    }

    #[test]
    fn test_resolution_requires_deploy_unit_and_functional() {
        let mut v = ValidationBreakdown {
            deployment_status: ComponentStatus::Pass,
            unit_test_status: ComponentStatus::Pass,
            functional_status: ComponentStatus::Pass,
            // Bulk and no-tweaks do not gate resolution.
            bulk_status: ComponentStatus::Fail,
            no_tweaks_status: ComponentStatus::Fail,
            ..Default::default()
        };
        assert!(v.is_resolved());

        v.functional_status = ComponentStatus::Fail;
        assert!(!v.is_resolved());

        v.functional_status = ComponentStatus::Pass;
        v.unit_test_status = ComponentStatus::Fail;
        assert!(!v.is_resolved());
    }

    #[test]
    fn test_finalize_computes_id_lists() {
        let mut report = EvaluationReport::new("test-model", "verified");
        report.add_instance(scored_instance("b-task", true));
        report.add_instance(scored_instance("a-task", false));
        let mut err = InstanceResult::new("c-task", "test-model");
        err.mark_error("Unexpected", "boom");
        report.add_instance(err);

        report.finalize();

        assert_eq!(report.resolved_ids, vec!["b-task"]);
        assert_eq!(report.unresolved_ids, vec!["a-task"]);
        assert_eq!(report.error_ids, vec!["c-task"]);
        assert_eq!(report.empty_patch_ids, vec!["c-task"]);
        assert_eq!(report.completed_ids, vec!["a-task", "b-task"]);
        assert_eq!(report.summary.total_instances, 3);
        assert_eq!(report.summary.resolved_instances, 1);
        assert_eq!(report.summary.instances_completed, 2);
        assert!((report.summary.resolution_rate - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_report_json_roundtrip() {
        let mut report = EvaluationReport::new("test-model", "lite");
        report.add_instance(scored_instance("x", true));
        report.finalize();

        let json = serde_json::to_string_pretty(&report).unwrap();
        let back: EvaluationReport = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string_pretty(&back).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn test_validate_schema() {
        let mut report = EvaluationReport::new("m", "verified");
        report.finalize();
        let value = serde_json::to_value(&report).unwrap();
        assert!(validate_schema(&value));

        let mut broken = value.clone();
        broken["schema_version"] = serde_json::json!("1.0");
        assert!(!validate_schema(&broken));

        let mut missing = value;
        missing.as_object_mut().unwrap().remove("run_id");
        assert!(!validate_schema(&missing));
    }

    #[test]
    fn test_v1_migration_preserves_instance_ids() {
        let v1 = serde_json::json!({
            "model_name": "old-model",
            "instances": [
                {"instance_id": "t1", "status": "resolved", "resolved": true, "duration": 3.5, "score": 100},
                {"instance_id": "t2", "status": "fail", "resolved": false, "error_message": "nope"},
                {"instance_id": "t3", "status": "error"}
            ]
        });

        let report = migrate_v1_to_v2(&v1);
        assert_eq!(report.schema_version, SCHEMA_VERSION);
        let ids: Vec<&str> = report
            .instances
            .iter()
            .map(|i| i.instance_id.as_str())
            .collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert_eq!(report.instances[0].validation.total_score, 100);
        // Zero-filled where absent in v1.
        assert_eq!(report.instances[1].validation.total_score, 0);
        assert_eq!(
            report.instances[1].validation.deployment_status,
            ComponentStatus::Skipped
        );
    }
}
