//! Functional validation: verifies that solutions actually WORK, not
//! just deploy.
//!
//! This is the difference between "it deployed successfully" and "it does
//! what the task asked for". The weighted rubric is fixed: deployment 10,
//! unit tests 20, functional outcome 50, bulk operation 10, no manual
//! tweaks 10. A task is *resolved* only when deployment, unit tests, and
//! the functional outcome all pass; bulk and no-tweaks affect score, not
//! resolution.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::report::{ComponentStatus, ValidationBreakdown};
use crate::process::{parse_json_output, run_command};

/// Delay after triggering a record so record-triggered automation can run.
const ASYNC_SETTLE: Duration = Duration::from_secs(5);

/// Depth of validation performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Syntax,
    Deployment,
    Functional,
    ProductionReady,
}

/// Status of one validation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Passed,
    Failed,
    Error,
}

/// A single validation step with its observed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStep {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub success_criteria: serde_json::Value,
    pub timeout: u64,
    pub status: StepStatus,
    #[serde(default)]
    pub actual_output: String,
    #[serde(default)]
    pub error_message: String,
    pub duration: f64,
}

/// Complete functional validation result for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionalValidationResult {
    pub task_id: String,
    pub validation_level: ValidationLevel,
    pub overall_status: String,
    pub score: f64,
    pub steps: Vec<ValidationStep>,

    pub deployment_passed: bool,
    pub unit_tests_passed: bool,
    pub functional_tests_passed: bool,
    pub bulk_tests_passed: bool,
    pub no_manual_tweaks: bool,
}

impl FunctionalValidationResult {
    fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            validation_level: ValidationLevel::Functional,
            overall_status: "pending".into(),
            score: 0.0,
            steps: Vec::new(),
            deployment_passed: false,
            unit_tests_passed: false,
            functional_tests_passed: false,
            bulk_tests_passed: false,
            no_manual_tweaks: false,
        }
    }

    /// Weighted score: the sum of the weights whose booleans are true.
    pub fn calculate_score(&mut self) -> f64 {
        let mut score = 0.0;
        if self.deployment_passed {
            score += ValidationBreakdown::DEPLOY_WEIGHT as f64;
        }
        if self.unit_tests_passed {
            score += ValidationBreakdown::UNIT_TEST_WEIGHT as f64;
        }
        if self.functional_tests_passed {
            score += ValidationBreakdown::FUNCTIONAL_WEIGHT as f64;
        }
        if self.bulk_tests_passed {
            score += ValidationBreakdown::BULK_WEIGHT as f64;
        }
        if self.no_manual_tweaks {
            score += ValidationBreakdown::NO_TWEAKS_WEIGHT as f64;
        }
        self.score = score;
        score
    }

    /// Resolved iff deployment, unit tests, and functional outcome passed.
    pub fn is_resolved(&self) -> bool {
        self.deployment_passed && self.unit_tests_passed && self.functional_tests_passed
    }

    /// Convert to the report schema's component breakdown.
    pub fn to_breakdown(&self) -> ValidationBreakdown {
        let status = |passed: bool| {
            if passed {
                ComponentStatus::Pass
            } else {
                ComponentStatus::Fail
            }
        };
        let mut breakdown = ValidationBreakdown {
            deployment_status: status(self.deployment_passed),
            unit_test_status: status(self.unit_tests_passed),
            functional_status: status(self.functional_tests_passed),
            bulk_status: status(self.bulk_tests_passed),
            no_tweaks_status: status(self.no_manual_tweaks),
            ..Default::default()
        };
        breakdown.calculate_total();
        breakdown
    }
}

/// Runs the per-type functional validation recipes against a scratch org.
pub struct FunctionalValidator {
    scratch_org: String,
    workspace_dir: PathBuf,
}

impl FunctionalValidator {
    pub fn new(scratch_org: impl Into<String>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_org: scratch_org.into(),
            workspace_dir: workspace_dir.into(),
        }
    }

    /// Apex: deploy, run unit tests with coverage, optional test-data
    /// script, optional SOQL verification, optional bulk script.
    pub async fn validate_apex(
        &self,
        task_id: &str,
        functional_config: Option<&serde_json::Value>,
        repo_dir: &Path,
    ) -> FunctionalValidationResult {
        let mut result = FunctionalValidationResult::new(task_id);
        let config = functional_config.cloned().unwrap_or_default();

        let deploy = self
            .run_step(
                "Deploy to Scratch Org",
                &format!("sf project deploy start --target-org {}", self.scratch_org),
                Some(repo_dir),
                300,
            )
            .await;
        result.deployment_passed = deploy.status == StepStatus::Passed;
        result.steps.push(deploy);

        if !result.deployment_passed {
            result.overall_status = "failed".into();
            result.calculate_score();
            return result;
        }

        let tests = self
            .run_step(
                "Run Unit Tests",
                &format!(
                    "sf apex run test --target-org {} --code-coverage --result-format json --wait 10",
                    self.scratch_org
                ),
                Some(repo_dir),
                600,
            )
            .await;
        if tests.status == StepStatus::Passed {
            if let Ok(data) = parse_json_output(&tests.actual_output) {
                let outcome = data
                    .get("result")
                    .and_then(|r| r.get("summary"))
                    .and_then(|s| s.get("outcome"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                result.unit_tests_passed = outcome == "Passed";
            }
        }
        result.steps.push(tests);

        if let Some(script) = config.get("test_data_script").and_then(|v| v.as_str()) {
            let step = self
                .run_step(
                    "Create Test Data",
                    &format!("sf apex run --target-org {} --file {script}", self.scratch_org),
                    Some(repo_dir),
                    120,
                )
                .await;
            result.steps.push(step);
        }

        if let Some(query) = config.get("verification_query").and_then(|v| v.as_str()) {
            let expected = config
                .get("expected_values")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            let verify = self.run_soql_verification("Verify Outcome", query, &expected).await;
            result.functional_tests_passed = verify.status == StepStatus::Passed;
            result.steps.push(verify);
        } else {
            // No specific verification declared: the unit-test signal stands
            // in for the functional outcome.
            result.functional_tests_passed = result.unit_tests_passed;
        }

        if let Some(script) = config.get("bulk_test_script").and_then(|v| v.as_str()) {
            let step = self
                .run_step(
                    "Bulk Test (200 records)",
                    &format!("sf apex run --target-org {} --file {script}", self.scratch_org),
                    Some(repo_dir),
                    300,
                )
                .await;
            result.bulk_tests_passed = step.status == StepStatus::Passed;
            result.steps.push(step);
        } else {
            result.bulk_tests_passed = true;
        }

        self.finish(&mut result);
        result
    }

    /// Flow: deploy, activate, trigger a matching record, wait for async
    /// processing, verify every declared outcome, bulk test, negative test.
    ///
    /// A Flow that deploys is not the same as a Flow that works; every
    /// declared outcome verification must match.
    pub async fn validate_flow(
        &self,
        task_id: &str,
        functional_config: Option<&serde_json::Value>,
        repo_dir: &Path,
    ) -> FunctionalValidationResult {
        let mut result = FunctionalValidationResult::new(task_id);
        let config = functional_config.cloned().unwrap_or_default();

        let deploy = self
            .run_step(
                "Deploy Flow",
                &format!(
                    "sf project deploy start --target-org {} --source-dir force-app/main/default/flows",
                    self.scratch_org
                ),
                Some(repo_dir),
                300,
            )
            .await;
        result.deployment_passed = deploy.status == StepStatus::Passed;
        result.steps.push(deploy);

        if !result.deployment_passed {
            result.overall_status = "failed".into();
            result.calculate_score();
            return result;
        }

        if let Some(script) = config.get("activation_script").and_then(|v| v.as_str()) {
            let step = self
                .run_step(
                    "Activate Flow",
                    &format!("sf apex run --target-org {} --file {script}", self.scratch_org),
                    Some(repo_dir),
                    60,
                )
                .await;
            result.steps.push(step);
        }

        if let Some(script) = config.get("trigger_test_script").and_then(|v| v.as_str()) {
            let step = self
                .run_step(
                    "Create Test Record (Trigger Flow)",
                    &format!("sf apex run --target-org {} --file {script}", self.scratch_org),
                    Some(repo_dir),
                    120,
                )
                .await;
            result.steps.push(step);
        }

        // Record-triggered flows run asynchronously after the DML commits.
        tokio::time::sleep(ASYNC_SETTLE).await;

        let verifications = config
            .get("outcome_verifications")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut all_verified = true;
        for verification in &verifications {
            let name = verification
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("Verify Outcome");
            let query = verification
                .get("query")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let expected = verification
                .get("expected")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            let step = self.run_soql_verification(name, query, &expected).await;
            if step.status != StepStatus::Passed {
                all_verified = false;
            }
            result.steps.push(step);
        }
        result.functional_tests_passed = all_verified;

        if let Some(script) = config.get("bulk_test_script").and_then(|v| v.as_str()) {
            let step = self
                .run_step(
                    "Bulk Test (200 records)",
                    &format!("sf apex run --target-org {} --file {script}", self.scratch_org),
                    Some(repo_dir),
                    300,
                )
                .await;
            result.bulk_tests_passed = step.status == StepStatus::Passed;
            result.steps.push(step);
        }

        if let Some(script) = config.get("negative_test_script").and_then(|v| v.as_str()) {
            let step = self
                .run_step(
                    "Negative Test (Should NOT trigger)",
                    &format!("sf apex run --target-org {} --file {script}", self.scratch_org),
                    Some(repo_dir),
                    120,
                )
                .await;
            result.steps.push(step);
        }

        if result.deployment_passed && result.functional_tests_passed {
            // Flows have no unit tests; the functional gate stands in.
            result.unit_tests_passed = true;
            result.no_manual_tweaks = true;
            result.overall_status = "passed".into();
        } else {
            result.overall_status = "failed".into();
        }
        result.calculate_score();
        result
    }

    /// LWC: Jest unit tests with coverage, deploy, optional
    /// controller-level apex script.
    pub async fn validate_lwc(
        &self,
        task_id: &str,
        functional_config: Option<&serde_json::Value>,
        repo_dir: &Path,
    ) -> FunctionalValidationResult {
        let mut result = FunctionalValidationResult::new(task_id);
        let config = functional_config.cloned().unwrap_or_default();

        let jest = self
            .run_step(
                "Run Jest Tests",
                "npm run test:unit -- --coverage --passWithNoTests",
                Some(repo_dir),
                300,
            )
            .await;
        result.unit_tests_passed = jest.status == StepStatus::Passed;
        result.steps.push(jest);

        let deploy = self
            .run_step(
                "Deploy to Scratch Org",
                &format!("sf project deploy start --target-org {}", self.scratch_org),
                Some(repo_dir),
                300,
            )
            .await;
        result.deployment_passed = deploy.status == StepStatus::Passed;
        result.steps.push(deploy);

        if let Some(script) = config.get("controller_test_script").and_then(|v| v.as_str()) {
            let step = self
                .run_step(
                    "Test Apex Controller",
                    &format!("sf apex run --target-org {} --file {script}", self.scratch_org),
                    Some(repo_dir),
                    120,
                )
                .await;
            result.functional_tests_passed = step.status == StepStatus::Passed;
            result.steps.push(step);
        } else {
            result.functional_tests_passed = result.unit_tests_passed;
        }

        // Bulk operations do not apply to component work.
        result.bulk_tests_passed = true;

        if result.unit_tests_passed && result.deployment_passed {
            result.no_manual_tweaks = true;
            result.overall_status = "passed".into();
        } else {
            result.overall_status = "failed".into();
        }
        result.calculate_score();
        result
    }

    fn finish(&self, result: &mut FunctionalValidationResult) {
        if result.deployment_passed && result.unit_tests_passed && result.functional_tests_passed {
            result.overall_status = "passed".into();
            result.no_manual_tweaks = true;
        } else if result.deployment_passed && result.unit_tests_passed {
            result.overall_status = "partial".into();
        } else {
            result.overall_status = "failed".into();
        }
        result.calculate_score();
    }

    /// Execute a validation step and capture its outcome.
    async fn run_step(
        &self,
        name: &str,
        command: &str,
        cwd: Option<&Path>,
        timeout: u64,
    ) -> ValidationStep {
        let mut step = ValidationStep {
            name: name.to_string(),
            command: command.to_string(),
            success_criteria: serde_json::json!({"exit_code": 0}),
            timeout,
            status: StepStatus::Pending,
            actual_output: String::new(),
            error_message: String::new(),
            duration: 0.0,
        };

        let start = Instant::now();
        let dir = cwd.unwrap_or(&self.workspace_dir);

        match run_command(command, Some(dir), timeout, false).await {
            Ok(out) => {
                step.actual_output = out.stdout;
                step.status = StepStatus::Passed;
            }
            Err(crate::domain::SfBenchError::Command { stderr, .. }) => {
                step.status = StepStatus::Failed;
                step.error_message = stderr;
            }
            Err(crate::domain::SfBenchError::Timeout { timeout_secs, .. }) => {
                step.status = StepStatus::Error;
                step.error_message = format!("command timed out after {timeout_secs}s");
            }
            Err(e) => {
                step.status = StepStatus::Error;
                step.error_message = e.to_string();
            }
        }

        step.duration = start.elapsed().as_secs_f64();
        if step.status != StepStatus::Passed {
            warn!(step = name, status = ?step.status, "validation step did not pass");
        } else {
            info!(step = name, "validation step passed");
        }
        step
    }

    /// Run a SOQL query and verify the records match the expectation.
    ///
    /// `expected.record_count` must equal the number of returned records;
    /// `expected.field_value = { field, value }` requires every record's
    /// `field` to equal `value`.
    async fn run_soql_verification(
        &self,
        name: &str,
        query: &str,
        expected: &serde_json::Value,
    ) -> ValidationStep {
        let command = format!(
            "sf data query --target-org {} --query \"{query}\" --json",
            self.scratch_org
        );
        let mut step = ValidationStep {
            name: name.to_string(),
            command: command.clone(),
            success_criteria: expected.clone(),
            timeout: 120,
            status: StepStatus::Pending,
            actual_output: String::new(),
            error_message: String::new(),
            duration: 0.0,
        };

        let start = Instant::now();
        match run_command(&command, Some(&self.workspace_dir), step.timeout, false).await {
            Ok(out) => {
                step.actual_output = out.stdout.clone();
                match parse_json_output(&out.stdout) {
                    Ok(data) => {
                        let records = data
                            .get("result")
                            .and_then(|r| r.get("records"))
                            .and_then(|r| r.as_array())
                            .cloned()
                            .unwrap_or_default();
                        match verify_records(&records, expected) {
                            Ok(()) => step.status = StepStatus::Passed,
                            Err(msg) => {
                                step.status = StepStatus::Failed;
                                step.error_message = msg;
                            }
                        }
                    }
                    Err(_) => {
                        step.status = StepStatus::Failed;
                        step.error_message = "failed to parse SOQL result".into();
                    }
                }
            }
            Err(crate::domain::SfBenchError::Command { stderr, .. }) => {
                step.status = StepStatus::Failed;
                step.error_message = stderr;
            }
            Err(e) => {
                step.status = StepStatus::Error;
                step.error_message = e.to_string();
            }
        }

        step.duration = start.elapsed().as_secs_f64();
        step
    }
}

/// Compare SOQL records against an expectation object.
fn verify_records(
    records: &[serde_json::Value],
    expected: &serde_json::Value,
) -> std::result::Result<(), String> {
    let Some(expected) = expected.as_object() else {
        return Ok(());
    };

    for (key, expectation) in expected {
        match key.as_str() {
            "record_count" => {
                let want = expectation.as_u64().unwrap_or(0) as usize;
                if records.len() != want {
                    return Err(format!("expected {want} records, got {}", records.len()));
                }
            }
            "field_value" => {
                let field = expectation
                    .get("field")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let want = expectation.get("value").cloned().unwrap_or(serde_json::Value::Null);
                for record in records {
                    let got = record.get(field).cloned().unwrap_or(serde_json::Value::Null);
                    if got != want {
                        return Err(format!(
                            "field {field} expected '{want}', got '{got}'"
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}
