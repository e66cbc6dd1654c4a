//! Outcome validation: does the deployed solution match the task's
//! declared requirements, beyond the validation command passing?
//!
//! Checks are driven by `validation.additional_checks`: `required_files`
//! lists workspace-relative paths that must exist after patching, and
//! `required_content` lists strings that must appear somewhere in the
//! project's metadata sources. Task types add their own default checks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::task::{RunnerKind, Task};
use crate::process::{parse_json_output, run_command};

/// Threshold above which the solution is considered to match requirements.
const MATCH_THRESHOLD: f64 = 0.8;

/// One requirement check and its verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeCheck {
    pub check: String,
    pub passed: bool,
    pub details: String,
}

/// Aggregated outcome-validation result for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeReport {
    pub matches_requirements: bool,
    pub match_score: f64,
    pub validation_checks: Vec<OutcomeCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl OutcomeReport {
    fn from_checks(checks: Vec<OutcomeCheck>, errors: Vec<String>) -> Self {
        if checks.is_empty() {
            // No declared requirements: vacuously satisfied.
            return Self {
                matches_requirements: errors.is_empty(),
                match_score: if errors.is_empty() { 1.0 } else { 0.0 },
                validation_checks: checks,
                errors,
            };
        }

        let passed = checks.iter().filter(|c| c.passed).count();
        let score = passed as f64 / checks.len() as f64;
        Self {
            matches_requirements: score >= MATCH_THRESHOLD,
            match_score: score,
            validation_checks: checks,
            errors,
        }
    }
}

/// Validates that a solution meets the task requirements.
pub struct OutcomeValidator<'a> {
    task: &'a Task,
    repo_dir: PathBuf,
}

impl<'a> OutcomeValidator<'a> {
    pub fn new(task: &'a Task, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            task,
            repo_dir: repo_dir.into(),
        }
    }

    /// Run all declared and type-default checks.
    pub async fn validate_outcome(&self) -> OutcomeReport {
        let mut checks = Vec::new();
        let errors = Vec::new();

        self.check_required_files(&mut checks);
        self.check_required_content(&mut checks);

        match self.task.task_type.runner_kind() {
            RunnerKind::Apex => self.check_apex_tests(&mut checks).await,
            RunnerKind::Flow => self.check_flow_metadata(&mut checks),
            RunnerKind::LightningPage | RunnerKind::Community | RunnerKind::Architecture => {
                self.check_generic_command(&mut checks).await
            }
            RunnerKind::Lwc | RunnerKind::Deploy => {}
        }

        debug!(
            task = %self.task.instance_id,
            checks = checks.len(),
            "outcome validation complete"
        );
        OutcomeReport::from_checks(checks, errors)
    }

    fn additional_list(&self, key: &str) -> Vec<String> {
        self.task
            .validation
            .additional_checks
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `required_files`: workspace-relative paths that must exist.
    fn check_required_files(&self, checks: &mut Vec<OutcomeCheck>) {
        for rel in self.additional_list("required_files") {
            let path = self.repo_dir.join(&rel);
            checks.push(OutcomeCheck {
                check: format!("file_present:{rel}"),
                passed: path.exists(),
                details: if path.exists() {
                    "present".into()
                } else {
                    "missing".into()
                },
            });
        }
    }

    /// `required_content`: strings that must appear in project metadata.
    fn check_required_content(&self, checks: &mut Vec<OutcomeCheck>) {
        let needles = self.additional_list("required_content");
        if needles.is_empty() {
            return;
        }

        let mut haystack = String::new();
        collect_metadata_sources(&self.repo_dir.join("force-app"), &mut haystack);

        for needle in needles {
            let found = haystack.contains(&needle);
            checks.push(OutcomeCheck {
                check: format!("content_present:{needle}"),
                passed: found,
                details: if found {
                    "found in metadata sources".into()
                } else {
                    "not found in metadata sources".into()
                },
            });
        }
    }

    async fn check_apex_tests(&self, checks: &mut Vec<OutcomeCheck>) {
        match run_command(
            &self.task.validation.command,
            Some(&self.repo_dir),
            self.task.timeouts.run,
            true,
        )
        .await
        {
            Ok(out) => {
                let outcome = parse_json_output(&out.stdout)
                    .ok()
                    .and_then(|data| {
                        data.get("result")?
                            .get("summary")?
                            .get("outcome")
                            .map(|v| v.as_str().unwrap_or("").to_lowercase())
                    })
                    .unwrap_or_default();
                checks.push(OutcomeCheck {
                    check: "tests_pass".into(),
                    passed: outcome == "passed",
                    details: format!("test outcome: {outcome}"),
                });
            }
            Err(e) => checks.push(OutcomeCheck {
                check: "tests_pass".into(),
                passed: false,
                details: format!("error: {e}"),
            }),
        }
    }

    fn check_flow_metadata(&self, checks: &mut Vec<OutcomeCheck>) {
        let flows_dir = self.repo_dir.join("force-app/main/default/flows");
        let has_flow = std::fs::read_dir(&flows_dir)
            .map(|rd| {
                rd.flatten().any(|e| {
                    e.path()
                        .to_string_lossy()
                        .ends_with(".flow-meta.xml")
                })
            })
            .unwrap_or(false);
        checks.push(OutcomeCheck {
            check: "flow_metadata_present".into(),
            passed: has_flow,
            details: format!("flows dir: {}", flows_dir.display()),
        });
    }

    async fn check_generic_command(&self, checks: &mut Vec<OutcomeCheck>) {
        match run_command(
            &self.task.validation.command,
            Some(&self.repo_dir),
            self.task.timeouts.run,
            false,
        )
        .await
        {
            Ok(out) => checks.push(OutcomeCheck {
                check: "command_execution".into(),
                passed: out.exit_code == 0,
                details: format!("exit code: {}", out.exit_code),
            }),
            Err(e) => checks.push(OutcomeCheck {
                check: "command_execution".into(),
                passed: false,
                details: format!("error: {e}"),
            }),
        }
    }
}

fn collect_metadata_sources(dir: &Path, out: &mut String) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_metadata_sources(&path, out);
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            out.push_str(&content);
            out.push('\n');
        }
    }
}
