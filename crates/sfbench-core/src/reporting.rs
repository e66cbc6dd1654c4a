//! Run report emission: canonical JSON plus a Markdown rendering, and
//! the runner-result to schema-v2 instance conversion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::domain::error::Result;
use crate::domain::report::{ComponentStatus, EvaluationReport, InstanceResult, InstanceStatus};
use crate::domain::result::{TaskResult, TaskStatus};
use crate::functional::FunctionalValidationResult;

/// Convert a runner-level [`TaskResult`] into a schema-v2
/// [`InstanceResult`].
///
/// When a functional validation ran, its component booleans drive the
/// breakdown; otherwise the breakdown degrades to deployment-only
/// (a bare PASS scores 10/100). Timeouts surface as `error` in the
/// schema, with the error type recording the distinction.
pub fn instance_from_test_result(
    result: &TaskResult,
    model_name: &str,
    functional: Option<&FunctionalValidationResult>,
) -> InstanceResult {
    let mut instance = InstanceResult::new(&result.task_id, model_name);
    instance.duration_seconds = result.duration_seconds;
    instance.start_time = result.timestamp.to_rfc3339();

    match functional {
        Some(f) => {
            instance.validation = f.to_breakdown();
            instance.validation.functional_details.insert(
                "steps".into(),
                serde_json::to_value(&f.steps).unwrap_or_default(),
            );
        }
        None => {
            if result.status == TaskStatus::Pass {
                instance.validation.deployment_status = ComponentStatus::Pass;
            }
            instance.validation.calculate_total();
        }
    }

    if instance.validation.is_resolved() || result.status == TaskStatus::Pass {
        instance.mark_resolved();
    } else {
        match result.status {
            TaskStatus::Fail => instance.mark_failed(
                result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "validation failed".to_string()),
            ),
            TaskStatus::Timeout => instance.mark_error(
                "timeout",
                result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "task timed out".to_string()),
            ),
            _ => instance.mark_error(
                "execution_error",
                result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
        }
    }

    instance
}

/// Finalize the report and write `report.json` and `summary.md` into
/// `output_dir`. Returns the paths keyed by format.
///
/// The JSON document is the canonical artifact; the Markdown file is a
/// rendering of it.
pub fn make_run_report(
    report: &mut EvaluationReport,
    output_dir: &Path,
    include_json: bool,
    include_markdown: bool,
) -> Result<HashMap<&'static str, PathBuf>> {
    std::fs::create_dir_all(output_dir)?;
    report.finalize();

    let mut generated = HashMap::new();

    if include_json {
        let json_path = output_dir.join("report.json");
        std::fs::write(&json_path, serde_json::to_string_pretty(report)?)?;
        generated.insert("json", json_path);
    }

    if include_markdown {
        let md_path = output_dir.join("summary.md");
        std::fs::write(&md_path, generate_markdown_summary(report))?;
        generated.insert("markdown", md_path);
    }

    info!(dir = %output_dir.display(), "evaluation report written");
    Ok(generated)
}

/// Render the report as a human-readable Markdown summary.
pub fn generate_markdown_summary(report: &EvaluationReport) -> String {
    let s = &report.summary;
    let mut md = String::new();

    md.push_str(&format!(
        "# SF-Bench Evaluation Report\n\n\
         **Model:** {}  \n\
         **Dataset:** {}  \n\
         **Run ID:** {}  \n\
         **Started:** {}\n\n---\n\n",
        report.model_name, report.dataset, report.run_id, report.start_time
    ));

    md.push_str("## Overall Results\n\n");
    md.push_str("| Metric | Value |\n|--------|-------|\n");
    md.push_str(&format!("| Total Instances | {} |\n", s.total_instances));
    md.push_str(&format!("| Instances Submitted | {} |\n", s.instances_submitted));
    md.push_str(&format!("| Instances Completed | {} |\n", s.instances_completed));
    md.push_str(&format!("| Instances Resolved | {} |\n", s.resolved_instances));
    md.push_str(&format!("| Instances Unresolved | {} |\n", s.instances_unresolved));
    md.push_str(&format!("| Instances Error | {} |\n", s.error_instances));
    md.push_str(&format!("| Instances Empty Patch | {} |\n", s.instances_empty_patch));
    md.push_str(&format!("| Resolution Rate | {:.1}% |\n\n", s.resolution_rate));

    md.push_str("## Scoring Summary\n\n");
    md.push_str("| Metric | Value |\n|--------|-------|\n");
    md.push_str(&format!("| Average Score | {:.1}/100 |\n", s.avg_score));
    md.push_str(&format!(
        "| Average Functional Score | {:.1}/50 |\n",
        s.avg_functional_score
    ));
    md.push_str(&format!("| Median Score | {:.1}/100 |\n", s.median_score));
    md.push_str(&format!("| Min Score | {}/100 |\n", s.min_score));
    md.push_str(&format!("| Max Score | {}/100 |\n\n", s.max_score));

    md.push_str("## Component Analysis\n\n");
    md.push_str("| Component | Pass Rate |\n|-----------|-----------|\n");
    for (name, rate) in [
        ("Deployment", s.deployment_pass_rate),
        ("Unit Tests", s.unit_test_pass_rate),
        ("Functional", s.functional_pass_rate),
        ("Bulk Operations", s.bulk_pass_rate),
        ("No Manual Tweaks", s.no_tweaks_pass_rate),
    ] {
        md.push_str(&format!("| {name} | {:.1}% |\n", rate * 100.0));
    }
    md.push('\n');

    md.push_str("## Instances\n\n");
    md.push_str("| Instance | Status | Score | Duration (s) |\n");
    md.push_str("|----------|--------|-------|---------------|\n");
    for inst in &report.instances {
        let status = match inst.status {
            InstanceStatus::Resolved => "resolved",
            InstanceStatus::Fail => "fail",
            InstanceStatus::Error => "error",
            InstanceStatus::Skipped => "skipped",
        };
        md.push_str(&format!(
            "| {} | {} | {}/100 | {:.1} |\n",
            inst.instance_id, status, inst.validation.total_score, inst.duration_seconds
        ));
    }
    md.push('\n');

    let errored: Vec<&_> = report
        .instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Error)
        .collect();
    if !errored.is_empty() {
        md.push_str("## Errors\n\n");
        for inst in errored {
            md.push_str(&format!(
                "- **{}**: {}: {}\n",
                inst.instance_id,
                inst.error_type.as_deref().unwrap_or("unknown"),
                inst.error_message.as_deref().unwrap_or("no message")
            ));
        }
        md.push('\n');
    }

    md.push_str(&format!(
        "---\n\nTotal duration: {:.1}s (avg {:.1}s per instance)\n",
        s.total_duration_seconds, s.avg_duration_seconds
    ));

    md
}
