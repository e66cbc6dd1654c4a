//! Subprocess gateway: bounded execution of external CLI commands.
//!
//! Every external invocation (git, the `sf` platform CLI, npm, GNU patch)
//! goes through [`run_command`], which enforces a wall-clock timeout,
//! captures exit code and both streams, and classifies failures into the
//! domain taxonomy.
//!
//! The platform CLI emits update-nag lines on stderr and occasionally
//! returns a non-zero exit code even when its structured result reports
//! success. For commands that emit JSON, the JSON document is the ground
//! truth: a top-level `status == 0` or the presence of a `result` field
//! marks the command as succeeded regardless of the process exit code.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::error::{Result, SfBenchError};

/// Stderr prefix stripped before failure classification.
const CLI_UPDATE_WARNING: &str = "Warning: @salesforce/cli update available";

/// Platform-limitation markers inside org-creation error messages.
/// These indicate the solution depends on platform features unavailable
/// in the provided scratch org edition; a model issue, not tool trouble.
const PLATFORM_LIMITATION_MARKERS: &[&str] = &["package id", "ancestorversion", "collections", "ac -"];

/// Captured output of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run an external command line with a wall-clock timeout.
///
/// * `command`: shell command line (task validation commands are stored
///   as single strings).
/// * `cwd`: working directory, or the process cwd when `None`.
/// * `timeout_secs`: budget after which the child is killed.
/// * `want_json`: append `--json` when absent and apply the
///   JSON-authoritative success policy.
///
/// Returns `Ok` only when the command is considered successful; failures
/// are classified as [`SfBenchError::Timeout`], [`SfBenchError::OrgCreation`],
/// [`SfBenchError::PlatformLimitation`], or [`SfBenchError::Command`].
pub async fn run_command(
    command: &str,
    cwd: Option<&Path>,
    timeout_secs: u64,
    want_json: bool,
) -> Result<CommandOutput> {
    let command_line = if want_json && !command.contains("--json") {
        format!("{command} --json")
    } else {
        command.to_string()
    };

    info!(command = %command_line, cwd = ?cwd, timeout_secs, "executing command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| {
        SfBenchError::Unexpected(format!("failed to spawn command '{command_line}': {e}"))
    })?;

    let output = match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            // Dropping the in-flight future kills the child (kill_on_drop).
            return Err(SfBenchError::Timeout {
                command: command_line,
                timeout_secs,
            });
        }
    };

    let mut exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let should_parse_json = want_json || command_line.contains("--json");
    let mut json_success = false;

    if should_parse_json && !stdout.is_empty() {
        if let Ok(data) = extract_json(&stdout) {
            let status = data.get("status").and_then(|v| v.as_i64());
            let has_result = data.get("result").is_some();
            if status == Some(0) || has_result {
                json_success = true;
                exit_code = 0;
            } else if let Some(code) = status.filter(|&s| s != 0) {
                exit_code = code as i32;
            }
        }
    }

    let stderr_clean = filter_cli_warnings(&stderr);

    if exit_code != 0 && !json_success {
        return Err(classify_failure(&command_line, exit_code, &stdout, &stderr_clean));
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

/// Run a command and feed `input` on its standard input.
///
/// Used by the patch pipeline, which pipes the cleaned diff into git-apply
/// and GNU patch. No JSON policy applies; the raw output is returned with
/// its exit code so the caller can walk the strategy ladder.
pub async fn run_with_stdin(
    program: &str,
    args: &[&str],
    input: &str,
    cwd: &Path,
    timeout_secs: u64,
) -> Result<CommandOutput> {
    debug!(program, ?args, timeout_secs, "executing command with stdin");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SfBenchError::Unexpected(format!("failed to spawn '{program}': {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SfBenchError::Unexpected("child stdin unavailable".into()))?;
    let payload = input.as_bytes().to_vec();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&payload).await;
        // stdin dropped here, closing the pipe.
    });

    let output = match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            writer.abort();
            return Err(SfBenchError::Timeout {
                command: format!("{program} {}", args.join(" ")),
                timeout_secs,
            });
        }
    };
    let _ = writer.await;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Parse the JSON document from CLI stdout, skipping any warning lines
/// printed before it.
pub fn parse_json_output(output: &str) -> Result<serde_json::Value> {
    extract_json(output).map_err(|e| {
        let preview: String = output.chars().take(500).collect();
        SfBenchError::Unexpected(format!("failed to parse JSON output: {e}\nOutput: {preview}"))
    })
}

fn extract_json(output: &str) -> std::result::Result<serde_json::Value, serde_json::Error> {
    let mut json_lines = Vec::new();
    let mut in_json = false;

    for line in output.lines() {
        if line.contains(CLI_UPDATE_WARNING) {
            continue;
        }
        let trimmed = line.trim_start();
        if !in_json && (trimmed.starts_with('{') || trimmed.starts_with('[')) {
            in_json = true;
        }
        if in_json {
            json_lines.push(line);
        }
    }

    let json_str = if json_lines.is_empty() {
        output.trim()
    } else {
        return serde_json::from_str(&json_lines.join("\n"));
    };
    serde_json::from_str(json_str)
}

/// Drop CLI update-nag lines and blank lines from stderr.
fn filter_cli_warnings(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.contains(CLI_UPDATE_WARNING) && !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn classify_failure(
    command: &str,
    exit_code: i32,
    stdout: &str,
    stderr_clean: &str,
) -> SfBenchError {
    let lowered = command.to_lowercase();
    let is_org_creation = lowered.contains("org create") || lowered.contains("scratch");

    if is_org_creation {
        // Prefer the structured message when the CLI produced one.
        let mut message = if stderr_clean.is_empty() {
            "Unknown error during org creation".to_string()
        } else {
            stderr_clean.to_string()
        };
        if let Ok(data) = extract_json(stdout) {
            if let Some(m) = data.get("message").and_then(|v| v.as_str()) {
                message = m.to_string();
            } else if let Some(e) = data.get("error") {
                message = e.to_string();
            }
        }

        let haystack = message.to_lowercase();
        if PLATFORM_LIMITATION_MARKERS
            .iter()
            .any(|marker| haystack.contains(marker))
        {
            return SfBenchError::PlatformLimitation {
                message,
                exit_code,
                stderr: SfBenchError::stderr_excerpt(stderr_clean),
            };
        }

        return SfBenchError::OrgCreation {
            message,
            exit_code,
            stderr: SfBenchError::stderr_excerpt(stderr_clean),
        };
    }

    SfBenchError::Command {
        message: format!(
            "command failed with exit code {exit_code}: {}",
            SfBenchError::stderr_excerpt(stderr_clean)
        ),
        exit_code,
        stderr: SfBenchError::stderr_excerpt(stderr_clean),
    }
}
