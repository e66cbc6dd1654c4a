//! Ephemeral scratch-org provisioning, addressing, and teardown.
//!
//! Creation is serialized through a process-wide mutex: the DevHub API is
//! rate-limited, and racing requests from parallel workers can exceed the
//! per-hub active-org limit. This mutex is one of the two sanctioned
//! globals (the other is the config singleton).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::get_config;
use crate::domain::error::{Result, SfBenchError};
use crate::process::{parse_json_output, run_command};

/// Process-wide lock held for the duration of each `sf org create` call.
static ORG_CREATION_LOCK: Mutex<()> = Mutex::const_new(());

/// Details of a provisioned scratch org.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrgInfo {
    /// Username the org is addressed by in subsequent commands.
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

/// Options for scratch-org creation.
#[derive(Debug, Clone)]
pub struct OrgRequest {
    pub alias: String,
    pub duration_days: u32,
    /// Canonical definition file; passed only when the file exists.
    pub definition_file: Option<PathBuf>,
    /// Working directory for the CLI call (the task repo, so its
    /// `sfdx-project.json` is the one in effect).
    pub cwd: Option<PathBuf>,
}

impl OrgRequest {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            duration_days: 1,
            definition_file: None,
            cwd: None,
        }
    }

    fn command(&self) -> String {
        let mut cmd = format!(
            "sf org create scratch --alias {} --duration-days {}",
            self.alias, self.duration_days
        );
        if let Some(def) = &self.definition_file {
            if def.exists() {
                cmd.push_str(&format!(" --definition-file \"{}\"", def.display()));
            }
        }
        cmd.push_str(" --set-default");
        cmd
    }
}

/// Create a scratch org with retry and exponential backoff.
///
/// Up to `max_retries` attempts (initial delay 2 s, factor 2).
/// [`SfBenchError::PlatformLimitation`] is never retried: the failure is
/// deterministic and attributable to the solution under test.
pub async fn create_scratch_org(request: &OrgRequest) -> Result<OrgInfo> {
    let config = get_config();
    let max_retries = config.max_retries();
    let initial_delay = config.initial_delay();
    let timeout = config.timeout_setup();

    let _guard = ORG_CREATION_LOCK.lock().await;

    let command = request.command();
    let mut last_error: Option<SfBenchError> = None;

    for attempt in 1..=max_retries {
        match run_command(&command, request.cwd.as_deref(), timeout, true).await {
            Ok(out) => {
                let data = parse_json_output(&out.stdout)?;
                if let Some(result) = data.get("result") {
                    let username = result
                        .get("username")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .ok_or_else(|| SfBenchError::OrgCreation {
                            message: "no username in org creation response".into(),
                            exit_code: out.exit_code,
                            stderr: String::new(),
                        })?;
                    let org_id = result
                        .get("orgId")
                        .and_then(|v| v.as_str())
                        .map(String::from);

                    info!(alias = %request.alias, %username, attempt, "created scratch org");
                    return Ok(OrgInfo { username, org_id });
                }

                let message = data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                last_error = Some(SfBenchError::OrgCreation {
                    message,
                    exit_code: data.get("status").and_then(|v| v.as_i64()).unwrap_or(1) as i32,
                    stderr: String::new(),
                });
            }
            Err(e @ SfBenchError::PlatformLimitation { .. }) => {
                warn!(
                    alias = %request.alias,
                    "scratch org creation hit a platform limitation: {e}; not retrying"
                );
                return Err(e);
            }
            Err(e @ (SfBenchError::OrgCreation { .. } | SfBenchError::Timeout { .. })) => {
                last_error = Some(e);
            }
            Err(e) => {
                return Err(SfBenchError::OrgCreation {
                    message: format!("failed to create scratch org: {e}"),
                    exit_code: 1,
                    stderr: String::new(),
                })
            }
        }

        if attempt < max_retries {
            let delay = initial_delay * 2f64.powi(attempt as i32 - 1);
            warn!(
                alias = %request.alias,
                attempt,
                max_retries,
                "scratch org creation failed: {}; retrying in {delay:.1}s",
                last_error.as_ref().map(ToString::to_string).unwrap_or_default()
            );
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    let err = last_error.unwrap_or_else(|| SfBenchError::OrgCreation {
        message: "failed to create scratch org: no output received".into(),
        exit_code: 1,
        stderr: String::new(),
    });
    error!(alias = %request.alias, "scratch org creation failed after {max_retries} attempts: {err}");
    Err(err)
}

/// Delete a scratch org by alias or username. Best-effort: failures are
/// logged and swallowed so teardown never fails an evaluation.
pub async fn delete_scratch_org(alias_or_username: &str) -> bool {
    let target = match get_scratch_org_username(alias_or_username).await {
        Some(username) => username,
        None => alias_or_username.to_string(),
    };

    let command = format!("sf org delete scratch --target-org {target} --no-prompt");
    match run_command(&command, None, 60, false).await {
        Ok(_) => {
            info!(org = %target, "deleted scratch org");
            true
        }
        Err(e) => {
            warn!(org = %target, "could not delete scratch org: {e}");
            false
        }
    }
}

/// Resolve a scratch-org alias to its username via the CLI org registry.
pub async fn get_scratch_org_username(alias: &str) -> Option<String> {
    let out = run_command("sf org list", None, 30, true).await.ok()?;
    let data = parse_json_output(&out.stdout).ok()?;

    data.get("result")?
        .get("scratchOrgs")?
        .as_array()?
        .iter()
        .find(|org| org.get("alias").and_then(|v| v.as_str()) == Some(alias))
        .and_then(|org| org.get("username").and_then(|v| v.as_str()))
        .map(String::from)
}

/// Locate the canonical scratch-org definition file under a templates
/// directory, if one is present.
pub fn default_definition_file(templates_dir: &Path) -> Option<PathBuf> {
    let candidate = templates_dir.join("project-scratch-def.json");
    candidate.exists().then_some(candidate)
}
