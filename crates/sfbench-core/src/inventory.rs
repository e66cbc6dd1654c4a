//! DevHub inventory and scratch-org capacity checks.
//!
//! Queried once before a run starts: if the remaining daily scratch-org
//! quota across all connected DevHubs is below the requested task count,
//! the run refuses to start. Informational only: a failure here never
//! affects in-flight tasks.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::process::{parse_json_output, run_command};

/// A connected DevHub as reported by `sf org list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevHub {
    pub alias: Option<String>,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub is_default: bool,
}

/// Scratch-org limits for one DevHub.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct OrgLimits {
    pub daily_max: u64,
    pub daily_remaining: u64,
    pub active_max: u64,
    pub active_remaining: u64,
}

/// Capacity verdict for a planned run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacityReport {
    pub required: u64,
    pub daily_remaining: u64,
    pub active_remaining: u64,
    pub sufficient: bool,
    pub hubs: Vec<(String, OrgLimits)>,
}

/// List connected DevHubs from the CLI org registry.
pub async fn get_connected_devhubs() -> Vec<DevHub> {
    let Ok(out) = run_command("sf org list", None, 30, true).await else {
        return Vec::new();
    };
    let Ok(data) = parse_json_output(&out.stdout) else {
        return Vec::new();
    };

    let Some(result) = data.get("result") else {
        return Vec::new();
    };

    let mut hubs = Vec::new();
    let sections = ["devHubs", "nonScratchOrgs"];
    for section in sections {
        let Some(orgs) = result.get(section).and_then(|v| v.as_array()) else {
            continue;
        };
        for org in orgs {
            // nonScratchOrgs includes regular orgs; only hubs qualify.
            if section == "nonScratchOrgs"
                && !org.get("isDevHub").and_then(|v| v.as_bool()).unwrap_or(false)
            {
                continue;
            }
            let status = org
                .get("connectedStatus")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let has_token = org.get("accessToken").is_some();
            if !(status.contains("Connected") || status == "Active" || has_token) {
                continue;
            }
            let Some(username) = org.get("username").and_then(|v| v.as_str()) else {
                continue;
            };
            if hubs.iter().any(|h: &DevHub| h.username == username) {
                continue;
            }
            hubs.push(DevHub {
                alias: org.get("alias").and_then(|v| v.as_str()).map(String::from),
                username: username.to_string(),
                org_id: org.get("orgId").and_then(|v| v.as_str()).map(String::from),
                is_default: org
                    .get("isDefaultDevHubUsername")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            });
        }
    }

    hubs
}

/// Query scratch-org limits for one DevHub.
pub async fn get_devhub_limits(target: &str) -> OrgLimits {
    let command = format!("sf org list limits --target-org {target}");
    let Ok(out) = run_command(&command, None, 30, true).await else {
        return OrgLimits::default();
    };
    let Ok(data) = parse_json_output(&out.stdout) else {
        return OrgLimits::default();
    };

    parse_limits(&data)
}

fn parse_limits(data: &serde_json::Value) -> OrgLimits {
    let mut limits = OrgLimits::default();
    let Some(items) = data.get("result").and_then(|v| v.as_array()) else {
        return limits;
    };

    for item in items {
        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let max = item.get("max").and_then(|v| v.as_u64()).unwrap_or(0);
        let remaining = item.get("remaining").and_then(|v| v.as_u64()).unwrap_or(0);
        match name {
            "DailyScratchOrgs" => {
                limits.daily_max = max;
                limits.daily_remaining = remaining;
            }
            "ActiveScratchOrgs" => {
                limits.active_max = max;
                limits.active_remaining = remaining;
            }
            _ => {}
        }
    }

    limits
}

/// Select the DevHub with the most remaining daily capacity. Falls back
/// to the default hub, then the first connected one.
pub async fn select_best_devhub() -> Option<String> {
    let hubs = get_connected_devhubs().await;
    if hubs.is_empty() {
        return None;
    }

    let mut best: Option<(&DevHub, u64)> = None;
    for hub in &hubs {
        let limits = get_devhub_limits(&hub.username).await;
        debug!(hub = %hub.username, ?limits, "devhub limits");
        if best.map(|(_, r)| limits.daily_remaining > r).unwrap_or(true) {
            best = Some((hub, limits.daily_remaining));
        }
    }

    let chosen = best
        .map(|(h, _)| h)
        .or_else(|| hubs.iter().find(|h| h.is_default))
        .or_else(|| hubs.first());
    chosen.map(|h| h.alias.clone().unwrap_or_else(|| h.username.clone()))
}

/// Sum remaining capacity over all hubs and compare against the number of
/// orgs the run will need.
pub async fn check_capacity(required: u64) -> CapacityReport {
    let hubs = get_connected_devhubs().await;
    let mut daily_remaining = 0;
    let mut active_remaining = 0;
    let mut hub_limits = Vec::new();

    for hub in &hubs {
        let limits = get_devhub_limits(&hub.username).await;
        daily_remaining += limits.daily_remaining;
        active_remaining += limits.active_remaining;
        hub_limits.push((hub.username.clone(), limits));
    }

    let sufficient = daily_remaining >= required;
    if !sufficient {
        warn!(
            required,
            daily_remaining, "insufficient scratch-org capacity for this run"
        );
    }

    CapacityReport {
        required,
        daily_remaining,
        active_remaining,
        sufficient,
        hubs: hub_limits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limits() {
        let data = serde_json::json!({
            "status": 0,
            "result": [
                {"name": "DailyScratchOrgs", "max": 80, "remaining": 74},
                {"name": "ActiveScratchOrgs", "max": 40, "remaining": 38},
                {"name": "DataStorageMB", "max": 200, "remaining": 199}
            ]
        });
        let limits = parse_limits(&data);
        assert_eq!(limits.daily_max, 80);
        assert_eq!(limits.daily_remaining, 74);
        assert_eq!(limits.active_max, 40);
        assert_eq!(limits.active_remaining, 38);
    }

    #[test]
    fn test_parse_limits_missing_result() {
        let limits = parse_limits(&serde_json::json!({"status": 1}));
        assert_eq!(limits, OrgLimits::default());
    }
}
