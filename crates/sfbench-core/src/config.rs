//! Centralized configuration with environment-variable overrides.
//!
//! Precedence per key: `SF_BENCH_<KEY>` environment variable (coerced to
//! the default's type), then the JSON config file, then the built-in
//! default. A `timeout_multiplier` scales every timeout uniformly.
//!
//! The process-wide instance behind [`get_config`] is one of the two
//! sanctioned globals (the other is the org-creation mutex in `org`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::warn;

/// Default timeout values (seconds).
pub const DEFAULT_TIMEOUT_SETUP: u64 = 600;
pub const DEFAULT_TIMEOUT_RUN: u64 = 300;
pub const DEFAULT_TIMEOUT_PATCH: u64 = 60;
pub const DEFAULT_TIMEOUT_GIT: u64 = 300;
pub const DEFAULT_TIMEOUT_API: u64 = 120;

/// Default retry settings.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_SECS: f64 = 2.0;

/// Default connection pool settings.
pub const DEFAULT_POOL_CONNECTIONS: usize = 10;
pub const DEFAULT_POOL_MAXSIZE: usize = 20;

/// Default worker pool size.
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Evaluation configuration record.
#[derive(Debug, Clone, Default)]
pub struct EvalConfig {
    file_data: HashMap<String, serde_json::Value>,
    config_file: Option<PathBuf>,
}

impl EvalConfig {
    /// Load configuration, optionally from a JSON config file.
    ///
    /// A missing or unreadable file is logged and ignored; defaults and
    /// environment overrides still apply.
    pub fn load(config_file: Option<&Path>) -> Self {
        let mut file_data = HashMap::new();

        if let Some(path) = config_file {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<HashMap<String, serde_json::Value>>(&raw) {
                    Ok(data) => file_data = data,
                    Err(e) => warn!(file = %path.display(), "failed to parse config file: {e}"),
                },
                Err(e) => warn!(file = %path.display(), "failed to read config file: {e}"),
            }
        }

        Self {
            file_data,
            config_file: config_file.map(Path::to_path_buf),
        }
    }

    /// Path the file data was loaded from, if any.
    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    fn env_var(key: &str) -> Option<String> {
        std::env::var(format!("SF_BENCH_{}", key.to_uppercase())).ok()
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        if let Some(raw) = Self::env_var(key) {
            match raw.parse::<u64>() {
                Ok(v) => return v,
                Err(_) => warn!("could not convert SF_BENCH_{}={raw} to integer, using default", key.to_uppercase()),
            }
        }
        self.file_data
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        if let Some(raw) = Self::env_var(key) {
            match raw.parse::<f64>() {
                Ok(v) => return v,
                Err(_) => warn!("could not convert SF_BENCH_{}={raw} to float, using default", key.to_uppercase()),
            }
        }
        self.file_data
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        if let Some(raw) = Self::env_var(key) {
            return matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
        }
        self.file_data
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    fn scaled_timeout(&self, key: &str, default: u64) -> u64 {
        let multiplier = self.get_f64("timeout_multiplier", 1.0);
        let base = self.get_u64(key, default);
        (base as f64 * multiplier) as u64
    }

    /// Timeout for the setup phase (scratch org creation, deployment).
    pub fn timeout_setup(&self) -> u64 {
        self.scaled_timeout("timeout_setup", DEFAULT_TIMEOUT_SETUP)
    }

    /// Timeout for the execution phase (test runs, validation).
    pub fn timeout_run(&self) -> u64 {
        self.scaled_timeout("timeout_run", DEFAULT_TIMEOUT_RUN)
    }

    /// Timeout for patch application.
    pub fn timeout_patch(&self) -> u64 {
        self.scaled_timeout("timeout_patch", DEFAULT_TIMEOUT_PATCH)
    }

    /// Timeout for git operations (clone, checkout).
    pub fn timeout_git(&self) -> u64 {
        self.scaled_timeout("timeout_git", DEFAULT_TIMEOUT_GIT)
    }

    /// Timeout for API calls (patch producer requests).
    pub fn timeout_api(&self) -> u64 {
        self.scaled_timeout("timeout_api", DEFAULT_TIMEOUT_API)
    }

    /// Maximum retry attempts for transient failures.
    pub fn max_retries(&self) -> u32 {
        self.get_u64("max_retries", DEFAULT_MAX_RETRIES as u64) as u32
    }

    /// Initial delay for exponential backoff, in seconds.
    pub fn initial_delay(&self) -> f64 {
        self.get_f64("initial_delay", DEFAULT_INITIAL_DELAY_SECS)
    }

    /// Number of connection pools for HTTP sessions.
    pub fn pool_connections(&self) -> usize {
        self.get_u64("pool_connections", DEFAULT_POOL_CONNECTIONS as u64) as usize
    }

    /// Maximum size of the HTTP connection pool.
    pub fn pool_maxsize(&self) -> usize {
        self.get_u64("pool_maxsize", DEFAULT_POOL_MAXSIZE as u64) as usize
    }

    /// Worker pool size for the scheduler.
    pub fn max_workers(&self) -> usize {
        self.get_u64("max_workers", DEFAULT_MAX_WORKERS as u64) as usize
    }

    /// Whether to run in deterministic mode (temperature 0, fixed seed).
    pub fn deterministic_mode(&self) -> bool {
        self.get_bool("deterministic", false)
    }

    /// Random seed for deterministic mode.
    pub fn random_seed(&self) -> Option<u64> {
        if let Some(raw) = Self::env_var("seed") {
            return raw.parse().ok();
        }
        self.file_data.get("seed").and_then(|v| v.as_u64())
    }

    /// Snapshot of the resolved knobs, for report provenance.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("timeout_setup".into(), self.timeout_setup().into());
        map.insert("timeout_run".into(), self.timeout_run().into());
        map.insert("timeout_patch".into(), self.timeout_patch().into());
        map.insert("timeout_git".into(), self.timeout_git().into());
        map.insert("timeout_api".into(), self.timeout_api().into());
        map.insert("max_retries".into(), self.max_retries().into());
        map.insert("initial_delay".into(), self.initial_delay().into());
        map.insert("max_workers".into(), self.max_workers().into());
        map.insert("pool_connections".into(), self.pool_connections().into());
        map.insert("pool_maxsize".into(), self.pool_maxsize().into());
        map.insert("deterministic".into(), self.deterministic_mode().into());
        if let Some(seed) = self.random_seed() {
            map.insert("seed".into(), seed.into());
        }
        map
    }
}

static GLOBAL_CONFIG: OnceLock<EvalConfig> = OnceLock::new();

/// Get the global configuration instance, loading defaults on first use.
pub fn get_config() -> &'static EvalConfig {
    GLOBAL_CONFIG.get_or_init(|| {
        let default_path = PathBuf::from(".sfbench_config.json");
        if default_path.exists() {
            EvalConfig::load(Some(&default_path))
        } else {
            EvalConfig::load(None)
        }
    })
}

/// Set the global configuration instance. Only the first call takes effect.
pub fn set_config(config: EvalConfig) -> bool {
    GLOBAL_CONFIG.set(config).is_ok()
}
