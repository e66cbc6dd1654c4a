//! Patch-producer adapters: the opaque interface through which the core
//! can request a solution diff for a task.
//!
//! The core consumes already-generated patches whenever possible; this
//! module exists for integrated runs where the producer is an HTTP model
//! provider. API keys are discovered from the environment, never logged,
//! and never appear in failure messages. Calls are serialized through a
//! per-agent rate limiter and ride a pooled, retrying HTTP client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::get_config;
use crate::domain::error::{Result, SfBenchError};

/// Default per-agent call budget: 60 calls per minute.
pub const DEFAULT_CALLS_PER_MINUTE: u32 = 60;

/// HTTP statuses retried with backoff.
const RETRYABLE_STATUS: &[u16] = &[429, 500, 502, 503, 504];

/// Generates a unified diff for a task. Implementations are opaque to the
/// evaluation core.
#[async_trait]
pub trait PatchProducer: Send + Sync {
    /// Produce a diff for the given problem. `context` carries optional
    /// repository metadata the producer may use.
    async fn generate(
        &self,
        task_description: &str,
        context: Option<&serde_json::Value>,
    ) -> Result<String>;

    /// Model identity recorded in reports and audits.
    fn model_name(&self) -> &str;
}

/// Enforces a minimum interval between calls for one agent.
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(calls_per_minute: u32) -> Self {
        let calls = calls_per_minute.max(1);
        Self {
            min_interval: Duration::from_secs_f64(60.0 / calls as f64),
            last_call: Mutex::new(None),
        }
    }

    /// Sleep just long enough to honor the per-minute budget.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Discover the API key for a provider from the ambient environment.
///
/// Specific names first (`OPENROUTER_API_KEY`, `ROUTELLM_API_KEY`,
/// `GOOGLE_API_KEY`/`GEMINI_API_KEY`), then the generic
/// `{PROVIDER}_API_KEY`. Local providers need no key.
pub fn resolve_api_key(provider: &str) -> Option<String> {
    match provider.to_lowercase().as_str() {
        "gemini" | "google" => std::env::var("GOOGLE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .ok(),
        "openrouter" => std::env::var("OPENROUTER_API_KEY").ok(),
        "routellm" => std::env::var("ROUTELLM_API_KEY").ok(),
        "ollama" | "local" => None,
        other => std::env::var(format!("{}_API_KEY", other.to_uppercase())).ok(),
    }
}

/// Patch producer backed by an OpenAI-compatible chat-completions API
/// (OpenAI, OpenRouter, RouteLLM, self-hosted gateways).
pub struct HttpPatchProducer {
    provider: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpPatchProducer {
    /// Build a producer with a pooled client. Pool sizes and the API
    /// timeout come from configuration.
    pub fn new(provider: &str, model: &str, base_url: Option<&str>) -> Result<Self> {
        let config = get_config();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_api()))
            .pool_max_idle_per_host(config.pool_connections())
            .build()
            .map_err(|e| SfBenchError::PatchProducer(format!("failed to build client: {e}")))?;

        let base_url = base_url
            .map(String::from)
            .unwrap_or_else(|| default_base_url(provider));

        Ok(Self {
            provider: provider.to_lowercase(),
            model: model.to_string(),
            api_key: resolve_api_key(provider),
            base_url,
            client,
            limiter: RateLimiter::new(DEFAULT_CALLS_PER_MINUTE),
        })
    }

    fn system_prompt() -> &'static str {
        "You are an expert Salesforce engineer. Respond with a single unified \
         diff (git format) that solves the task. Output only the diff, with no \
         explanation and no markdown fences."
    }

    fn build_prompt(task_description: &str, context: Option<&serde_json::Value>) -> String {
        match context {
            Some(ctx) => format!("{task_description}\n\nRepository context:\n{ctx}"),
            None => task_description.to_string(),
        }
    }

    async fn post_chat(&self, prompt: &str) -> Result<String> {
        let key = self.api_key.as_deref().ok_or_else(|| {
            SfBenchError::PatchProducer(format!(
                "no API key configured for provider '{}'",
                self.provider
            ))
        })?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": Self::system_prompt()},
                {"role": "user", "content": prompt},
            ],
            "temperature": if get_config().deterministic_mode() { 0.0 } else { 0.2 },
        });

        let max_retries = get_config().max_retries();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if RETRYABLE_STATUS.contains(&status) && attempt < max_retries {
                        let delay = get_config().initial_delay() * 2f64.powi(attempt as i32 - 1);
                        warn!(
                            provider = %self.provider,
                            status,
                            attempt,
                            "provider returned retryable status; backing off {delay:.1}s"
                        );
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                        continue;
                    }
                    if !resp.status().is_success() {
                        return Err(SfBenchError::PatchProducer(format!(
                            "provider '{}' returned HTTP {status}",
                            self.provider
                        )));
                    }

                    let data: serde_json::Value = resp.json().await.map_err(|e| {
                        SfBenchError::PatchProducer(format!("invalid provider response: {e}"))
                    })?;
                    let content = data
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("message"))
                        .and_then(|m| m.get("content"))
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            SfBenchError::PatchProducer("provider response had no content".into())
                        })?;
                    return Ok(content.to_string());
                }
                Err(e) if attempt < max_retries => {
                    let delay = get_config().initial_delay() * 2f64.powi(attempt as i32 - 1);
                    warn!(
                        provider = %self.provider,
                        attempt,
                        "provider request failed: {e}; backing off {delay:.1}s"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                Err(e) => {
                    return Err(SfBenchError::PatchProducer(format!(
                        "provider request failed after {attempt} attempts: {e}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl PatchProducer for HttpPatchProducer {
    async fn generate(
        &self,
        task_description: &str,
        context: Option<&serde_json::Value>,
    ) -> Result<String> {
        let prompt = Self::build_prompt(task_description, context);
        debug!(provider = %self.provider, model = %self.model, "requesting solution");
        let raw = self.post_chat(&prompt).await?;
        Ok(clean_response(&raw))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn default_base_url(provider: &str) -> String {
    match provider.to_lowercase().as_str() {
        "openrouter" => "https://openrouter.ai/api/v1".to_string(),
        "routellm" => "https://api.routellm.dev/v1".to_string(),
        "ollama" | "local" => "http://localhost:11434/v1".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

/// Strip a markdown fence wrapper from a model response, keeping the
/// fenced body when one exists.
pub fn clean_response(response: &str) -> String {
    let trimmed = response.trim();
    if !trimmed.contains("```") {
        return trimmed.to_string();
    }

    let mut inside = false;
    let mut body: Vec<&str> = Vec::new();
    for line in trimmed.lines() {
        if line.trim_start().starts_with("```") {
            if inside {
                break;
            }
            inside = true;
            continue;
        }
        if inside {
            body.push(line);
        }
    }

    if body.is_empty() {
        trimmed.to_string()
    } else {
        body.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_api_key_generic_and_specific() {
        std::env::set_var("FROBNICATOR_API_KEY", "generic-key");
        assert_eq!(resolve_api_key("frobnicator").as_deref(), Some("generic-key"));
        std::env::remove_var("FROBNICATOR_API_KEY");

        std::env::set_var("GEMINI_API_KEY", "gem");
        std::env::remove_var("GOOGLE_API_KEY");
        assert_eq!(resolve_api_key("gemini").as_deref(), Some("gem"));
        std::env::remove_var("GEMINI_API_KEY");

        assert_eq!(resolve_api_key("ollama"), None);
    }

    #[test]
    fn test_clean_response_strips_fences() {
        let fenced = "Here you go:\n```diff\ndiff --git a/x b/x\n+new\n```\nHope it helps!";
        let cleaned = clean_response(fenced);
        assert_eq!(cleaned, "diff --git a/x b/x\n+new");

        let bare = "diff --git a/x b/x\n+new\n";
        assert_eq!(clean_response(bare), "diff --git a/x b/x\n+new");
    }

    #[tokio::test]
    async fn test_rate_limiter_enforces_interval() {
        // 600 calls/minute => 100ms minimum interval.
        let limiter = RateLimiter::new(600);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_first_acquire_does_not_wait() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_default_base_urls() {
        assert!(default_base_url("openrouter").contains("openrouter.ai"));
        assert!(default_base_url("openai").contains("api.openai.com"));
        assert!(default_base_url("local").contains("localhost"));
    }
}
