//! Gateway configuration, loaded from a JSON file at startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BackendKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_listen() -> String {
    "127.0.0.1:8484".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub backend_type: BackendKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_provider_priority")]
    pub priority: i64,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_1k: Option<CostPer1k>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_s: Option<u64>,

    // http_api backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<String>,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,

    // cli backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub prompt_on_stdin: bool,
    #[serde(default)]
    pub auth_indicators: Vec<String>,

    // terminal backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_marker: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("backend_type", &self.backend_type)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("timeout_s", &self.timeout_s)
            .field("model", &self.model)
            .field("concurrency", &self.concurrency)
            .field("fallback_chain", &self.fallback_chain)
            .field("api_base_url", &self.api_base_url)
            .field("api_key_env", &self.api_key_env)
            .field("dialect", &self.dialect)
            .field("extra_headers", &"<redacted>")
            .field("command", &self.command)
            .field("env", &"<redacted>")
            .field("pane_id", &self.pane_id)
            .finish()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_provider_priority() -> i64 {
    50
}

fn default_timeout_s() -> u64 {
    300
}

fn default_concurrency() -> usize {
    2
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CostPer1k {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_retry_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_retry_enabled(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_s")]
    pub default_ttl_s: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl_s() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    1024
}

fn default_cache_max_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            default_ttl_s: default_cache_ttl_s(),
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rpm")]
    pub default_rpm: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_global_rpm")]
    pub global_rpm: u32,
}

fn default_rpm() -> u32 {
    60
}

fn default_burst() -> u32 {
    10
}

fn default_global_rpm() -> u32 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rpm: default_rpm(),
            burst: default_burst(),
            global_rpm: default_global_rpm(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_s")]
    pub interval_s: u64,
    #[serde(default = "default_health_window")]
    pub window: usize,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    #[serde(default = "default_down_after_failures")]
    pub down_after_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_budget_ms: Option<u64>,
}

fn default_health_interval_s() -> u64 {
    60
}

fn default_health_window() -> usize {
    10
}

fn default_success_threshold() -> f64 {
    0.7
}

fn default_down_after_failures() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_s: default_health_interval_s(),
            window: default_health_window(),
            success_threshold: default_success_threshold(),
            down_after_failures: default_down_after_failures(),
            latency_budget_ms: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_skip_ahead")]
    pub skip_ahead: usize,
}

fn default_max_depth() -> usize {
    1000
}

fn default_skip_ahead() -> usize {
    8
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            skip_ahead: default_skip_ahead(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default = "default_request_ttl_hours")]
    pub request_ttl_hours: u64,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("switchyard.sqlite")
}

fn default_request_ttl_hours() -> u64 {
    24
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            request_ttl_hours: default_request_ttl_hours(),
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(invalid("provider with empty name"));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            provider.validate()?;
        }
        for provider in &self.providers {
            for fallback in &provider.fallback_chain {
                if fallback == &provider.name {
                    return Err(invalid(format!(
                        "provider {} lists itself as a fallback",
                        provider.name
                    )));
                }
                if !self.providers.iter().any(|p| &p.name == fallback) {
                    return Err(invalid(format!(
                        "provider {} falls back to unknown provider {fallback}",
                        provider.name
                    )));
                }
            }
        }
        if self.queue.max_depth == 0 {
            return Err(invalid("queue.max_depth must be at least 1"));
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.backend_type {
            BackendKind::HttpApi => {
                if self.api_base_url.is_none() {
                    return Err(invalid(format!(
                        "http provider {} is missing api_base_url",
                        self.name
                    )));
                }
                match self.dialect.as_deref() {
                    Some("anthropic") | Some("openai") | Some("gemini") => {}
                    Some(other) => {
                        return Err(invalid(format!(
                            "http provider {} has unknown dialect {other}",
                            self.name
                        )));
                    }
                    None => {
                        return Err(invalid(format!(
                            "http provider {} is missing a dialect",
                            self.name
                        )));
                    }
                }
            }
            BackendKind::Cli => {
                if self.command.is_none() {
                    return Err(invalid(format!(
                        "cli provider {} is missing a command",
                        self.name
                    )));
                }
            }
            BackendKind::Terminal => {
                if self.pane_id.is_none() {
                    return Err(invalid(format!(
                        "terminal provider {} is missing a pane_id",
                        self.name
                    )));
                }
                if self.completion_marker.is_none() {
                    return Err(invalid(format!(
                        "terminal provider {} is missing a completion_marker",
                        self.name
                    )));
                }
            }
        }
        if self.concurrency == 0 {
            return Err(invalid(format!(
                "provider {} has zero concurrency",
                self.name
            )));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}
