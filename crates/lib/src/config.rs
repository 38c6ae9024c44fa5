//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.wakechat/config.json`) and environment.
//! Every field has a default so an empty `{}` file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend location and endpoint paths.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Request timeout and retry/backoff bounds for ordinary requests.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Health-check staleness and wake-up retry bounds.
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Context window sent to the backend with each message.
    #[serde(default)]
    pub context: ContextConfig,

    /// Session persistence (TTL, autosave debounce, file location).
    #[serde(default)]
    pub session: SessionConfig,

    /// Optional product fields added to each chat request body.
    #[serde(default)]
    pub product: Option<ProductConfig>,

    /// Greeting and fallback texts shown to the user.
    #[serde(default)]
    pub messages: MessagesConfig,
}

/// Where the backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL (default "http://127.0.0.1:8000"). Overridden by WAKECHAT_BACKEND_URL env.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the chat endpoint (default "/chat").
    #[serde(default = "default_chat_path")]
    pub chat_path: String,

    /// Path of the health endpoint (default "/health").
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_chat_path() -> String {
    "/chat".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_path: default_chat_path(),
            health_path: default_health_path(),
            headers: BTreeMap::new(),
        }
    }
}

/// Bounded exponential backoff for ordinary requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// A single request is aborted after this long.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// After a successful health check the server is assumed warm for this long.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Retries used for the wake-up sequence (a cold start takes longer than a transient blip).
    #[serde(default = "default_wake_max_retries")]
    pub wake_max_retries: u32,
}

fn default_health_check_interval_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_wake_max_retries() -> u32 {
    5
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            wake_max_retries: default_wake_max_retries(),
        }
    }
}

impl ReadinessConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    /// Max messages in a sent window (CONTEXT_WINDOW_SIZE).
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Character budget for the window (MAX_CONTEXT_LENGTH).
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_window_size() -> usize {
    10
}

fn default_max_length() -> usize {
    8_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            max_length: default_max_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Sessions older than this are discarded on load (SESSION_EXPIRY_HOURS).
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: f64,
    /// Autosave fires this long after the last change.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Session file (default ~/.wakechat/session.json).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_expiry_hours() -> f64 {
    1.0
}

fn default_debounce_ms() -> u64 {
    2_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_hours: default_expiry_hours(),
            debounce_ms: default_debounce_ms(),
            path: None,
        }
    }
}

/// Product identification attached to chat requests by `ProductBodyBuilder`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductConfig {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Arbitrary JSON forwarded as the request's `context` field.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesConfig {
    /// Seed message shown at the top of every fresh conversation.
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_connectivity_fallback")]
    pub connectivity_fallback: String,
    #[serde(default = "default_starting_fallback")]
    pub starting_fallback: String,
    #[serde(default = "default_generic_fallback")]
    pub generic_fallback: String,
    /// Shown when the backend answers but flags the request as failed.
    #[serde(default = "default_application_fallback")]
    pub application_fallback: String,
}

fn default_greeting() -> String {
    "Hi! How can I help you today?".to_string()
}

fn default_connectivity_fallback() -> String {
    "I'm having trouble connecting right now. Please check your connection and try again."
        .to_string()
}

fn default_starting_fallback() -> String {
    "The assistant service is starting up. Please try again in a few moments.".to_string()
}

fn default_generic_fallback() -> String {
    "I'm experiencing some technical difficulties. Please try again later.".to_string()
}

fn default_application_fallback() -> String {
    "I couldn't find an answer to that. Please try rephrasing your question.".to_string()
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
            connectivity_fallback: default_connectivity_fallback(),
            starting_fallback: default_starting_fallback(),
            generic_fallback: default_generic_fallback(),
            application_fallback: default_application_fallback(),
        }
    }
}

/// Resolve the backend base URL: env WAKECHAT_BACKEND_URL overrides config.
pub fn resolve_backend_url(config: &Config) -> String {
    std::env::var("WAKECHAT_BACKEND_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.backend.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WAKECHAT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".wakechat").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Session file: `session.path` if set (relative paths resolved against the config file's parent),
/// otherwise `session.json` next to the config file.
pub fn resolve_session_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.session.path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("session.json"),
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
