//! Configuration loading, validation, and management for MentorLink.
//!
//! Loads configuration from `~/.mentorlink/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.mentorlink/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Prompt assembly settings
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Context retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Model invocation (retry, timeout) settings
    #[serde(default)]
    pub invoker: InvokerConfig,

    /// Session store settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-3.5-turbo".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("prompt", &self.prompt)
            .field("retrieval", &self.retrieval)
            .field("invoker", &self.invoker)
            .field("session", &self.session)
            .field("gateway", &self.gateway)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Ceiling on the assembled prompt, in estimated tokens
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,

    /// System instructions placed at the head of every prompt
    #[serde(default = "default_system_instructions")]
    pub system_instructions: String,

    /// Longest accepted query, in characters
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

fn default_budget_tokens() -> usize {
    4096
}
fn default_system_instructions() -> String {
    "You are a patient, knowledgeable tutor. Answer the learner's question clearly and accurately. \
     When reference material is provided, ground your answer in it and cite the sources you used."
        .into()
}
fn default_max_query_chars() -> usize {
    8000
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget_tokens(),
            system_instructions: default_system_instructions(),
            max_query_chars: default_max_query_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// "keyword", "remote", or "none"
    #[serde(default = "default_retrieval_backend")]
    pub backend: String,

    /// Base URL of the remote index (backend = "remote")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Directory of .md/.txt documents to index (backend = "keyword")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents_dir: Option<String>,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub min_score: f32,

    /// Fail the request instead of degrading when the index is unreachable
    #[serde(default)]
    pub required: bool,

    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_retrieval_backend() -> String {
    "keyword".into()
}
fn default_top_k() -> usize {
    5
}
fn default_retrieval_timeout_ms() -> u64 {
    2000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: default_retrieval_backend(),
            url: None,
            documents_dir: None,
            top_k: default_top_k(),
            min_score: 0.0,
            required: false,
            timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Total attempts per invocation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Deadline for a single attempt (whole response, or first chunk when streaming)
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_attempt_timeout_secs() -> u64 {
    60
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// "memory" or "sqlite"
    #[serde(default = "default_session_backend")]
    pub backend: String,

    /// Database path (backend = "sqlite"); defaults to ~/.mentorlink/sessions.db
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Upper bound on sessions held by the in-memory store
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Turns kept per session after each commit (0 = unbounded)
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

fn default_session_backend() -> String {
    "memory".into()
}
fn default_max_sessions() -> usize {
    1000
}
fn default_max_history_turns() -> usize {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_session_backend(),
            path: None,
            max_sessions: default_max_sessions(),
            max_history_turns: default_max_history_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Overall deadline for one request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_request_timeout_secs() -> u64 {
    180
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.mentorlink/config.toml).
    ///
    /// Also checks environment variables:
    /// - `MENTORLINK_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `MENTORLINK_PROVIDER`, `MENTORLINK_MODEL`, `MENTORLINK_PORT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through a lookup function.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if self.api_key.is_none() {
            self.api_key = lookup("MENTORLINK_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }

        if let Some(provider) = lookup("MENTORLINK_PROVIDER") {
            self.default_provider = provider;
        }

        if let Some(model) = lookup("MENTORLINK_MODEL") {
            self.default_model = model;
        }

        if let Some(port) = lookup("MENTORLINK_PORT") {
            self.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("MENTORLINK_PORT is not a valid port: {port}"))
            })?;
        }

        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".mentorlink")
    }

    /// Resolved SQLite path for the session store.
    pub fn session_db_path(&self) -> PathBuf {
        self.session
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("sessions.db"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.prompt.budget_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "prompt.budget_tokens must be > 0".into(),
            ));
        }

        if self.invoker.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "invoker.max_attempts must be at least 1".into(),
            ));
        }

        if self.invoker.initial_backoff_ms > self.invoker.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "invoker.initial_backoff_ms must not exceed invoker.max_backoff_ms".into(),
            ));
        }

        if !matches!(self.retrieval.backend.as_str(), "keyword" | "remote" | "none") {
            return Err(ConfigError::ValidationError(format!(
                "Unknown retrieval backend: {}",
                self.retrieval.backend
            )));
        }

        if self.retrieval.backend == "remote" && self.retrieval.url.is_none() {
            return Err(ConfigError::ValidationError(
                "retrieval.url is required when retrieval.backend = \"remote\"".into(),
            ));
        }

        if !matches!(self.session.backend.as_str(), "memory" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "Unknown session backend: {}",
                self.session.backend
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            prompt: PromptConfig::default(),
            retrieval: RetrievalConfig::default(),
            invoker: InvokerConfig::default(),
            session: SessionConfig::default(),
            gateway: GatewayConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
