//! Configuration loading, validation, and management for chatloop.
//!
//! Loads configuration from `~/.chatloop/config.toml` with environment
//! variable overrides, validates it, and turns it into the immutable
//! [`ExchangeSettings`] bundle handed to the orchestrator at the start of
//! every exchange.

use chatloop_core::tool::ToolOverrides;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Response tokens reserved when the persona does not set one.
pub const DEFAULT_MAX_RESPONSE_TOKENS: u32 = 4096;

/// Tool-loop attempts when the config does not set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;

/// The root configuration structure.
///
/// Maps directly to `~/.chatloop/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the completion endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Model ID sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// Context window of the model, in tokens
    #[serde(default = "default_context_length")]
    pub context_length: u32,

    /// Persona: system prompt, sampling, tool overrides
    #[serde(default)]
    pub persona: PersonaConfig,

    /// Tool-loop limits
    #[serde(default)]
    pub tool_loop: ToolLoopConfig,

    /// Reasoning markers
    #[serde(default)]
    pub reasoning: ReasoningConfig,
}

fn default_api_url() -> String {
    "http://127.0.0.1:1337/v1".into()
}
fn default_model() -> String {
    "default".into()
}
fn default_context_length() -> u32 {
    8192
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
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("context_length", &self.context_length)
            .field("persona", &self.persona)
            .field("tool_loop", &self.tool_loop)
            .field("reasoning", &self.reasoning)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default)]
    pub system_prompt: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Explicit response-token reservation; `None` uses the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_tokens: Option<u32>,

    /// `tool_name = true | false`; absent tools use their own default
    #[serde(default, skip_serializing_if = "ToolOverrides::is_empty")]
    pub tools: ToolOverrides,
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            temperature: default_temperature(),
            max_response_tokens: None,
            tools: ToolOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_open_marker")]
    pub open_marker: String,

    #[serde(default = "default_close_marker")]
    pub close_marker: String,
}

fn default_open_marker() -> String {
    "<think>".into()
}
fn default_close_marker() -> String {
    "</think>".into()
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            open_marker: default_open_marker(),
            close_marker: default_close_marker(),
        }
    }
}

/// Everything one exchange needs, frozen at exchange start.
///
/// Built from [`AppConfig`] so concurrent config edits never change the
/// behavior of an exchange already in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSettings {
    pub model: String,
    /// Already trimmed; empty means no system message
    pub system_prompt: String,
    pub temperature: f32,
    pub max_response_tokens: u32,
    pub context_length: u32,
    pub tool_overrides: ToolOverrides,
    /// Always at least 1
    pub max_attempts: u32,
    pub open_marker: String,
    pub close_marker: String,
}

impl ExchangeSettings {
    /// Override the attempt cap, keeping the floor of 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        AppConfig::default().exchange_settings()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.chatloop/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `CHATLOOP_API_KEY`, falling back to `OPENAI_API_KEY`
    /// - `CHATLOOP_API_URL`
    /// - `CHATLOOP_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
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

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("CHATLOOP_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup("CHATLOOP_API_URL") {
            self.api_url = url;
        }
        if let Some(model) = lookup("CHATLOOP_MODEL") {
            self.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".chatloop")
    }

    /// Get the configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.persona.temperature) {
            return Err(ConfigError::ValidationError(
                "persona.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.context_length == 0 {
            return Err(ConfigError::ValidationError(
                "context_length must be > 0".into(),
            ));
        }

        if self.persona.max_response_tokens == Some(0) {
            return Err(ConfigError::ValidationError(
                "persona.max_response_tokens must be > 0 when set".into(),
            ));
        }

        let open = &self.reasoning.open_marker;
        let close = &self.reasoning.close_marker;
        if open.is_empty() || close.is_empty() {
            return Err(ConfigError::ValidationError(
                "reasoning markers must not be empty".into(),
            ));
        }
        if open.eq_ignore_ascii_case(close) {
            return Err(ConfigError::ValidationError(
                "reasoning open and close markers must differ".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Freeze the settings for one exchange.
    pub fn exchange_settings(&self) -> ExchangeSettings {
        ExchangeSettings {
            model: self.model.clone(),
            system_prompt: self.persona.system_prompt.trim().to_string(),
            temperature: self.persona.temperature,
            max_response_tokens: self
                .persona
                .max_response_tokens
                .unwrap_or(DEFAULT_MAX_RESPONSE_TOKENS),
            context_length: self.context_length,
            tool_overrides: self.persona.tools.clone(),
            max_attempts: self.tool_loop.max_attempts.max(1),
            open_marker: self.reasoning.open_marker.clone(),
            close_marker: self.reasoning.close_marker.clone(),
        }
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
            api_url: default_api_url(),
            model: default_model(),
            context_length: default_context_length(),
            persona: PersonaConfig::default(),
            tool_loop: ToolLoopConfig::default(),
            reasoning: ReasoningConfig::default(),
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

impl From<ConfigError> for chatloop_core::Error {
    fn from(err: ConfigError) -> Self {
        chatloop_core::Error::Config {
            message: err.to_string(),
        }
    }
}
