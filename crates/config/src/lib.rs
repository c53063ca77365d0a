//! Configuration loading, validation, and management for TaskLoop.
//!
//! Loads configuration from `~/.taskloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! Every setting has a documented default; a missing file yields
//! [`AppConfig::default()`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.taskloop/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Task execution settings
    #[serde(default)]
    pub task: TaskConfig,

    /// Log output settings (used by the CLI)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What happens when a turn requests no tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoToolsPolicy {
    /// Raise the retryable `no_tools_used` error; consumes retry budget.
    #[default]
    Retry,
    /// Push a corrective turn without consuming retry budget; only the
    /// mistake limit bounds repetition.
    MistakesOnly,
}

/// Settings for a single task loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Deadline for acquiring a turn stream, in milliseconds. Default: 60000.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries allowed per retry chain before giving up. Default: 3.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Consecutive turns without tool use before the task aborts. Default: 3.
    #[serde(default = "default_mistake_limit")]
    pub mistake_limit: u32,

    /// Tool whose use marks a completion attempt. Default: "attempt_completion".
    #[serde(default = "default_completion_tool")]
    pub completion_tool: String,

    /// Name prefixes of dynamically provided tools. Default: ["mcp__"].
    #[serde(default = "default_dynamic_tool_prefixes")]
    pub dynamic_tool_prefixes: Vec<String>,

    /// Handling of zero-tool turns. Default: retry.
    #[serde(default)]
    pub no_tools_policy: NoToolsPolicy,

    /// Base system prompt; workspace fragments are appended. Default: short generic prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_mistake_limit() -> u32 {
    3
}
fn default_completion_tool() -> String {
    "attempt_completion".into()
}
fn default_dynamic_tool_prefixes() -> Vec<String> {
    vec!["mcp__".into()]
}
fn default_system_prompt() -> String {
    "You are a capable assistant. Accomplish the task by calling one tool per step. \
     When the task is done, call attempt_completion with the result."
        .into()
}

impl TaskConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "task.request_timeout_ms must be > 0".into(),
            ));
        }
        if self.mistake_limit == 0 {
            return Err(ConfigError::ValidationError(
                "task.mistake_limit must be >= 1".into(),
            ));
        }
        if self.completion_tool.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "task.completion_tool must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            mistake_limit: default_mistake_limit(),
            completion_tool: default_completion_tool(),
            dynamic_tool_prefixes: default_dynamic_tool_prefixes(),
            no_tools_policy: NoToolsPolicy::default(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset. Default: "info".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output. Default: false.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.taskloop/config.toml).
    ///
    /// Environment variables override file values:
    /// - `TASKLOOP_REQUEST_TIMEOUT_MS`
    /// - `TASKLOOP_MAX_RETRY_ATTEMPTS`
    /// - `TASKLOOP_MISTAKE_LIMIT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
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
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("TASKLOOP_REQUEST_TIMEOUT_MS") {
            self.task.request_timeout_ms = parse_env("TASKLOOP_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("TASKLOOP_MAX_RETRY_ATTEMPTS") {
            self.task.max_retry_attempts = parse_env("TASKLOOP_MAX_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("TASKLOOP_MISTAKE_LIMIT") {
            self.task.mistake_limit = parse_env("TASKLOOP_MISTAKE_LIMIT", &v)?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".taskloop")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.task.validate()
    }

    /// Generate a default config TOML string (for `config --init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::EnvError {
        var: var.to_string(),
        reason: e.to_string(),
    })
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

    #[error("Invalid value in {var}: {reason}")]
    EnvError { var: String, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
