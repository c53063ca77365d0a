//! Error types for the TaskLoop domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Collaborators raise
//! bounded-context errors ([`BackendError`], [`ToolError`]); the agent's
//! classifier folds everything into the closed [`TaskError`] taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all TaskLoop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Backend errors ---
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Already-classified task errors ---
    #[error("{0}")]
    Task(#[from] TaskError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by backend, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name} — {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

// --- Task taxonomy ---

/// The closed set of failure categories a task can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Acquiring the turn stream took longer than the configured timeout.
    RequestTimeout,
    /// Transport or API failure while talking to the backend.
    RequestFailed,
    /// The backend closed the stream without producing anything.
    NoResponse,
    /// The model answered without requesting any tool.
    NoToolsUsed,
    /// A tool ran and failed, or timed out.
    ToolExecutionFailed,
    /// Streamed tool-call arguments did not form valid JSON.
    MalformedToolCall,
    /// The model asked for a tool nobody registered.
    ToolNotFound,
    /// Too many consecutive turns without tool use.
    MistakeLimitReached,
    /// The retry budget ran out; carries the whole chain.
    MaxRetriesExceeded,
}

impl TaskErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RequestTimeout => "request_timeout",
            Self::RequestFailed => "request_failed",
            Self::NoResponse => "no_response",
            Self::NoToolsUsed => "no_tools_used",
            Self::ToolExecutionFailed => "tool_execution_failed",
            Self::MalformedToolCall => "malformed_tool_call",
            Self::ToolNotFound => "tool_not_found",
            Self::MistakeLimitReached => "mistake_limit_reached",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout
                | Self::RequestFailed
                | Self::NoResponse
                | Self::NoToolsUsed
                | Self::ToolExecutionFailed
                | Self::MalformedToolCall
        )
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified task failure.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{}] {}", .kind.code(), .message)]
pub struct TaskError {
    pub kind: TaskErrorKind,

    /// Human-readable description
    pub message: String,

    /// Rendered underlying failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,

    /// Prior errors of the retry chain (only for `MaxRetriesExceeded`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<TaskError>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            history: Vec::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn no_tools_used() -> Self {
        Self::new(
            TaskErrorKind::NoToolsUsed,
            "The response did not request any tool",
        )
    }

    pub fn tool_not_found(name: &str) -> Self {
        Self::new(
            TaskErrorKind::ToolNotFound,
            format!("Tool '{name}' is not registered"),
        )
    }

    pub fn mistake_limit(limit: u32) -> Self {
        Self::new(
            TaskErrorKind::MistakeLimitReached,
            format!("{limit} consecutive turns without tool use"),
        )
    }

    /// Terminal error bundling every failure of the exhausted retry chain.
    pub fn max_retries_exceeded(history: Vec<TaskError>) -> Self {
        let mut err = Self::new(
            TaskErrorKind::MaxRetriesExceeded,
            format!("Gave up after {} failed attempts", history.len()),
        );
        err.cause = history.last().map(|e| e.to_string());
        err.history = history;
        err
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
