//! Error classification and the retry budget.
//!
//! Every failure inside a turn is folded into the closed [`TaskError`]
//! taxonomy. Retryable errors consume one unit of the budget and produce a
//! corrective message for the next attempt. The budget spans the whole task:
//! a successful turn does not refund it. Once it is spent every error the task
//! logged is bundled into a single `max_retries_exceeded` error.

use taskloop_core::error::{BackendError, Error, TaskError, TaskErrorKind, ToolError};

/// Map any engine error onto the task taxonomy.
pub fn classify(err: &Error) -> TaskError {
    match err {
        Error::Backend(e) => classify_backend_error(e),
        Error::Tool(e) => classify_tool_error(e),
        Error::Task(e) => e.clone(),
        Error::Serialization(e) => {
            TaskError::new(TaskErrorKind::MalformedToolCall, "Could not decode tool call").with_cause(e)
        }
        Error::Config { .. } | Error::Internal(_) => {
            TaskError::new(TaskErrorKind::RequestFailed, "Request could not be issued").with_cause(err)
        }
    }
}

pub fn classify_backend_error(err: &BackendError) -> TaskError {
    match err {
        BackendError::Timeout(_) => {
            TaskError::new(TaskErrorKind::RequestTimeout, "Backend request timed out").with_cause(err)
        }
        _ => TaskError::new(TaskErrorKind::RequestFailed, "Backend request failed").with_cause(err),
    }
}

pub fn classify_tool_error(err: &ToolError) -> TaskError {
    match err {
        ToolError::NotFound(name) => TaskError::tool_not_found(name),
        _ => TaskError::new(TaskErrorKind::ToolExecutionFailed, "Tool execution failed").with_cause(err),
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again; `attempt` counts budgeted failures so far in this task (1-based).
    Retry { attempt: u32, error: TaskError },
    /// Give up with this terminal error.
    Abort(TaskError),
}

/// Retry budget for one task.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    attempts: u32,
    log: Vec<TaskError>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            log: Vec::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.max_attempts = max_attempts;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and decide.
    ///
    /// `max_attempts` retries are allowed per task, so a permanently failing
    /// call is attempted `max_attempts + 1` times before the task gives up.
    pub fn record(&mut self, error: TaskError) -> RetryDecision {
        self.log.push(error.clone());
        if !error.is_retryable() {
            return RetryDecision::Abort(error);
        }
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            let log = std::mem::take(&mut self.log);
            return RetryDecision::Abort(TaskError::max_retries_exceeded(log));
        }
        RetryDecision::Retry {
            attempt: self.attempts,
            error,
        }
    }

    /// Log a failure that is retried outside the budget.
    pub fn note(&mut self, error: &TaskError) {
        self.log.push(error.clone());
    }
}

/// Text prepended to the retried content so the model can correct itself.
pub fn corrective_message(error: &TaskError, attempt: u32, max_attempts: u32) -> String {
    let hint = match error.kind {
        TaskErrorKind::NoToolsUsed => {
            "You did not use a tool in your previous response. Every response must call \
             at least one tool. If the task is finished, call the completion tool."
        }
        TaskErrorKind::MalformedToolCall => {
            "Your previous tool call had invalid arguments. Arguments must be a single \
             valid JSON object matching the tool's parameter schema."
        }
        TaskErrorKind::ToolExecutionFailed => {
            "The previous tool call failed. Check the arguments or try a different approach."
        }
        TaskErrorKind::RequestTimeout | TaskErrorKind::RequestFailed | TaskErrorKind::NoResponse => {
            "The previous request did not produce a usable response. Continue with the task."
        }
        _ => "The previous attempt failed.",
    };

    let mut text = format!(
        "[ERROR] {} (attempt {attempt} of {max_attempts})\n{hint}",
        error.message
    );
    if let Some(cause) = &error.cause {
        text.push_str(&format!("\nDetails: {cause}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_classify() {
        let timeout = classify(&Error::Backend(BackendError::Timeout("slow".into())));
        assert_eq!(timeout.kind, TaskErrorKind::RequestTimeout);

        let failed = classify(&Error::Backend(BackendError::RateLimited { retry_after_secs: 2 }));
        assert_eq!(failed.kind, TaskErrorKind::RequestFailed);
        assert!(failed.cause.unwrap().contains("retry after 2s"));
    }

    #[test]
    fn tool_errors_classify() {
        let missing = classify(&Error::Tool(ToolError::NotFound("x".into())));
        assert_eq!(missing.kind, TaskErrorKind::ToolNotFound);
        assert!(!missing.is_retryable());

        let failed = classify_tool_error(&ToolError::Timeout {
            tool_name: "shell".into(),
            timeout_secs: 30,
        });
        assert_eq!(failed.kind, TaskErrorKind::ToolExecutionFailed);
        assert!(failed.is_retryable());
    }

    #[test]
    fn classified_errors_pass_through() {
        let original = TaskError::no_tools_used();
        assert_eq!(classify(&Error::Task(original.clone())), original);
    }

    #[test]
    fn budget_allows_n_retries_then_bundles_log() {
        let mut policy = RetryPolicy::new(3);
        for expected in 1..=3 {
            match policy.record(TaskError::new(TaskErrorKind::RequestFailed, "boom")) {
                RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("Expected retry, got {other:?}"),
            }
        }
        match policy.record(TaskError::new(TaskErrorKind::RequestFailed, "boom")) {
            RetryDecision::Abort(err) => {
                assert_eq!(err.kind, TaskErrorKind::MaxRetriesExceeded);
                assert_eq!(err.history.len(), 4);
                assert!(err.cause.unwrap().contains("boom"));
            }
            other => panic!("Expected abort, got {other:?}"),
        }
    }

    #[test]
    fn non_retryable_aborts_immediately() {
        let mut policy = RetryPolicy::new(3);
        let decision = policy.record(TaskError::tool_not_found("x"));
        assert_eq!(decision, RetryDecision::Abort(TaskError::tool_not_found("x")));
    }

    #[test]
    fn budget_spans_the_whole_task() {
        let mut policy = RetryPolicy::new(2);
        policy.record(TaskError::no_tools_used());
        policy.note(&TaskError::no_tools_used());
        assert_eq!(policy.attempts(), 1);
        assert!(matches!(
            policy.record(TaskError::new(TaskErrorKind::NoResponse, "empty")),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        match policy.record(TaskError::no_tools_used()) {
            RetryDecision::Abort(err) => {
                assert_eq!(err.kind, TaskErrorKind::MaxRetriesExceeded);
                assert_eq!(err.history.len(), 4);
                assert_eq!(err.history[2].kind, TaskErrorKind::NoResponse);
            }
            other => panic!("Expected abort, got {other:?}"),
        }
    }

    #[test]
    fn zero_budget_aborts_on_first_failure() {
        let mut policy = RetryPolicy::new(0);
        match policy.record(TaskError::no_tools_used()) {
            RetryDecision::Abort(err) => assert_eq!(err.history.len(), 1),
            other => panic!("Expected abort, got {other:?}"),
        }
    }

    #[test]
    fn corrective_message_mentions_the_error() {
        let msg = corrective_message(&TaskError::no_tools_used(), 1, 3);
        assert!(msg.starts_with("[ERROR]"));
        assert!(msg.contains("attempt 1 of 3"));
        assert!(msg.contains("completion tool"));
    }
}
