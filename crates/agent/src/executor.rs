//! Sequential tool execution.

use std::collections::BTreeMap;
use std::time::Instant;

use taskloop_core::error::{TaskError, TaskErrorKind};
use taskloop_core::message::ContentBlock;
use taskloop_core::tool::{ToolUseRequest, Workspace};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry;

/// Outcome of running one turn's tool requests.
#[derive(Debug, Clone, Default)]
pub struct ToolBatch {
    /// One `tool_result` block per executed request, in request order
    pub results: Vec<ContentBlock>,
    /// The batch contained the completion tool
    pub completion_attempt: bool,
    /// Output of the completion tool, when it ran
    pub completion_result: Option<String>,
    /// Cancellation stopped the batch before every request ran
    pub cancelled: bool,
}

/// Runs tool requests one at a time against a [`Workspace`] and keeps the
/// per-tool invocation counts for the task.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    completion_tool: String,
    usage: BTreeMap<String, u32>,
}

impl ToolExecutor {
    pub fn new(completion_tool: impl Into<String>) -> Self {
        Self {
            completion_tool: completion_tool.into(),
            usage: BTreeMap::new(),
        }
    }

    /// Invocations per tool name so far.
    pub fn usage(&self) -> &BTreeMap<String, u32> {
        &self.usage
    }

    /// Execute `requests` in order.
    ///
    /// Cancellation is checked before each request; a request already running
    /// is allowed to finish. Unknown tools and non-retryable dispatch errors
    /// end the batch with an error. Retryable dispatch errors are reported to
    /// the model as error results.
    pub async fn execute(
        &mut self,
        requests: &[ToolUseRequest],
        workspace: &dyn Workspace,
        cancel: &CancellationToken,
    ) -> Result<ToolBatch, TaskError> {
        let mut batch = ToolBatch {
            completion_attempt: requests.iter().any(|r| r.name == self.completion_tool),
            ..ToolBatch::default()
        };

        for (i, request) in requests.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(remaining = requests.len() - i, "Cancelled before tool batch finished");
                batch.cancelled = true;
                break;
            }
            if request.unknown {
                return Err(TaskError::tool_not_found(&request.name));
            }
            if request.partial {
                return Err(TaskError::new(
                    TaskErrorKind::MalformedToolCall,
                    format!("Tool call {} is still streaming", request.id),
                ));
            }

            *self.usage.entry(request.name.clone()).or_insert(0) += 1;
            let start = Instant::now();
            let (content, is_error) = match workspace.dispatch(&request.name, &request.params).await {
                Ok(output) => {
                    info!(
                        tool = %request.name,
                        success = output.success,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Tool executed"
                    );
                    (output.output, !output.success)
                }
                Err(e) => {
                    let classified = retry::classify_tool_error(&e);
                    if !classified.is_retryable() {
                        return Err(classified);
                    }
                    warn!(tool = %request.name, error = %e, "Tool execution failed");
                    (format!("Error: {e}"), true)
                }
            };

            if request.name == self.completion_tool && !is_error {
                batch.completion_result = Some(content.clone());
            }
            batch.results.push(ContentBlock::ToolResult {
                tool_use_id: request.id.clone(),
                content,
                is_error,
            });
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{MockWorkspace, request};
    use serde_json::json;
    use taskloop_core::error::ToolError;

    #[tokio::test]
    async fn runs_requests_in_order_and_counts_usage() {
        let workspace = MockWorkspace::new(&["read", "write"]);
        let mut executor = ToolExecutor::new("attempt_completion");
        let batch = executor
            .execute(
                &[
                    request("a", "read", json!({"p": 1})),
                    request("b", "write", json!({})),
                    request("c", "read", json!({"p": 2})),
                ],
                &workspace,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(batch.results.len(), 3);
        assert!(!batch.completion_attempt);
        assert_eq!(workspace.dispatched(), vec!["read", "write", "read"]);
        assert_eq!(executor.usage()["read"], 2);
        assert_eq!(executor.usage()["write"], 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_fatal_without_dispatch() {
        let workspace = MockWorkspace::new(&["read"]);
        let mut executor = ToolExecutor::new("attempt_completion");
        let mut unknown = request("a", "delete_all", json!({}));
        unknown.unknown = true;

        let err = executor
            .execute(&[unknown], &workspace, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::ToolNotFound);
        assert!(workspace.dispatched().is_empty());
    }

    #[tokio::test]
    async fn retryable_tool_failure_becomes_error_result() {
        let workspace = MockWorkspace::new(&["shell"]).failing(
            "shell",
            ToolError::ExecutionFailed {
                tool_name: "shell".into(),
                reason: "exit 1".into(),
            },
        );
        let mut executor = ToolExecutor::new("attempt_completion");
        let batch = executor
            .execute(&[request("a", "shell", json!({}))], &workspace, &CancellationToken::new())
            .await
            .unwrap();

        match &batch.results[0] {
            ContentBlock::ToolResult { is_error, content, .. } => {
                assert!(*is_error);
                assert!(content.contains("exit 1"));
            }
            other => panic!("Expected tool_result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_request() {
        let workspace = MockWorkspace::new(&["read"]);
        let mut executor = ToolExecutor::new("attempt_completion");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = executor
            .execute(&[request("a", "read", json!({}))], &workspace, &cancel)
            .await
            .unwrap();
        assert!(batch.cancelled);
        assert!(batch.results.is_empty());
    }

    #[tokio::test]
    async fn completion_tool_is_detected_and_run() {
        let workspace = MockWorkspace::new(&["attempt_completion"]);
        let mut executor = ToolExecutor::new("attempt_completion");
        let batch = executor
            .execute(
                &[request("a", "attempt_completion", json!({"result": "done"}))],
                &workspace,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(batch.completion_attempt);
        assert_eq!(batch.completion_result.as_deref(), Some("done"));
    }
}
