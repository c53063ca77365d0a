//! The task loop.
//!
//! A task runs turns until the model calls the completion tool, the retry
//! budget is exhausted, or someone aborts it. Pending work lives on an
//! explicit stack of [`RetryStackEntry`] values rather than in recursion:
//! each successful turn pushes the tool results as the next user entry, and
//! each retryable failure pushes the same content again with a corrective
//! message in front.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use taskloop_config::{NoToolsPolicy, TaskConfig};
use taskloop_core::backend::{ModelBackend, ModelInfo, ToolChoice, ToolProtocol, TurnRequest};
use taskloop_core::error::{BackendError, Error, TaskError, TaskErrorKind};
use taskloop_core::event::{
    StatusChange, TaskAborted, TaskCompleted, TaskEvents, TaskStatus, ToolCallProgress,
};
use taskloop_core::message::{ContentBlock, Conversation, Message, Role, TaskId};
use taskloop_core::stream::{StreamEvent, TurnUsage};
use taskloop_core::tool::{ToolDefinition, Workspace};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::LivePreview;
use crate::executor::ToolExecutor;
use crate::response::{self, ResponseProcessor};
use crate::retry::{self, RetryDecision, RetryPolicy};

/// Observable state of one task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub history: Conversation,
    /// Turns in a row that ended without a tool call
    pub consecutive_mistakes: u32,
    /// Every classified error seen, across all retry chains
    pub errors: Vec<TaskError>,
    pub usage: TurnUsage,
    pub result: Option<String>,
    pub abort_reason: Option<String>,
}

impl Task {
    fn new(id: TaskId) -> Self {
        Self {
            history: Conversation::new(id.clone()),
            id,
            status: TaskStatus::Idle,
            consecutive_mistakes: 0,
            errors: Vec::new(),
            usage: TurnUsage::default(),
            result: None,
            abort_reason: None,
        }
    }
}

/// One pending unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStackEntry {
    pub sender: Role,
    pub content: Vec<ContentBlock>,
    /// Failures so far for this content; never decreases along a chain
    pub retry_attempt: u32,
    /// The failed attempt's user message was rolled back and must be re-sent
    pub user_message_removed: bool,
}

impl RetryStackEntry {
    pub fn new(sender: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            sender,
            content,
            retry_attempt: 0,
            user_message_removed: false,
        }
    }

    /// The content is already in the history and must not be appended again.
    pub fn is_pure_retry(&self) -> bool {
        self.retry_attempt > 0 && !self.user_message_removed
    }

    /// Content without the corrective message a retry put in front.
    fn original_content(&self) -> &[ContentBlock] {
        if self.retry_attempt > 0 && !self.content.is_empty() {
            &self.content[1..]
        } else {
            &self.content
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        result: Option<String>,
        usage: TurnUsage,
        tool_usage: BTreeMap<String, u32>,
    },
    Aborted {
        reason: String,
    },
}

/// Cloneable handle for aborting a running task from elsewhere.
///
/// The first reason given wins.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| "Aborted".to_string())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// The operations an observer wrapper needs to intercept.
#[async_trait]
pub trait TaskDriver: Send {
    fn task(&self) -> &Task;
    fn events(&self) -> &TaskEvents;
    fn config(&self) -> &TaskConfig;
    fn abort_handle(&self) -> AbortHandle;
    fn set_mistake_limit(&mut self, limit: u32);
    fn set_max_retry_attempts(&mut self, attempts: u32);
    fn set_request_timeout_ms(&mut self, timeout_ms: u64);

    /// Run the task to a terminal state.
    async fn execute(&mut self, content: Vec<ContentBlock>) -> Result<TaskOutcome, TaskError>;
}

enum TurnOutcome {
    /// Feed these tool results back as the next user entry
    Continue(Vec<ContentBlock>),
    /// The completion tool ran
    Completion(Option<String>),
    /// Abort was requested during the turn
    Cancelled,
}

/// Drives one task against a backend and a workspace.
pub struct TaskLoop {
    task: Task,
    backend: Arc<dyn ModelBackend>,
    workspace: Arc<dyn Workspace>,
    config: TaskConfig,
    events: TaskEvents,
    abort: AbortHandle,
    executor: ToolExecutor,
    /// Text-protocol calls parsed so far; keeps their ids unique in the history
    text_calls: usize,
}

impl TaskLoop {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        workspace: Arc<dyn Workspace>,
        config: TaskConfig,
    ) -> Self {
        Self {
            task: Task::new(TaskId::new()),
            executor: ToolExecutor::new(config.completion_tool.clone()),
            backend,
            workspace,
            config,
            events: TaskEvents::default(),
            abort: AbortHandle::new(),
            text_calls: 0,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.task = Task::new(id);
        self
    }

    pub fn with_events(mut self, events: TaskEvents) -> Self {
        self.events = events;
        self
    }

    /// Use an abort handle created before the loop.
    pub fn with_abort_handle(mut self, handle: AbortHandle) -> Self {
        self.abort = handle;
        self
    }

    pub fn history(&self) -> &Conversation {
        &self.task.history
    }

    pub fn tool_usage(&self) -> &BTreeMap<String, u32> {
        self.executor.usage()
    }

    fn outcome(&self) -> Option<TaskOutcome> {
        match self.task.status {
            TaskStatus::Completed => Some(TaskOutcome::Completed {
                result: self.task.result.clone(),
                usage: self.task.usage,
                tool_usage: self.executor.usage().clone(),
            }),
            TaskStatus::Aborted => Some(TaskOutcome::Aborted {
                reason: self
                    .task
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| "Aborted".to_string()),
            }),
            TaskStatus::Idle | TaskStatus::Running => None,
        }
    }

    async fn run(&mut self, content: Vec<ContentBlock>) -> Result<TaskOutcome, TaskError> {
        if let Some(outcome) = self.outcome() {
            debug!(task_id = %self.task.id, "Task already finished");
            return Ok(outcome);
        }
        self.transition(TaskStatus::Running);
        info!(task_id = %self.task.id, "Task started");

        let mut stack = vec![RetryStackEntry::new(Role::User, content)];
        let mut retries = RetryPolicy::new(self.config.max_retry_attempts);

        while let Some(entry) = stack.pop() {
            if self.abort.is_aborted() {
                return Ok(self.abort_from_handle());
            }
            retries.set_max_attempts(self.config.max_retry_attempts);

            let mark = self.task.history.len();
            match self.attempt_turn(&entry).await {
                Ok(TurnOutcome::Continue(results)) => {
                    stack.push(RetryStackEntry::new(Role::User, results));
                }
                Ok(TurnOutcome::Completion(result)) => {
                    self.task.result = result;
                }
                Ok(TurnOutcome::Cancelled) => {
                    return Ok(self.abort_from_handle());
                }
                Err(err) => {
                    let error = retry::classify(&err);
                    let removed = self.task.history.truncate(mark);
                    self.task.errors.push(error.clone());

                    let bypass_budget = error.kind == TaskErrorKind::NoToolsUsed
                        && self.config.no_tools_policy == NoToolsPolicy::MistakesOnly;
                    let (decision, budget) = if bypass_budget {
                        retries.note(&error);
                        let attempt = self.task.consecutive_mistakes;
                        (RetryDecision::Retry { attempt, error }, self.config.mistake_limit)
                    } else {
                        (retries.record(error), retries.max_attempts())
                    };

                    match decision {
                        RetryDecision::Retry { attempt, error } => {
                            warn!(
                                task_id = %self.task.id,
                                code = error.code(),
                                attempt,
                                max = budget,
                                "Turn failed, retrying: {error}"
                            );
                            let mut content = vec![ContentBlock::text(retry::corrective_message(
                                &error, attempt, budget,
                            ))];
                            content.extend(entry.original_content().iter().cloned());
                            stack.push(RetryStackEntry {
                                sender: entry.sender,
                                content,
                                retry_attempt: entry.retry_attempt + 1,
                                user_message_removed: removed > 0 || entry.user_message_removed,
                            });
                        }
                        RetryDecision::Abort(error) => {
                            warn!(task_id = %self.task.id, code = error.code(), "Task failed: {error}");
                            self.abort(error.to_string());
                            return Err(error);
                        }
                    }
                }
            }
        }

        self.complete();
        self.outcome()
            .ok_or_else(|| TaskError::new(TaskErrorKind::RequestFailed, "Task ended without an outcome"))
    }

    async fn attempt_turn(&mut self, entry: &RetryStackEntry) -> Result<TurnOutcome, Error> {
        if self.task.consecutive_mistakes >= self.config.mistake_limit {
            return Err(TaskError::mistake_limit(self.config.mistake_limit).into());
        }
        if !entry.is_pure_retry() {
            self.record(Message::new(entry.sender, entry.content.clone()));
        }

        let model = self.backend.describe_model();
        let catalog = self.workspace.tool_catalog();
        let request = self.build_request(&model, &catalog);

        let Some(events) = self.collect_turn(request).await? else {
            return Ok(TurnOutcome::Cancelled);
        };

        let turn = ResponseProcessor::new(model.tool_protocol)
            .with_catalog(&catalog)
            .with_dynamic_prefixes(self.config.dynamic_tool_prefixes.clone())
            .with_text_call_base(self.text_calls)
            .process(&events)
            .map_err(TaskError::from)?;
        self.text_calls += turn.text_calls;
        self.task.usage.add(&turn.usage);

        if turn.no_tools_used() {
            self.task.consecutive_mistakes += 1;
            debug!(
                task_id = %self.task.id,
                mistakes = self.task.consecutive_mistakes,
                limit = self.config.mistake_limit,
                "Turn ended without a tool call"
            );
            if self.task.consecutive_mistakes >= self.config.mistake_limit {
                return Err(TaskError::mistake_limit(self.config.mistake_limit).into());
            }
            return Err(TaskError::no_tools_used().into());
        }
        self.task.consecutive_mistakes = 0;

        let batch = self
            .executor
            .execute(&turn.tool_uses, self.workspace.as_ref(), self.abort.token())
            .await?;

        self.record(Message::assistant(turn.assistant_content()));
        let snapshot = self.workspace.render_context().await;
        self.record(Message::system(snapshot));

        if batch.cancelled || self.abort.is_aborted() {
            if !batch.results.is_empty() {
                self.record(Message::user(batch.results));
            }
            return Ok(TurnOutcome::Cancelled);
        }
        if batch.completion_attempt {
            return Ok(TurnOutcome::Completion(batch.completion_result));
        }
        Ok(TurnOutcome::Continue(batch.results))
    }

    fn build_request(&self, model: &ModelInfo, catalog: &[ToolDefinition]) -> TurnRequest {
        let mut system_prompt = self.config.system_prompt.clone();
        let fragment = self.workspace.system_prompt_fragment();
        if !fragment.is_empty() {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&fragment);
        }

        match model.tool_protocol {
            ToolProtocol::Native => TurnRequest {
                system_prompt,
                messages: self.task.history.messages.clone(),
                tools: catalog.to_vec(),
                tool_choice: Some(ToolChoice::Required),
            },
            ToolProtocol::Text => {
                system_prompt.push_str(&response::render_text_protocol_catalog(catalog));
                TurnRequest {
                    system_prompt,
                    messages: self.task.history.messages.clone(),
                    tools: Vec::new(),
                    tool_choice: None,
                }
            }
        }
    }

    /// Drain one turn's stream.
    ///
    /// The request timeout covers acquiring the stream and its first event.
    /// Returns `None` when an abort arrives first.
    async fn collect_turn(&self, request: TurnRequest) -> Result<Option<Vec<StreamEvent>>, Error> {
        let cancel = self.abort.token().clone();
        let timeout = self.config.request_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || -> Error {
            TaskError::new(
                TaskErrorKind::RequestTimeout,
                format!("No response within {}ms", timeout.as_millis()),
            )
            .into()
        };

        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            acquired = tokio::time::timeout_at(deadline, self.backend.create_turn_stream(request)) => {
                acquired.map_err(|_| timed_out())??
            }
        };

        let mut events = Vec::new();
        let mut live = LivePreview::new();
        let mut first = true;
        loop {
            let next = if first {
                first = false;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    next = tokio::time::timeout_at(deadline, rx.recv()) => next.map_err(|_| timed_out())?,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    next = rx.recv() => next,
                }
            };
            match next {
                None => break,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(StreamEvent::Error { message })) => {
                    return Err(BackendError::StreamInterrupted(message).into());
                }
                Some(Ok(event)) => {
                    self.preview(&mut live, &event);
                    events.push(event);
                }
            }
        }

        let has_content = events.iter().any(|e| {
            matches!(
                e,
                StreamEvent::Text { .. }
                    | StreamEvent::Reasoning { .. }
                    | StreamEvent::ToolCallPartial { .. }
            )
        });
        if !has_content {
            return Err(TaskError::new(
                TaskErrorKind::NoResponse,
                "The backend returned an empty response",
            )
            .into());
        }
        Ok(Some(events))
    }

    fn preview(&self, live: &mut LivePreview, event: &StreamEvent) {
        match event {
            StreamEvent::ToolCallPartial {
                index,
                id,
                name,
                arguments,
            } => {
                for update in live.push(*index, id.as_deref(), name.as_deref(), arguments.as_deref()) {
                    self.events.publish_tool_progress(ToolCallProgress {
                        task_id: self.task.id.clone(),
                        call_id: update.id,
                        name: update.name,
                        partial: update.partial,
                    });
                }
            }
            StreamEvent::ToolCallsEnd => live.reset(),
            _ => {}
        }
    }

    fn record(&mut self, message: Message) {
        self.task.history.push(message.clone());
        self.events.publish_message(message);
    }

    fn transition(&mut self, to: TaskStatus) -> bool {
        let from = self.task.status;
        if !from.can_transition_to(to) {
            warn!(task_id = %self.task.id, %from, %to, "Ignoring invalid status transition");
            return false;
        }
        self.task.status = to;
        self.events.publish_status(StatusChange {
            task_id: self.task.id.clone(),
            from,
            to,
        });
        true
    }

    fn complete(&mut self) {
        if !self.transition(TaskStatus::Completed) {
            return;
        }
        info!(
            task_id = %self.task.id,
            input_tokens = self.task.usage.input_tokens,
            output_tokens = self.task.usage.output_tokens,
            "Task completed"
        );
        self.events.publish_completed(TaskCompleted {
            task_id: self.task.id.clone(),
            usage: self.task.usage,
            tool_usage: self.executor.usage().clone(),
        });
    }

    fn abort(&mut self, reason: String) {
        if !self.transition(TaskStatus::Aborted) {
            return;
        }
        info!(task_id = %self.task.id, reason = %reason, "Task aborted");
        self.task.abort_reason = Some(reason.clone());
        self.events.publish_aborted(TaskAborted {
            task_id: self.task.id.clone(),
            reason,
        });
    }

    fn abort_from_handle(&mut self) -> TaskOutcome {
        let reason = self.abort.reason();
        self.abort(reason.clone());
        self.outcome().unwrap_or(TaskOutcome::Aborted { reason })
    }
}

#[async_trait]
impl TaskDriver for TaskLoop {
    fn task(&self) -> &Task {
        &self.task
    }

    fn events(&self) -> &TaskEvents {
        &self.events
    }

    fn config(&self) -> &TaskConfig {
        &self.config
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn set_mistake_limit(&mut self, limit: u32) {
        self.config.mistake_limit = limit;
    }

    fn set_max_retry_attempts(&mut self, attempts: u32) {
        self.config.max_retry_attempts = attempts;
    }

    fn set_request_timeout_ms(&mut self, timeout_ms: u64) {
        self.config.request_timeout_ms = timeout_ms;
    }

    async fn execute(&mut self, content: Vec<ContentBlock>) -> Result<TaskOutcome, TaskError> {
        self.run(content).await
    }
}
