//! Shared test helpers for task loop tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use taskloop_core::backend::{ModelBackend, ModelInfo, ToolProtocol, TurnRequest, TurnStream};
use tokio::sync::mpsc::Sender;
use taskloop_core::error::{BackendError, ToolError};
use taskloop_core::stream::{StreamEvent, TurnUsage};
use taskloop_core::tool::{ToolDefinition, ToolOutput, ToolUseRequest, Workspace};

use crate::task::AbortHandle;

/// One scripted backend turn.
#[derive(Debug, Clone)]
pub enum Turn {
    Events(Vec<StreamEvent>),
    Fail(BackendError),
    /// Never produce a stream
    Hang,
    /// Produce a stream that stays open but never yields
    Silent,
}

/// Shared view of how many turns a backend served.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A backend that serves a queue of scripted turns.
///
/// Panics if more turns are requested than scripted, unless built with
/// [`ScriptedTurns::repeating`].
pub struct ScriptedTurns {
    turns: Mutex<VecDeque<Turn>>,
    repeat: Option<Turn>,
    calls: CallCounter,
    requests: Arc<Mutex<Vec<TurnRequest>>>,
    protocol: ToolProtocol,
    /// Senders behind `Turn::Silent` streams, held so the streams stay open
    silent: Mutex<Vec<Sender<Result<StreamEvent, BackendError>>>>,
}

impl ScriptedTurns {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            repeat: None,
            calls: CallCounter::default(),
            requests: Arc::new(Mutex::new(Vec::new())),
            protocol: ToolProtocol::Native,
            silent: Mutex::new(Vec::new()),
        }
    }

    /// Serve the same turn forever.
    pub fn repeating(turn: Turn) -> Self {
        let mut backend = Self::new(Vec::new());
        backend.repeat = Some(turn);
        backend
    }

    pub fn with_protocol(mut self, protocol: ToolProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }

    /// Every request received, in order.
    pub fn request_log(&self) -> Arc<Mutex<Vec<TurnRequest>>> {
        self.requests.clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedTurns {
    fn name(&self) -> &str {
        "scripted"
    }

    fn describe_model(&self) -> ModelInfo {
        ModelInfo {
            id: "mock-model".into(),
            tool_protocol: self.protocol,
            context_window: None,
        }
    }

    async fn create_turn_stream(&self, request: TurnRequest) -> Result<TurnStream, BackendError> {
        let call = self.calls.0.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| panic!("ScriptedTurns: no turn scripted for call #{call}"));

        match turn {
            Turn::Events(events) => {
                let (tx, rx) = tokio::sync::mpsc::channel(events.len().max(1));
                for event in events {
                    tx.send(Ok(event)).await.unwrap();
                }
                Ok(rx)
            }
            Turn::Fail(err) => Err(err),
            Turn::Hang => std::future::pending().await,
            Turn::Silent => {
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                self.silent.lock().unwrap().push(tx);
                Ok(rx)
            }
        }
    }
}

/// A turn that calls one tool with the given arguments.
pub fn tool_turn(id: &str, name: &str, args: serde_json::Value) -> Turn {
    let arguments = args.to_string();
    Turn::Events(vec![
        StreamEvent::tool_call(0, Some(id), Some(name), Some(&arguments)),
        StreamEvent::ToolCallsEnd,
        StreamEvent::Usage(TurnUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        }),
    ])
}

/// A turn that calls the completion tool.
pub fn completion_turn(id: &str, result: &str) -> Turn {
    tool_turn(id, "attempt_completion", serde_json::json!({ "result": result }))
}

/// A turn with text only.
pub fn text_turn(text: &str) -> Turn {
    Turn::Events(vec![StreamEvent::text(text)])
}

/// A ready-to-execute request.
pub fn request(id: &str, name: &str, args: serde_json::Value) -> ToolUseRequest {
    ToolUseRequest {
        id: id.into(),
        name: name.into(),
        params: args.as_object().cloned().unwrap_or_default(),
        arguments: Some(args),
        partial: false,
        dynamic: false,
        unknown: false,
    }
}

/// A workspace that records dispatches.
///
/// Each tool answers with its `result` argument, or `ok:<name>`.
pub struct MockWorkspace {
    tools: Vec<String>,
    hidden: Vec<String>,
    failures: HashMap<String, ToolError>,
    abort_on: Option<(String, AbortHandle)>,
    dispatched: Mutex<Vec<String>>,
}

impl MockWorkspace {
    pub fn new(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            hidden: Vec::new(),
            failures: HashMap::new(),
            abort_on: None,
            dispatched: Mutex::new(Vec::new()),
        }
    }

    /// Make `tool` fail with `err`.
    pub fn failing(mut self, tool: &str, err: ToolError) -> Self {
        self.failures.insert(tool.to_string(), err);
        self
    }

    /// Keep `tool` dispatchable but out of the catalog.
    pub fn hidden(mut self, tool: &str) -> Self {
        self.hidden.push(tool.to_string());
        self
    }

    /// Abort through `handle` while `tool` runs.
    pub fn abort_on(mut self, tool: &str, handle: AbortHandle) -> Self {
        self.abort_on = Some((tool.to_string(), handle));
        self
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Workspace for MockWorkspace {
    async fn render_context(&self) -> String {
        format!("# Workspace\n{} tools", self.tools.len())
    }

    fn system_prompt_fragment(&self) -> String {
        "You are a test agent.".into()
    }

    fn tool_catalog(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| !self.hidden.contains(*t))
            .map(|t| ToolDefinition {
                name: t.clone(),
                description: format!("The {t} tool"),
                parameters: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    async fn dispatch(
        &self,
        name: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolOutput, ToolError> {
        if !self.tools.iter().any(|t| t == name) {
            return Err(ToolError::NotFound(name.to_string()));
        }
        self.dispatched.lock().unwrap().push(name.to_string());

        if let Some((tool, handle)) = &self.abort_on {
            if tool == name {
                handle.abort("user stop");
            }
        }
        if let Some(err) = self.failures.get(name) {
            return Err(err.clone());
        }
        let output = params
            .get("result")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("ok:{name}"));
        Ok(ToolOutput::ok(output))
    }
}
