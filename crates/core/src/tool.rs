//! Tools and the workspace collaborator.
//!
//! The task loop never executes tools itself; it hands assembled
//! [`ToolUseRequest`]s to a [`Workspace`]. [`ToolRegistry`] is the stock
//! workspace: a name → [`Tool`] map plus a small context snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::message::ContentBlock;

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A tool invocation reconstructed from the model's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseRequest {
    /// Call ID (matches the model's tool call id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Loosely-typed parameters, one entry per top-level argument key
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,

    /// The full parsed payload for statically known tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,

    /// Still streaming — not safe to execute
    #[serde(default)]
    pub partial: bool,

    /// Routed through the dynamic-capability path
    #[serde(default)]
    pub dynamic: bool,

    /// Not present in the tool catalog
    #[serde(default)]
    pub unknown: bool,
}

impl ToolUseRequest {
    /// Render as an assistant `tool_use` content block.
    pub fn to_block(&self) -> ContentBlock {
        ContentBlock::ToolUse {
            id: self.id.clone(),
            name: self.name.clone(),
            input: self
                .arguments
                .clone()
                .unwrap_or_else(|| serde_json::Value::Object(self.params.clone())),
        }
    }
}

/// What a tool hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Whether the tool considers the call successful
    pub success: bool,

    /// The output content fed back to the model
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }
}

/// The capability provider a task runs against.
///
/// Shared between tasks via `Arc`; implementations own their concurrency
/// safety.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// A text snapshot of the environment, appended after every turn.
    async fn render_context(&self) -> String;

    /// Extra system-prompt text describing this workspace.
    fn system_prompt_fragment(&self) -> String;

    /// Tools the model may call.
    fn tool_catalog(&self) -> Vec<ToolDefinition>;

    /// Execute one tool call.
    async fn dispatch(
        &self,
        name: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<ToolOutput, ToolError>;
}

/// A single capability.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
    prompt_fragment: String,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            prompt_fragment: String::new(),
        }
    }

    /// Set the system-prompt fragment this registry contributes.
    pub fn with_prompt_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.prompt_fragment = fragment.into();
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Workspace for ToolRegistry {
    async fn render_context(&self) -> String {
        let mut ctx = format!("# Current Time\n{}\n", chrono::Utc::now().to_rfc3339());
        ctx.push_str("\n# Registered Tools\n");
        for name in self.names() {
            ctx.push_str(&format!("- {name}\n"));
        }
        ctx
    }

    fn system_prompt_fragment(&self) -> String {
        self.prompt_fragment.clone()
    }

    fn tool_catalog(&self) -> Vec<ToolDefinition> {
        self.definitions()
    }

    async fn dispatch(
        &self,
        name: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tracing::debug!(tool = %name, params = params.len(), "Dispatching tool");
        tool.execute(serde_json::Value::Object(params.clone())).await
    }
}
