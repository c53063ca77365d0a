//! Built-in tools available to replayed tasks.

use async_trait::async_trait;
use taskloop_core::error::ToolError;
use taskloop_core::tool::{Tool, ToolOutput, ToolRegistry};

/// Returns its `text` argument unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;
        Ok(ToolOutput::ok(text))
    }
}

/// Signals that the task is done; its output is the task result.
pub struct CompletionTool {
    name: String,
}

impl CompletionTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for CompletionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Present the final result of the task. Call this once the task is complete."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "result": { "type": "string", "description": "The final result" }
            },
            "required": ["result"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let result = arguments["result"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'result' argument".into()))?;
        Ok(ToolOutput::ok(result))
    }
}

/// A registry with `echo` and the completion tool registered.
pub fn default_registry(completion_tool: &str) -> ToolRegistry {
    let mut registry = ToolRegistry::new()
        .with_prompt_fragment("Use the available tools. Call the completion tool when done.");
    registry.register(Box::new(EchoTool));
    registry.register(Box::new(CompletionTool::new(completion_tool)));
    registry
}
