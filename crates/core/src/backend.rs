//! ModelBackend trait — the abstraction over language-model backends.
//!
//! A backend takes a protocol-neutral turn request and returns an ordered
//! stream of [`StreamEvent`]s. How it talks to the vendor is its own business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::message::Message;
use crate::stream::StreamEvent;
use crate::tool::ToolDefinition;

/// Receiving side of one turn's event stream.
pub type TurnStream = tokio::sync::mpsc::Receiver<std::result::Result<StreamEvent, BackendError>>;

/// How the backend expects tools to be offered and called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolProtocol {
    /// Tools travel as request metadata; calls arrive as `ToolCallPartial` events.
    #[default]
    Native,
    /// Tools are described in the system prompt; calls arrive as
    /// `<tool_call>` blocks inside the text.
    Text,
}

/// Static description of the model behind a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier (e.g. "gpt-4o")
    pub id: String,

    #[serde(default)]
    pub tool_protocol: ToolProtocol,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

/// Tool selection hint sent alongside the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Required,
    Tool(String),
}

/// A protocol-neutral request for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub system_prompt: String,

    /// Ordered conversation history
    pub messages: Vec<Message>,

    /// Tool catalog (empty for the text protocol)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// The core backend trait.
///
/// The task loop calls `create_turn_stream()` without knowing which vendor
/// sits behind it.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// A human-readable name for this backend.
    fn name(&self) -> &str;

    /// Describe the active model, including its tool-calling protocol.
    fn describe_model(&self) -> ModelInfo;

    /// Start a turn and return its event stream.
    async fn create_turn_stream(
        &self,
        request: TurnRequest,
    ) -> std::result::Result<TurnStream, BackendError>;

    /// Run a turn to completion and return its concatenated text.
    ///
    /// Default implementation drains `create_turn_stream()`.
    async fn complete_single(
        &self,
        request: TurnRequest,
    ) -> std::result::Result<String, BackendError> {
        let mut rx = self.create_turn_stream(request).await?;
        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            match event? {
                StreamEvent::Text { text: t } => text.push_str(&t),
                StreamEvent::Error { message } => {
                    return Err(BackendError::StreamInterrupted(message));
                }
                _ => {}
            }
        }
        Ok(text)
    }
}
