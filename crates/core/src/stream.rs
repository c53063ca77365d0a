//! Stream events produced by a backend for one turn.

use serde::{Deserialize, Serialize};

/// A single event in a turn stream.
///
/// Backends translate their wire format into these shapes. Anything the
/// engine does not understand deserializes to [`StreamEvent::Unknown`] and is
/// ignored downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Plain assistant text (may contain `<thinking>` delimiters).
    Text { text: String },

    /// Reasoning delivered on a dedicated channel by the backend.
    Reasoning { text: String },

    /// One fragment of a natively streamed tool call.
    ToolCallPartial {
        index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },

    /// Explicit end-of-tool-calls marker.
    ToolCallsEnd,

    /// Token accounting.
    Usage(TurnUsage),

    /// Backend-reported failure mid-stream.
    Error { message: String },

    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Convenience constructor for a tool-call fragment.
    pub fn tool_call(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Self {
        Self::ToolCallPartial {
            index,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: arguments.map(str::to_string),
        }
    }
}

/// Token usage and cost for a turn (or a whole task when summed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_write_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl TurnUsage {
    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: &TurnUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.saturating_add(other.cache_write_tokens);
        self.total_cost = match (self.total_cost, other.total_cost) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}
