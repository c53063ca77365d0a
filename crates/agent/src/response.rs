//! Turn response processing.
//!
//! Folds one turn's [`StreamEvent`]s into a [`TurnResult`]: visible text,
//! reasoning, executable tool requests and summed usage. `<thinking>` regions
//! in the text become reasoning; under the text tool protocol `<tool_call>`
//! regions become tool requests. Delimiters may be split across chunks.

use std::collections::HashSet;

use serde::Deserialize;
use taskloop_core::backend::ToolProtocol;
use taskloop_core::message::ContentBlock;
use taskloop_core::stream::{StreamEvent, TurnUsage};
use taskloop_core::tool::{ToolDefinition, ToolUseRequest};
use tracing::{debug, trace};

use crate::assembler::{self, AssemblyError, ToolCallAssembler};

pub const THINKING_OPEN: &str = "<thinking>";
pub const THINKING_CLOSE: &str = "</thinking>";
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Everything one turn produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnResult {
    pub text: String,
    pub reasoning: String,
    pub tool_uses: Vec<ToolUseRequest>,
    pub usage: TurnUsage,
    /// Calls parsed from `<tool_call>` blocks
    pub text_calls: usize,
}

impl TurnResult {
    pub fn no_tools_used(&self) -> bool {
        self.tool_uses.is_empty()
    }

    /// Content blocks for the assistant message, reasoning first.
    pub fn assistant_content(&self) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        if !self.reasoning.trim().is_empty() {
            blocks.push(ContentBlock::reasoning(self.reasoning.trim()));
        }
        if !self.text.trim().is_empty() {
            blocks.push(ContentBlock::text(self.text.trim()));
        }
        blocks.extend(self.tool_uses.iter().map(ToolUseRequest::to_block));
        blocks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Plain,
    Thinking,
    ToolCall,
}

impl Region {
    fn close_tag(self) -> &'static str {
        match self {
            Region::Plain => "",
            Region::Thinking => THINKING_CLOSE,
            Region::ToolCall => TOOL_CALL_CLOSE,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Text(Region, String),
    Closed(Region),
}

/// Splits text into regions, holding back any tail that might be the start
/// of a delimiter until the next chunk decides it.
struct DelimiterScanner {
    openers: Vec<(&'static str, Region)>,
    region: Region,
    carry: String,
}

impl DelimiterScanner {
    fn new(protocol: ToolProtocol) -> Self {
        let mut openers = vec![(THINKING_OPEN, Region::Thinking)];
        if protocol == ToolProtocol::Text {
            openers.push((TOOL_CALL_OPEN, Region::ToolCall));
        }
        Self {
            openers,
            region: Region::Plain,
            carry: String::new(),
        }
    }

    fn feed(&mut self, chunk: &str, out: &mut Vec<Segment>) {
        self.carry.push_str(chunk);
        loop {
            let found = match self.region {
                Region::Plain => self
                    .openers
                    .iter()
                    .filter_map(|(tag, region)| self.carry.find(tag).map(|at| (at, *tag, *region)))
                    .min_by_key(|(at, _, _)| *at),
                inside => {
                    let tag = inside.close_tag();
                    self.carry.find(tag).map(|at| (at, tag, Region::Plain))
                }
            };

            match found {
                Some((at, tag, next)) => {
                    self.emit(at, out);
                    if self.region != Region::Plain {
                        out.push(Segment::Closed(self.region));
                    }
                    self.carry.drain(..tag.len());
                    self.region = next;
                }
                None => {
                    let keep = self.possible_tag_prefix();
                    self.emit(self.carry.len() - keep, out);
                    return;
                }
            }
        }
    }

    /// Flush held-back text. An unterminated region still counts.
    fn finish(&mut self, out: &mut Vec<Segment>) {
        self.emit(self.carry.len(), out);
        if self.region != Region::Plain {
            trace!(region = ?self.region, "Stream ended inside an open region");
            out.push(Segment::Closed(self.region));
            self.region = Region::Plain;
        }
    }

    fn emit(&mut self, upto: usize, out: &mut Vec<Segment>) {
        if upto == 0 {
            return;
        }
        let text: String = self.carry.drain(..upto).collect();
        out.push(Segment::Text(self.region, text));
    }

    /// Length of the longest suffix of `carry` that could begin a delimiter.
    fn possible_tag_prefix(&self) -> usize {
        let tags: Vec<&str> = match self.region {
            Region::Plain => self.openers.iter().map(|(tag, _)| *tag).collect(),
            inside => vec![inside.close_tag()],
        };
        let longest = tags.iter().map(|t| t.len() - 1).max().unwrap_or(0);
        let len = self.carry.len();
        (1..=longest.min(len))
            .rev()
            .find(|&k| {
                self.carry.is_char_boundary(len - k)
                    && tags.iter().any(|t| t.starts_with(&self.carry[len - k..]))
            })
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct TextToolCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Stateless per turn: every [`process`](Self::process) call starts fresh.
#[derive(Debug, Clone, Default)]
pub struct ResponseProcessor {
    protocol: ToolProtocol,
    catalog: Option<HashSet<String>>,
    dynamic_prefixes: Vec<String>,
    text_call_base: usize,
}

impl ResponseProcessor {
    pub fn new(protocol: ToolProtocol) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }

    /// Mark requests for names outside the catalog as unknown.
    pub fn with_catalog(mut self, tools: &[ToolDefinition]) -> Self {
        self.catalog = Some(tools.iter().map(|t| t.name.clone()).collect());
        self
    }

    pub fn with_dynamic_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.dynamic_prefixes = prefixes;
        self
    }

    /// Number text-protocol call ids from `base` so they stay unique across turns.
    pub fn with_text_call_base(mut self, base: usize) -> Self {
        self.text_call_base = base;
        self
    }

    pub fn process(&self, events: &[StreamEvent]) -> Result<TurnResult, AssemblyError> {
        let mut result = TurnResult::default();
        let mut scanner = DelimiterScanner::new(self.protocol);
        let mut segments = Vec::new();
        let mut native = ToolCallAssembler::new();
        let mut calls = Vec::new();

        for event in events {
            match event {
                StreamEvent::Text { text } => scanner.feed(text, &mut segments),
                StreamEvent::Reasoning { text } => result.reasoning.push_str(text),
                StreamEvent::ToolCallPartial {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    native.push(*index, id.as_deref(), name.as_deref(), arguments.as_deref());
                }
                StreamEvent::ToolCallsEnd => calls.extend(native.finish().calls),
                StreamEvent::Usage(usage) => result.usage.add(usage),
                StreamEvent::Error { message } => {
                    debug!(error = %message, "Ignoring error event during processing");
                }
                StreamEvent::Unknown => trace!("Ignoring unknown stream event"),
            }
        }
        calls.extend(native.finish().calls);
        scanner.finish(&mut segments);

        for call in calls {
            let dynamic = self.is_dynamic(&call.name);
            let request = assembler::build_request(&call.id, &call.name, &call.arguments, dynamic)?;
            result.tool_uses.push(self.mark_unknown(request));
        }

        let mut pending_call = String::new();
        for segment in segments {
            match segment {
                Segment::Text(Region::Plain, text) => result.text.push_str(&text),
                Segment::Text(Region::Thinking, text) => result.reasoning.push_str(&text),
                Segment::Text(Region::ToolCall, text) => pending_call.push_str(&text),
                Segment::Closed(Region::ToolCall) => {
                    let id = format!("text_call_{}", self.text_call_base + result.text_calls);
                    let request = self.parse_text_call(&id, &std::mem::take(&mut pending_call))?;
                    result.tool_uses.push(self.mark_unknown(request));
                    result.text_calls += 1;
                }
                Segment::Closed(_) => {}
            }
        }

        Ok(result)
    }

    fn parse_text_call(&self, id: &str, body: &str) -> Result<ToolUseRequest, AssemblyError> {
        let call: TextToolCall =
            serde_json::from_str(body.trim()).map_err(|source| AssemblyError::Malformed {
                id: id.to_string(),
                name: "<unparsed>".to_string(),
                source,
            })?;
        let arguments = match call.arguments {
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        let dynamic = self.is_dynamic(&call.name);
        assembler::build_request(id, &call.name, &arguments, dynamic)
    }

    fn is_dynamic(&self, name: &str) -> bool {
        assembler::is_dynamic(name, &self.dynamic_prefixes)
    }

    fn mark_unknown(&self, mut request: ToolUseRequest) -> ToolUseRequest {
        if let Some(catalog) = &self.catalog {
            request.unknown = !request.dynamic && !catalog.contains(&request.name);
        }
        request
    }
}

/// Tool catalog rendered into the system prompt for the text protocol.
pub fn render_text_protocol_catalog(tools: &[ToolDefinition]) -> String {
    let mut out = String::from("\n\n# Tools\n\n");
    out.push_str(&format!(
        "Call one or more tools per response by writing \
         {TOOL_CALL_OPEN}{{\"name\": \"<tool>\", \"arguments\": {{...}}}}{TOOL_CALL_CLOSE}.\n"
    ));
    for tool in tools {
        out.push_str(&format!(
            "\n## {}\n{}\nParameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    out
}
