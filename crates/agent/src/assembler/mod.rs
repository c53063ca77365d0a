//! Tool-call assembly from streamed fragments.
//!
//! Backends deliver native tool calls as `ToolCallPartial` chunks keyed by a
//! positional index. [`ToolCallAssembler`] turns those chunks into a clean
//! start / delta / end sequence per call and hands back the complete argument
//! text at the end of the turn. [`ProgressiveToolCall`] accumulates one call's
//! argument text, offers best-effort previews while it streams, and converts
//! the final text into a [`ToolUseRequest`].

pub mod partial_json;

use std::collections::HashMap;

use serde_json::{Map, Value};
use taskloop_core::error::{TaskError, TaskErrorKind};
use taskloop_core::tool::ToolUseRequest;
use tracing::{debug, trace};

/// Normalized lifecycle event for one streamed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerEvent {
    Start { id: String, name: String },
    Delta { id: String, fragment: String },
    End { id: String },
}

/// A call whose fragments have all arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Everything the assembler still held when the turn ended.
#[derive(Debug, Default)]
pub struct Finished {
    pub events: Vec<AssemblerEvent>,
    pub calls: Vec<AssembledCall>,
}

/// Per-call accumulation state.
#[derive(Debug)]
struct ToolCallAccumulator {
    index: u32,
    /// Opening order, used to keep calls sharing an index in sequence
    seq: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    started: bool,
    /// Fragments that arrived before the id and name were both known
    pending: Vec<String>,
}

impl ToolCallAccumulator {
    fn new(index: u32, seq: usize) -> Self {
        Self {
            index,
            seq,
            id: None,
            name: None,
            arguments: String::new(),
            started: false,
            pending: Vec::new(),
        }
    }

    fn absorb(
        &mut self,
        id: Option<&str>,
        name: Option<&str>,
        fragment: Option<&str>,
    ) -> Vec<AssemblerEvent> {
        let mut events = Vec::new();

        if self.id.is_none() {
            self.id = id.filter(|s| !s.is_empty()).map(str::to_string);
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            match &self.name {
                None => self.name = Some(name.to_string()),
                Some(current) if current != name => {
                    trace!(index = self.index, current = %current, ignored = %name, "Ignoring conflicting tool name");
                }
                Some(_) => {}
            }
        }

        if let Some(fragment) = fragment.filter(|s| !s.is_empty()) {
            self.arguments.push_str(fragment);
            match (&self.id, self.started) {
                (Some(id), true) => events.push(AssemblerEvent::Delta {
                    id: id.clone(),
                    fragment: fragment.to_string(),
                }),
                _ => self.pending.push(fragment.to_string()),
            }
        }

        if !self.started {
            if let (Some(id), Some(name)) = (&self.id, &self.name) {
                self.started = true;
                events.push(AssemblerEvent::Start {
                    id: id.clone(),
                    name: name.clone(),
                });
                events.extend(self.pending.drain(..).map(|fragment| AssemblerEvent::Delta {
                    id: id.clone(),
                    fragment,
                }));
            }
        }

        events
    }

    fn into_call(self) -> Option<AssembledCall> {
        match (self.started, self.id, self.name) {
            (true, Some(id), Some(name)) => Some(AssembledCall {
                index: self.index,
                id,
                name,
                arguments: self.arguments,
            }),
            (_, id, name) => {
                debug!(index = self.index, ?id, ?name, "Discarding tool call that never identified itself");
                None
            }
        }
    }
}

/// Reconstructs tool calls from index-keyed chunks.
///
/// State is per turn: call [`finish`](Self::finish) when the stream ends and
/// the assembler is empty again.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    open: HashMap<u32, ToolCallAccumulator>,
    /// Accumulators displaced by a new call id at the same index
    retired: Vec<ToolCallAccumulator>,
    /// Indices whose chunks belong to a call opened at another index
    aliases: HashMap<u32, u32>,
    next_seq: usize,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the events it produced.
    pub fn push(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        fragment: Option<&str>,
    ) -> Vec<AssemblerEvent> {
        let index = self.resolve(index, id);
        let replaced = match (self.open.get(&index), id) {
            (Some(acc), Some(id)) => acc.id.as_deref().is_some_and(|current| current != id),
            _ => false,
        };
        if replaced {
            if let Some(previous) = self.open.remove(&index) {
                trace!(index, "New call id at occupied index");
                self.retired.push(previous);
            }
        }

        let seq = self.next_seq;
        let acc = self
            .open
            .entry(index)
            .or_insert_with(|| ToolCallAccumulator::new(index, seq));
        if acc.seq == seq {
            self.next_seq += 1;
        }
        acc.absorb(id, name, fragment)
    }

    /// Route a chunk to the accumulator that already owns its call id.
    fn resolve(&mut self, index: u32, id: Option<&str>) -> u32 {
        let Some(id) = id.filter(|s| !s.is_empty()) else {
            return self.aliases.get(&index).copied().unwrap_or(index);
        };
        let owner = self
            .open
            .iter()
            .find(|(_, acc)| acc.id.as_deref() == Some(id))
            .map(|(owner, _)| *owner);
        match owner {
            Some(owner) if owner != index => {
                trace!(index, owner, id, "Call id already open at another index");
                self.aliases.insert(index, owner);
                owner
            }
            _ => {
                self.aliases.remove(&index);
                index
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.retired.is_empty()
    }

    /// End every in-flight call, in index order, and clear all state.
    pub fn finish(&mut self) -> Finished {
        self.aliases.clear();
        let mut all: Vec<ToolCallAccumulator> = self.retired.drain(..).collect();
        all.extend(self.open.drain().map(|(_, acc)| acc));
        all.sort_by_key(|acc| (acc.index, acc.seq));

        let mut finished = Finished::default();
        for call in all.into_iter().filter_map(ToolCallAccumulator::into_call) {
            finished.events.push(AssemblerEvent::End { id: call.id.clone() });
            finished.calls.push(call);
        }
        finished
    }
}

/// Errors turning assembled argument text into a request.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("Malformed arguments for tool call {id} ({name}): {source}")]
    Malformed {
        id: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Arguments for tool call {id} ({name}) must be a JSON object")]
    NotAnObject { id: String, name: String },
}

impl From<AssemblyError> for TaskError {
    fn from(err: AssemblyError) -> Self {
        TaskError::new(TaskErrorKind::MalformedToolCall, err.to_string())
    }
}

/// One call's argument text, accumulated fragment by fragment.
#[derive(Debug, Clone)]
pub struct ProgressiveToolCall {
    id: String,
    name: String,
    buffer: String,
}

impl ProgressiveToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            buffer: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Append without attempting a preview.
    pub fn append(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
    }

    /// Append and return whatever structure is extractable so far.
    pub fn push(&mut self, fragment: &str) -> Option<Value> {
        self.append(fragment);
        partial_json::parse_partial(&self.buffer)
    }

    /// The current preview as a request that must not be executed.
    pub fn preview(&self) -> Option<ToolUseRequest> {
        let value = partial_json::parse_partial(&self.buffer)?;
        Some(ToolUseRequest {
            id: self.id.clone(),
            name: self.name.clone(),
            params: value.as_object().cloned().unwrap_or_default(),
            arguments: Some(value),
            partial: true,
            dynamic: false,
            unknown: false,
        })
    }

    /// Strictly parse the accumulated text.
    pub fn finish(&self) -> Result<Value, AssemblyError> {
        parse_arguments(&self.id, &self.name, &self.buffer)
    }

    /// Convert into an executable request.
    pub fn into_request(self, dynamic: bool) -> Result<ToolUseRequest, AssemblyError> {
        build_request(&self.id, &self.name, &self.buffer, dynamic)
    }
}

fn parse_arguments(id: &str, name: &str, text: &str) -> Result<Value, AssemblyError> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(text).map_err(|source| AssemblyError::Malformed {
        id: id.to_string(),
        name: name.to_string(),
        source,
    })
}

/// Build a request from complete argument text.
///
/// Dynamic tools keep the raw payload as loosely-typed params; a non-object
/// payload is wrapped as `{"input": ...}`. Static tools must receive an
/// object, which is kept both as params and as typed arguments.
pub fn build_request(
    id: &str,
    name: &str,
    arguments: &str,
    dynamic: bool,
) -> Result<ToolUseRequest, AssemblyError> {
    let value = parse_arguments(id, name, arguments)?;

    let (params, arguments) = match (value, dynamic) {
        (Value::Object(map), true) => (map, None),
        (other, true) => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            (map, None)
        }
        (Value::Object(map), false) => (map.clone(), Some(Value::Object(map))),
        (_, false) => {
            return Err(AssemblyError::NotAnObject {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
    };

    Ok(ToolUseRequest {
        id: id.to_string(),
        name: name.to_string(),
        params,
        arguments,
        partial: false,
        dynamic,
        unknown: false,
    })
}

/// Whether `name` belongs to the dynamic-capability namespace.
pub fn is_dynamic(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| !p.is_empty() && name.starts_with(p.as_str()))
}

/// A live preview update for one streaming call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewUpdate {
    pub id: String,
    pub name: String,
    pub partial: Value,
}

/// Drives an assembler plus one [`ProgressiveToolCall`] per call while the
/// stream is still open, producing preview updates.
#[derive(Debug, Default)]
pub struct LivePreview {
    assembler: ToolCallAssembler,
    calls: HashMap<String, ProgressiveToolCall>,
}

impl LivePreview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        fragment: Option<&str>,
    ) -> Vec<PreviewUpdate> {
        let mut updates = Vec::new();
        for event in self.assembler.push(index, id, name, fragment) {
            match event {
                AssemblerEvent::Start { id, name } => {
                    self.calls.insert(id.clone(), ProgressiveToolCall::new(id, name));
                }
                AssemblerEvent::Delta { id, fragment } => {
                    let Some(call) = self.calls.get_mut(&id) else {
                        continue;
                    };
                    if let Some(partial) = call.push(&fragment) {
                        updates.push(PreviewUpdate {
                            id,
                            name: call.name().to_string(),
                            partial,
                        });
                    }
                }
                AssemblerEvent::End { .. } => {}
            }
        }
        updates
    }

    /// Drop all state at the end of a tool-call block.
    pub fn reset(&mut self) {
        self.assembler.finish();
        self.calls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunks_become_start_deltas_end() {
        let mut asm = ToolCallAssembler::new();
        let mut events = asm.push(0, Some("a"), Some("search"), Some(r#"{"q":"#));
        events.extend(asm.push(0, None, None, Some(r#""x"}"#)));
        let finished = asm.finish();
        events.extend(finished.events);

        assert_eq!(
            events,
            vec![
                AssemblerEvent::Start { id: "a".into(), name: "search".into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: r#"{"q":"#.into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: r#""x"}"#.into() },
                AssemblerEvent::End { id: "a".into() },
            ]
        );

        let call = &finished.calls[0];
        let req = build_request(&call.id, &call.name, &call.arguments, false).unwrap();
        assert_eq!(req.arguments, Some(json!({"q": "x"})));
        assert_eq!(req.params["q"], "x");
        assert!(asm.is_empty());
    }

    #[test]
    fn fragments_before_name_are_buffered() {
        let mut asm = ToolCallAssembler::new();
        assert!(asm.push(0, Some("a"), None, Some("{\"p\"")).is_empty());
        let events = asm.push(0, None, Some("read"), Some(":1}"));

        assert_eq!(
            events,
            vec![
                AssemblerEvent::Start { id: "a".into(), name: "read".into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: "{\"p\"".into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: ":1}".into() },
            ]
        );
        assert_eq!(asm.finish().calls[0].arguments, "{\"p\":1}");
    }

    #[test]
    fn name_before_id_still_starts_once() {
        let mut asm = ToolCallAssembler::new();
        assert!(asm.push(0, None, Some("search"), Some(r#"{"q":"#)).is_empty());
        let mut events = asm.push(0, Some("a"), None, Some(r#""x"}"#));
        let finished = asm.finish();
        events.extend(finished.events);

        assert_eq!(
            events,
            vec![
                AssemblerEvent::Start { id: "a".into(), name: "search".into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: r#"{"q":"#.into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: r#""x"}"#.into() },
                AssemblerEvent::End { id: "a".into() },
            ]
        );
        assert_eq!(finished.calls[0].arguments, r#"{"q":"x"}"#);
    }

    #[test]
    fn same_id_at_second_index_joins_open_call() {
        let mut asm = ToolCallAssembler::new();
        let mut events = asm.push(0, Some("a"), Some("search"), Some(r#"{"q":"#));
        events.extend(asm.push(1, Some("a"), None, Some(r#""x""#)));
        events.extend(asm.push(1, None, None, Some("}")));
        let finished = asm.finish();
        events.extend(finished.events);

        assert_eq!(
            events,
            vec![
                AssemblerEvent::Start { id: "a".into(), name: "search".into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: r#"{"q":"#.into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: r#""x""#.into() },
                AssemblerEvent::Delta { id: "a".into(), fragment: "}".into() },
                AssemblerEvent::End { id: "a".into() },
            ]
        );
        assert_eq!(finished.calls.len(), 1);
        let call = &finished.calls[0];
        let req = build_request(&call.id, &call.name, &call.arguments, false).unwrap();
        assert_eq!(req.arguments, Some(json!({"q": "x"})));
        assert!(asm.is_empty());
    }

    #[test]
    fn exactly_one_start_per_call() {
        let mut asm = ToolCallAssembler::new();
        let mut events = asm.push(0, Some("a"), Some("x"), None);
        events.extend(asm.push(0, Some("a"), Some("x"), Some("{}")));
        let starts = events
            .iter()
            .filter(|e| matches!(e, AssemblerEvent::Start { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn interleaved_indices_finish_in_index_order() {
        let mut asm = ToolCallAssembler::new();
        asm.push(1, Some("b"), Some("write"), Some("{\"k\":"));
        asm.push(0, Some("a"), Some("read"), Some("{}"));
        asm.push(1, None, None, Some("2}"));

        let finished = asm.finish();
        let ids: Vec<_> = finished.calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(finished.calls[1].arguments, "{\"k\":2}");
    }

    #[test]
    fn new_id_at_same_index_opens_new_call() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, Some("a"), Some("one"), Some("{}"));
        let events = asm.push(0, Some("b"), Some("two"), Some("{}"));
        assert!(matches!(&events[0], AssemblerEvent::Start { id, .. } if id == "b"));

        let finished = asm.finish();
        let ids: Vec<_> = finished.calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn unnamed_call_is_discarded() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, Some("a"), None, Some("{}"));
        let finished = asm.finish();
        assert!(finished.calls.is_empty());
        assert!(finished.events.is_empty());
    }

    #[test]
    fn progressive_previews_never_fail() {
        let mut call = ProgressiveToolCall::new("a", "search");
        assert_eq!(call.push(r#"{"q": "hel"#), Some(json!({"q": "hel"})));
        assert_eq!(call.push(r#"lo", "limit"#), Some(json!({"q": "hello"})));
        assert_eq!(call.push(": 3}"), Some(json!({"q": "hello", "limit": 3})));
        assert!(call.preview().unwrap().partial);
        assert_eq!(call.finish().unwrap(), json!({"q": "hello", "limit": 3}));
    }

    #[test]
    fn malformed_arguments_fail_at_finalization() {
        let mut call = ProgressiveToolCall::new("a", "search");
        call.append(r#"{"q": "#);
        let err = call.into_request(false).unwrap_err();
        assert!(matches!(err, AssemblyError::Malformed { .. }));
        let task_err: TaskError = err.into();
        assert_eq!(task_err.kind, TaskErrorKind::MalformedToolCall);
        assert!(task_err.is_retryable());
    }

    #[test]
    fn empty_arguments_mean_no_parameters() {
        let req = build_request("a", "list", "  ", false).unwrap();
        assert!(req.params.is_empty());
        assert_eq!(req.arguments, Some(json!({})));
    }

    #[test]
    fn dynamic_tools_get_loose_params() {
        let req = build_request("a", "mcp__fs__read", r#"{"path":"x"}"#, true).unwrap();
        assert!(req.dynamic);
        assert!(req.arguments.is_none());
        assert_eq!(req.params["path"], "x");

        let req = build_request("b", "mcp__echo", r#""hello""#, true).unwrap();
        assert_eq!(req.params["input"], "hello");
    }

    #[test]
    fn static_tools_require_objects() {
        let err = build_request("a", "search", "[1,2]", false).unwrap_err();
        assert!(matches!(err, AssemblyError::NotAnObject { .. }));
    }

    #[test]
    fn dynamic_prefix_matching() {
        let prefixes = vec!["mcp__".to_string()];
        assert!(is_dynamic("mcp__github__search", &prefixes));
        assert!(!is_dynamic("search", &prefixes));
        assert!(!is_dynamic("anything", &[String::new()]));
    }

    #[test]
    fn live_preview_reports_growing_arguments() {
        let mut live = LivePreview::new();
        let first = live.push(0, Some("a"), Some("search"), Some(r#"{"q":"he"#));
        assert_eq!(first[0].partial, json!({"q": "he"}));
        let second = live.push(0, None, None, Some(r#"llo"}"#));
        assert_eq!(second[0].partial, json!({"q": "hello"}));
        live.reset();
        assert!(live.push(0, None, None, Some("{}")).is_empty());
    }
}
