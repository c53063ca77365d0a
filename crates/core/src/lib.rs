//! # TaskLoop Core
//!
//! Domain types, collaborator traits, and error definitions for the TaskLoop
//! engine. This crate has **no engine logic** — it defines the vocabulary that
//! the agent crate drives and that backends and workspaces implement.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`ModelBackend`] produces a stream of [`StreamEvent`]s for one turn
//! - [`Workspace`] renders context and dispatches tool calls
//!
//! The task loop depends only on these traits, so tests and the CLI can plug
//! in scripted implementations.

pub mod backend;
pub mod error;
pub mod event;
pub mod message;
pub mod stream;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use backend::{ModelBackend, ModelInfo, ToolChoice, ToolProtocol, TurnRequest, TurnStream};
pub use error::{BackendError, Error, Result, TaskError, TaskErrorKind, ToolError};
pub use event::{TaskEvents, TaskStatus};
pub use message::{ContentBlock, Conversation, Message, Role, TaskId};
pub use stream::{StreamEvent, TurnUsage};
pub use tool::{Tool, ToolDefinition, ToolOutput, ToolRegistry, ToolUseRequest, Workspace};
