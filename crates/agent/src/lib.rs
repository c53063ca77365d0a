//! The TaskLoop engine.
//!
//! A task follows a **stream → assemble → execute → feed back** cycle:
//!
//! 1. **Send** the conversation to the [`ModelBackend`](taskloop_core::ModelBackend)
//! 2. **Collect** the turn's stream, previewing tool calls as they arrive
//! 3. **Process** the turn into text, reasoning and tool requests
//! 4. **Execute** the requests against the [`Workspace`](taskloop_core::Workspace)
//! 5. **Feed back** the results as the next user entry, or stop on completion
//!
//! Failures are classified, and retryable ones are retried with a corrective
//! message until the budget runs out.

pub mod assembler;
pub mod executor;
pub mod observe;
pub mod response;
pub mod retry;
pub mod task;

#[cfg(test)]
mod test_helpers;

pub use assembler::{
    AssembledCall, AssemblerEvent, AssemblyError, LivePreview, ProgressiveToolCall,
    ToolCallAssembler,
};
pub use executor::{ToolBatch, ToolExecutor};
pub use observe::{MethodCall, MethodPhase, ObservedTask, PropertyChange, TaskCallbacks};
pub use response::{ResponseProcessor, TurnResult};
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{AbortHandle, RetryStackEntry, Task, TaskDriver, TaskLoop, TaskOutcome};
