//! Task lifecycle and observer channels.
//!
//! Observers subscribe to the channel they care about and receive every event
//! published after subscribing. Dropping the receiver unsubscribes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::message::{Message, TaskId};
use crate::stream::TurnUsage;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// idle → running → {completed | aborted}; nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Aborted)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: TaskId,
    pub usage: TurnUsage,
    /// Invocation count per tool name
    pub tool_usage: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAborted {
    pub task_id: TaskId,
    pub reason: String,
}

/// Best-effort preview of a tool call that is still streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallProgress {
    pub task_id: TaskId,
    pub call_id: String,
    pub name: String,
    pub partial: serde_json::Value,
}

/// Broadcast channels for one task.
#[derive(Debug, Clone)]
pub struct TaskEvents {
    message_added: broadcast::Sender<Message>,
    status_changed: broadcast::Sender<StatusChange>,
    completed: broadcast::Sender<TaskCompleted>,
    aborted: broadcast::Sender<TaskAborted>,
    tool_progress: broadcast::Sender<ToolCallProgress>,
}

impl TaskEvents {
    /// Create the channel set; `capacity` bounds lag per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            message_added: broadcast::channel(capacity).0,
            status_changed: broadcast::channel(capacity).0,
            completed: broadcast::channel(capacity).0,
            aborted: broadcast::channel(capacity).0,
            tool_progress: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_message_added(&self) -> broadcast::Receiver<Message> {
        self.message_added.subscribe()
    }

    pub fn subscribe_status_changed(&self) -> broadcast::Receiver<StatusChange> {
        self.status_changed.subscribe()
    }

    pub fn subscribe_completed(&self) -> broadcast::Receiver<TaskCompleted> {
        self.completed.subscribe()
    }

    pub fn subscribe_aborted(&self) -> broadcast::Receiver<TaskAborted> {
        self.aborted.subscribe()
    }

    pub fn subscribe_tool_progress(&self) -> broadcast::Receiver<ToolCallProgress> {
        self.tool_progress.subscribe()
    }

    // Send errors only mean nobody is listening.

    pub fn publish_message(&self, message: Message) {
        let _ = self.message_added.send(message);
    }

    pub fn publish_status(&self, change: StatusChange) {
        let _ = self.status_changed.send(change);
    }

    pub fn publish_completed(&self, event: TaskCompleted) {
        let _ = self.completed.send(event);
    }

    pub fn publish_aborted(&self, event: TaskAborted) {
        let _ = self.aborted.send(event);
    }

    pub fn publish_tool_progress(&self, event: ToolCallProgress) {
        let _ = self.tool_progress.send(event);
    }
}

impl Default for TaskEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
