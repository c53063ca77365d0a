//! Replay backend for recorded turn transcripts.
//!
//! A transcript is either a bare JSON array of turns (each an array of
//! stream events) or an object that also describes the model:
//!
//! ```json
//! {
//!   "model": { "id": "recorded", "tool_protocol": "text" },
//!   "turns": [[{ "type": "text", "text": "hi" }]]
//! }
//! ```

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use taskloop_core::backend::{ModelBackend, ModelInfo, TurnRequest, TurnStream};
use taskloop_core::error::{BackendError, Error};
use taskloop_core::stream::StreamEvent;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Transcript {
    Turns(Vec<Vec<StreamEvent>>),
    Described {
        #[serde(default)]
        model: Option<ModelInfo>,
        turns: Vec<Vec<StreamEvent>>,
    },
}

/// Serves recorded turns in order, one per `create_turn_stream` call.
pub struct ScriptedBackend {
    model: ModelInfo,
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            model: ModelInfo {
                id: "scripted".into(),
                tool_protocol: Default::default(),
                context_window: None,
            },
            turns: Mutex::new(turns.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, model: ModelInfo) -> Self {
        self.model = model;
        self
    }

    /// Parse a transcript from JSON text.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let backend = match serde_json::from_str::<Transcript>(json)? {
            Transcript::Turns(turns) => Self::new(turns),
            Transcript::Described { model, turns } => {
                let backend = Self::new(turns);
                match model {
                    Some(model) => backend.with_model(model),
                    None => backend,
                }
            }
        };
        Ok(backend)
    }

    /// Load a transcript file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("Failed to read transcript {}: {e}", path.display()),
        })?;
        Self::from_json(&json)
    }

    /// Turns served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Turns not yet served.
    pub fn remaining(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn describe_model(&self) -> ModelInfo {
        self.model.clone()
    }

    async fn create_turn_stream(
        &self,
        request: TurnRequest,
    ) -> std::result::Result<TurnStream, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .turns
            .lock()
            .map_err(|_| BackendError::StreamInterrupted("Transcript lock poisoned".into()))?
            .pop_front();
        let Some(events) = next else {
            return Err(BackendError::NotConfigured(format!(
                "Transcript exhausted after {call} turns"
            )));
        };

        debug!(
            turn = call + 1,
            events = events.len(),
            messages = request.messages.len(),
            "Replaying recorded turn"
        );

        let (tx, rx) = tokio::sync::mpsc::channel(events.len().max(1));
        for event in events {
            if tx.send(Ok(event)).await.is_err() {
                break;
            }
        }
        Ok(rx)
    }
}
