//! Backend fallback: ordered chain with per-backend acquisition timeouts.
//!
//! When a backend fails to hand over a turn stream (timeout, rate limit,
//! error), the next backend in the chain is tried. Once a stream is acquired
//! the chain is committed to that backend for the rest of the turn.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use taskloop_core::backend::{ModelBackend, ModelInfo, TurnRequest, TurnStream};
use taskloop_core::error::BackendError;
use tracing::{info, warn};

/// A backend that wraps an ordered list of backends and falls back on failure.
pub struct FallbackBackend {
    name: String,
    chain: Vec<FallbackEntry>,
}

/// A single entry in the fallback chain.
struct FallbackEntry {
    backend: Arc<dyn ModelBackend>,
    timeout: Duration,
}

impl FallbackBackend {
    /// Create a new fallback backend with no entries.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: Vec::new(),
        }
    }

    /// Add a backend to the chain with its own acquisition timeout.
    pub fn add(mut self, backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        self.chain.push(FallbackEntry { backend, timeout });
        self
    }

    /// Add a backend with the default timeout (120s).
    pub fn add_default(self, backend: Arc<dyn ModelBackend>) -> Self {
        self.add(backend, Duration::from_secs(120))
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[async_trait]
impl ModelBackend for FallbackBackend {
    fn name(&self) -> &str {
        &self.name
    }

    /// The primary backend's model. All entries should share a tool protocol.
    fn describe_model(&self) -> ModelInfo {
        self.chain
            .first()
            .map(|entry| entry.backend.describe_model())
            .unwrap_or_else(|| ModelInfo {
                id: "none".into(),
                tool_protocol: Default::default(),
                context_window: None,
            })
    }

    async fn create_turn_stream(
        &self,
        request: TurnRequest,
    ) -> std::result::Result<TurnStream, BackendError> {
        let mut last_error = BackendError::NotConfigured("No backends in fallback chain".into());

        for (i, entry) in self.chain.iter().enumerate() {
            let backend_name = entry.backend.name().to_string();

            info!(
                backend = %backend_name,
                attempt = i + 1,
                total = self.chain.len(),
                "Fallback: trying backend"
            );

            match tokio::time::timeout(entry.timeout, entry.backend.create_turn_stream(request.clone()))
                .await
            {
                Ok(Ok(rx)) => return Ok(rx),
                Ok(Err(e)) => {
                    warn!(
                        backend = %backend_name,
                        error = %e,
                        "Fallback: backend failed, trying next"
                    );
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        backend = %backend_name,
                        timeout_ms = entry.timeout.as_millis() as u64,
                        "Fallback: backend timed out, trying next"
                    );
                    last_error = BackendError::Timeout(format!(
                        "Backend '{}' did not start a stream within {}ms",
                        backend_name,
                        entry.timeout.as_millis()
                    ));
                }
            }
        }

        Err(last_error)
    }
}
