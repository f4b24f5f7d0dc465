//! Session recording sink.

use crate::error::Result;
use async_trait::async_trait;

/// Where a recorded event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Sent by the client.
    Client,
    /// Produced by the server.
    Server,
}

/// Optional sink for session lifecycle and message events.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Record one event.
    async fn add_event(&self, source: EventSource, event: serde_json::Value) -> Result<()>;

    /// Stop recording. With `keep_recording == false` everything recorded so
    /// far is discarded.
    async fn shutdown(&self, keep_recording: bool) -> Result<()>;
}
