//! Speech synthesizer interface.

use crate::error::Result;
use crate::pipeline::messages::{TtsClientMessage, TtsMessage};
use async_trait::async_trait;

/// A streaming synthesizer connection, owned by the `"tts"` quest.
///
/// Text goes in with [`send`](Self::send); tagged messages come back from
/// [`recv`](Self::recv) until it returns `None`.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Send text to speak, or end-of-stream.
    async fn send(&self, message: TtsClientMessage) -> Result<()>;

    /// Next synthesized message. `None` once the stream is exhausted.
    ///
    /// A dropped connection surfaces as `Some(Err(TurnError::StreamClosed(..)))`.
    async fn recv(&self) -> Option<Result<TtsMessage>>;

    /// Voice this connection synthesizes with.
    fn voice(&self) -> Option<String>;

    /// Connection state, for snapshots.
    fn state(&self) -> &'static str;

    /// Samples received from the backend so far.
    fn received_samples(&self) -> u64;

    /// Close the connection.
    async fn shutdown(&self) -> Result<()>;
}
