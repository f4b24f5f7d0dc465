//! Speech recognizer interface.
//!
//! Recognizers differ in two ways that matter to turn-taking, and declare
//! them up front through [`SttCapabilities`] instead of being probed at
//! runtime:
//!
//! - streaming recognizers report their own pause score and are flushed by
//!   pushing silent frames through them ([`FlushMode::ZeroPadding`]);
//! - batch recognizers only transcribe when asked ([`FlushMode::Transcribe`]).

mod buffered;

pub use buffered::{BufferedStt, Transcriber};

use crate::error::Result;
use crate::pipeline::messages::Transcription;
use async_trait::async_trait;

/// How a recognizer is made to emit text for audio it has already received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Push `ceil(delay / frame) + 1` silent frames and wait until the
    /// recognizer clock passes the flush deadline.
    ZeroPadding,
    /// Call [`SpeechToText::flush`] and use the returned transcription.
    Transcribe,
}

/// Fixed capability set of a recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttCapabilities {
    /// Whether [`SpeechToText::pause_prediction`] carries a real score.
    pub reports_pause: bool,
    /// How to flush pending audio.
    pub flush: FlushMode,
}

/// A recognizer connection, owned by the `"stt"` quest.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Declared capabilities.
    fn capabilities(&self) -> SttCapabilities;

    /// Feed one frame of mono audio; may return transcribed text.
    async fn send_audio(&self, samples: &[f32]) -> Result<Option<Transcription>>;

    /// Transcribe whatever audio is pending. Streaming recognizers return `None`.
    async fn flush(&self) -> Result<Option<Transcription>>;

    /// The recognizer's pause score in [0, 1]; meaningful only when
    /// `capabilities().reports_pause`.
    fn pause_prediction(&self) -> f32;

    /// Recognizer clock in seconds: how much audio it has processed.
    fn current_time(&self) -> f64;

    /// Samples sent so far.
    fn sent_samples(&self) -> u64;

    /// Processing delay in seconds between audio in and text out.
    fn delay_sec(&self) -> f64;

    /// Connection state, for snapshots.
    fn state(&self) -> &'static str;

    /// Tell the recognizer whether the bot is speaking (echo suppression).
    fn set_bot_speaking(&self, speaking: bool);

    /// Close the connection.
    async fn shutdown(&self) -> Result<()>;
}
