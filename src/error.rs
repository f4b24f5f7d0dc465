//! Error types for the turn-taking pipeline.

use std::sync::Arc;

/// Top-level error type for the turn-taking core.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// A quest's `init` failed. Every task awaiting `get` sees the same cause.
    #[error("quest `{quest}` failed to initialize: {source}")]
    QuestInit {
        /// Role name of the quest.
        quest: String,
        /// The original init error.
        #[source]
        source: Arc<TurnError>,
    },

    /// A quest's `run` raised after the resource was ready.
    #[error("quest `{quest}` failed while running: {source}")]
    QuestRun {
        /// Role name of the quest.
        quest: String,
        /// The original run error.
        #[source]
        source: Arc<TurnError>,
    },

    /// A quest was torn down before its resource became available.
    #[error("quest `{0}` was closed before it became ready")]
    QuestClosed(String),

    /// Service discovery found no backend for a role (transient).
    #[error("no `{role}` backend available: {reason}")]
    BackendUnavailable {
        /// Role that was looked up (e.g. `"tts"`).
        role: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// An operation was attempted from a conversation state that does not allow it.
    #[error("invalid state transition: cannot {action} while {state}")]
    InvalidStateTransition {
        /// What was attempted.
        action: &'static str,
        /// The conversation state at the time.
        state: String,
    },

    /// A remote connection dropped mid-stream.
    #[error("stream closed: {0}")]
    StreamClosed(String),

    /// The operation was cancelled during interruption or teardown.
    #[error("operation cancelled")]
    Cancelled,

    /// Speech-to-text error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Text generation error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Audio frame did not match the configured format.
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    /// Malformed client message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TurnError {
    /// Returns `true` for errors expected during interruption or teardown.
    ///
    /// These are propagated upward but never reported as failures.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled | Self::QuestClosed(_) => true,
            Self::QuestInit { source, .. } | Self::QuestRun { source, .. } => {
                source.is_cancellation()
            }
            _ => false,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TurnError>;
