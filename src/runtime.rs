//! Outbound events and items produced by the turn orchestrator.
//!
//! Everything the transport layer needs to forward to the client leaves the
//! orchestrator as an [`OutputItem`]: a typed JSON event, a PCM frame, a chat
//! snapshot, or a close signal.

use crate::conversation::{ChatMessage, ConversationState};
use crate::pipeline::messages::AudioFrame;
use serde::{Deserialize, Serialize};

/// Realtime-API style server events, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A response has started generating.
    #[serde(rename = "response.created")]
    ResponseCreated {
        /// The response being generated.
        response: Response,
    },
    /// A word of generated text, before it reaches the synthesizer.
    #[serde(rename = "unmute.response.text.delta.ready")]
    ResponseTextDeltaReady {
        /// The word, including leading whitespace.
        delta: String,
    },
    /// Text aligned with synthesized audio.
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta {
        /// Spoken text fragment.
        delta: String,
    },
    /// The generator finished; carries the full reply.
    #[serde(rename = "response.text.done")]
    ResponseTextDone {
        /// Concatenated generated text.
        text: String,
    },
    /// All audio for the response has been emitted.
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,
    /// The user started a new utterance.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    /// A pause was declared.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    /// Transcribed user speech.
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        /// Transcribed text.
        delta: String,
        /// Recognizer clock at which the text starts.
        start_time: f64,
    },
    /// The bot was interrupted; queued audio was discarded.
    #[serde(rename = "unmute.interrupted_by_vad")]
    InterruptedByVad,
    /// A buffered reply is complete and about to play.
    #[serde(rename = "unmute.bambola.buffer_ready")]
    BufferReady {
        /// Total samples in the buffered reply.
        buffer_size: usize,
        /// What the user said.
        transcription: String,
        /// What the agent answered.
        llm_response: String,
    },
    /// Buffered chunks follow.
    #[serde(rename = "unmute.bambola.playback_started")]
    PlaybackStarted,
    /// All buffered chunks were emitted.
    #[serde(rename = "unmute.bambola.playback_completed")]
    PlaybackCompleted,
    /// A warning or error for the client.
    #[serde(rename = "error")]
    Error {
        /// Error details.
        error: ErrorDetail,
    },
}

impl ServerEvent {
    /// Non-fatal advisory for the client.
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorDetail {
                kind: "warning".to_owned(),
                message: message.into(),
            },
        }
    }

    /// The current turn failed; the session continues.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorDetail {
                kind: "server_error".to_owned(),
                message: message.into(),
            },
        }
    }
}

/// Payload of `response.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Unique response id.
    pub id: String,
    /// Always `"in_progress"` when created.
    pub status: String,
    /// Voice used for synthesis.
    pub voice: String,
    /// History at the moment the response started.
    pub chat_history: Vec<ChatMessage>,
}

impl Response {
    /// A fresh in-progress response with a random id.
    pub fn in_progress(voice: impl Into<String>, chat_history: Vec<ChatMessage>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: "in_progress".to_owned(),
            voice: voice.into(),
            chat_history,
        }
    }
}

/// Payload of an `error` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// `"warning"` or `"server_error"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable text.
    pub message: String,
}

/// Latencies of the current turn, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnTiming {
    /// Response start to first generated word.
    pub to_first_token: Option<f64>,
    /// First word sent to the synthesizer to first audio back.
    pub tts_audio: Option<f64>,
    /// Last recognized speech to pause declaration.
    pub pause_detection: Option<f64>,
    /// Duration of the recognizer flush.
    pub flush: Option<f64>,
}

/// Synthesizer throughput of the current response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsThroughput {
    /// Seconds of audio received from the synthesizer.
    pub time_received: f64,
    /// Received-audio seconds since the first chunk arrived.
    pub time_since_start: f64,
    /// `time_received / time_since_start`; above 1 means faster than real time.
    pub ratio: f64,
}

/// Debug view of the session, passed by value in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSnapshot {
    /// Derived conversation state.
    pub conversation_state: ConversationState,
    /// Recognizer connection state, or `"none"`.
    pub stt_connection: String,
    /// Synthesizer connection state, or `"none"`.
    pub tts_connection: String,
    /// Active synthesizer voice, or `"none"`.
    pub tts_voice: String,
    /// Current smoothed pause prediction.
    pub pause_prediction: f32,
    /// Received-audio clock at the last `receive`.
    pub last_receive_time: f64,
    /// Recognizer seconds since the last transcribed text.
    pub time_since_last_message: Option<f64>,
    /// Latencies of the current turn.
    pub timing: TurnTiming,
    /// Synthesizer throughput of the current response.
    pub tts_throughput: Option<TtsThroughput>,
}

impl Default for DebugSnapshot {
    fn default() -> Self {
        Self {
            conversation_state: ConversationState::WaitingForUser,
            stt_connection: "none".to_owned(),
            tts_connection: "none".to_owned(),
            tts_voice: "none".to_owned(),
            pause_prediction: 0.0,
            last_receive_time: 0.0,
            time_since_last_message: None,
            timing: TurnTiming::default(),
            tts_throughput: None,
        }
    }
}

/// Chat history plus debug state, as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    /// History without the system message.
    pub chat_history: Vec<ChatMessage>,
    /// Debug view at the time of the snapshot.
    pub debug: DebugSnapshot,
}

/// One item on the outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    /// A JSON event.
    Event(ServerEvent),
    /// PCM to play.
    Audio(AudioFrame),
    /// Chat and debug snapshot.
    Snapshot(ChatSnapshot),
    /// The session should end.
    Close(String),
}

impl From<ServerEvent> for OutputItem {
    fn from(event: ServerEvent) -> Self {
        Self::Event(event)
    }
}

impl From<AudioFrame> for OutputItem {
    fn from(frame: AudioFrame) -> Self {
        Self::Audio(frame)
    }
}
