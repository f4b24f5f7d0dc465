//! The turn-taking pipeline: orchestrator, outbound queue, word chunking and
//! buffered playback.

pub mod coordinator;
pub mod messages;
pub mod outbox;
pub mod playback;
pub mod words;

pub use coordinator::{LLM_QUEST, STT_QUEST, TTS_QUEST, TurnCoordinator};
pub use messages::{AudioFrame, Transcription, TtsClientMessage, TtsMessage};
pub use outbox::{Outbox, OutboxSender};
pub use playback::{BambolaBufferState, PlaybackFlush};
