//! Bambola: turn-taking core of a real-time spoken-dialogue agent.
//!
//! The crate decides who may speak and when. It does not recognize or
//! synthesize speech itself; recognizers, synthesizers and text generators
//! plug in behind traits:
//!
//! - **Quests** ([`quest`]): supervised `init → run → close` lifecycles, one
//!   per backend role, replaceable and cancellable.
//! - **Pause estimation** ([`vad`]): smoothed pause score plus a silence
//!   counter that decides when the user has finished a turn.
//! - **Conversation** ([`conversation`]): the chat history, from which the
//!   conversation state is derived.
//! - **Orchestration** ([`pipeline::TurnCoordinator`]): audio in, events and
//!   synthesized audio out, interruption with an outbound-queue swap, and
//!   buffered ("bambola") playback.

pub mod config;
pub mod conversation;
pub mod discovery;
pub mod error;
pub mod host;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod quest;
pub mod recorder;
pub mod runtime;
pub mod stt;
pub mod timer;
pub mod tts;
pub mod vad;

pub use config::BambolaConfig;
pub use conversation::{ChatMessage, Chatbot, ConversationState, Role};
pub use error::{Result, TurnError};
pub use pipeline::coordinator::TurnCoordinator;
pub use quest::{Quest, QuestManager, QuestSpec, QuestState};
pub use runtime::{OutputItem, ServerEvent};
