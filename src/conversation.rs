//! Chat history and the conversation state derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Appended to the assistant message when the user cuts the bot off.
pub const INTERRUPTION_CHAR: &str = "—";

/// Injected as a user message after a long silence.
pub const USER_SILENCE_MARKER: &str = "...";

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human talking to the doll.
    User,
    /// The agent.
    Assistant,
    /// Instructions for the response generator.
    System,
}

/// One entry of the chat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who said it.
    pub role: Role,
    /// Accumulated text; empty marks "a new turn has begun for this role".
    pub content: String,
}

impl ChatMessage {
    /// Build a message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Who holds the floor. Always derived from the history tail, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Nobody is talking; the agent waits for the user.
    WaitingForUser,
    /// The user has said something that has not been answered yet.
    UserSpeaking,
    /// The agent is generating or speaking a reply.
    BotSpeaking,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::WaitingForUser => "waiting_for_user",
            Self::UserSpeaking => "user_speaking",
            Self::BotSpeaking => "bot_speaking",
        };
        f.write_str(label)
    }
}

/// Conversation tracker: owns the chat history.
#[derive(Debug, Clone)]
pub struct Chatbot {
    chat_history: Vec<ChatMessage>,
}

impl Chatbot {
    /// Start a history holding only the system instructions.
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            chat_history: vec![ChatMessage::new(Role::System, instructions)],
        }
    }

    /// Replace the system instructions.
    pub fn set_instructions(&mut self, instructions: impl Into<String>) {
        let instructions = instructions.into();
        match self.chat_history.first_mut() {
            Some(first) if first.role == Role::System => first.content = instructions,
            _ => self
                .chat_history
                .insert(0, ChatMessage::new(Role::System, instructions)),
        }
    }

    /// Current system instructions, if any.
    pub fn instructions(&self) -> Option<&str> {
        self.chat_history
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Full history, including the system message.
    pub fn chat_history(&self) -> &[ChatMessage] {
        &self.chat_history
    }

    /// Number of messages, including the system message.
    pub fn len(&self) -> usize {
        self.chat_history.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.chat_history.is_empty()
    }

    /// Derive the conversation state from the last message.
    pub fn conversation_state(&self) -> ConversationState {
        match self.chat_history.last() {
            None => ConversationState::WaitingForUser,
            Some(m) => match m.role {
                Role::System => ConversationState::WaitingForUser,
                Role::Assistant => ConversationState::BotSpeaking,
                Role::User if m.content.trim().is_empty() => ConversationState::WaitingForUser,
                Role::User => ConversationState::UserSpeaking,
            },
        }
    }

    /// Append streamed text to the history.
    ///
    /// A delta from a new role starts a new message; otherwise it is joined
    /// onto the last one, with a space between words when neither side
    /// carries whitespace. Returns `true` when the delta starts a new spoken
    /// message.
    ///
    /// `generating_message_i` is the history length when the response that
    /// produced this delta started. Once the history has grown past it, the
    /// delta targets a stale message and is dropped.
    pub fn add_chat_message_delta(
        &mut self,
        delta: &str,
        role: Role,
        generating_message_i: Option<usize>,
    ) -> bool {
        if let Some(i) = generating_message_i {
            if self.chat_history.len() > i {
                warn!(
                    history_len = self.chat_history.len(),
                    generating_message_i = i,
                    "dropping delta for a message that is no longer live"
                );
                return false;
            }
        }

        match self.chat_history.last_mut() {
            Some(last) if last.role == role => {
                let was_empty = last.content.is_empty();
                let needs_space = !was_empty
                    && !delta.is_empty()
                    && !last.content.ends_with(char::is_whitespace)
                    && !delta.starts_with(char::is_whitespace);
                if needs_space {
                    last.content.push(' ');
                }
                last.content.push_str(delta);
                was_empty
            }
            _ => {
                self.chat_history.push(ChatMessage::new(role, delta));
                true
            }
        }
    }

    /// Content of the most recent message from `role`.
    pub fn last_message(&self, role: Role) -> Option<&str> {
        self.chat_history
            .iter()
            .rev()
            .find(|m| m.role == role)
            .map(|m| m.content.as_str())
    }

    /// Messages to send to the response generator.
    ///
    /// Keeps the system prompt and every non-empty message. The interruption
    /// marker stays so the generator can tell it was cut off.
    pub fn preprocessed_messages(&self) -> Vec<ChatMessage> {
        self.chat_history
            .iter()
            .filter(|m| m.role == Role::System || !m.content.trim().is_empty())
            .cloned()
            .collect()
    }

    /// History without the system message, as shown to clients.
    pub fn visible_history(&self) -> Vec<ChatMessage> {
        self.chat_history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect()
    }
}
