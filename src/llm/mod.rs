//! Response generator interface.

use crate::conversation::ChatMessage;
use crate::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Lazily produced text fragments. Finite and not restartable.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A chat-completion backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Start generating a reply to `messages`.
    ///
    /// The returned stream yields text fragments of any size; the
    /// orchestrator re-chunks them into words.
    async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
    ) -> Result<TextStream>;
}
