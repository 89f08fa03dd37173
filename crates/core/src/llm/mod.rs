pub mod error;
pub mod openai;
pub mod sse;

use std::pin::Pin;

use futures_util::Stream;

use crate::domain::message::ChatMessage;

/// Text tokens in provider order; the stream ends when the provider
/// signals completion.
pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

#[derive(Debug, Clone, Copy)]
pub enum Provider {
    OpenAi,
}

#[derive(Debug, Clone)]
pub struct ChatInput {
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Opens a live completion stream. Errors raised here happen before any
    /// token is produced, so callers can still fail the whole request.
    async fn stream_chat(&self, input: ChatInput) -> anyhow::Result<TokenStream>;
}
