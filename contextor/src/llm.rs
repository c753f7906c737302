//! Chat model seam: anything that can open a fragment stream for a message list.

use std::pin::Pin;
use std::sync::Arc;

use ai_llm_service::{ChatMessage, LlmServiceProfiles};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::ContextorError;

/// Ordered answer fragments from one model call.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ContextorError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Opens a streamed answer. Resolves once the model has accepted the
    /// request; fragments arrive through the returned stream.
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream, ContextorError>;
}

/// Ollama `/api/chat` behind the chat profile.
pub struct OllamaChat {
    profiles: Arc<LlmServiceProfiles>,
}

impl OllamaChat {
    pub fn new(profiles: Arc<LlmServiceProfiles>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream, ContextorError> {
        debug!(
            model = %self.profiles.chat_config().model,
            messages = messages.len(),
            "ollama chat stream"
        );
        let upstream = self.profiles.chat_stream(&messages).await?;
        Ok(Box::pin(upstream.map(|item| {
            item.map_err(|e| ContextorError::Llm(e.into()))
        })))
    }
}
