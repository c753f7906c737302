//! Typed error for the contextor crate.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextorError {
    /// Errors from the underlying rag-store crate.
    #[error("RAG error: {0}")]
    Rag(#[from] rag_store::RagError),

    /// Errors from the language model client.
    #[error("LLM error: {0}")]
    Llm(#[from] ai_llm_service::AiLlmError),

    /// Conversation cannot be sent to the model (empty, or carries system turns).
    #[error("invalid conversation: {0}")]
    InvalidConversation(String),

    /// Caller argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Upstream model failed; fragments already delivered stay delivered.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// No response or next fragment within the generation timeout.
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration at startup.
    #[error("config error: {0}")]
    Config(String),
}

impl ContextorError {
    /// Whether opening the stream again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ContextorError::Llm(e) => e.is_transient(),
            ContextorError::Rag(e) => e.is_retryable(),
            _ => false,
        }
    }
}
