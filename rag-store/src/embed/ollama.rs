//! Ollama embedding provider implementation.
//!
//! Delegates to the shared [`LlmServiceProfiles`] embedding profile
//! (`/api/embed`, batched).

use std::sync::Arc;

use ai_llm_service::{AiLlmError, service_profiles::LlmServiceProfiles};
use tracing::debug;

use super::{EmbedFuture, EmbeddingsProvider};
use crate::errors::RagError;

/// Ollama embedding provider (async).
#[derive(Clone)]
pub struct OllamaEmbedder {
    svc: Arc<LlmServiceProfiles>,
}

impl OllamaEmbedder {
    pub fn new(svc: Arc<LlmServiceProfiles>) -> Self {
        Self { svc }
    }
}

fn classify(e: AiLlmError) -> RagError {
    if e.is_transient() {
        RagError::Provider(e.to_string())
    } else {
        RagError::EmbeddingUnavailable {
            attempts: 1,
            reason: e.to_string(),
        }
    }
}

impl EmbeddingsProvider for OllamaEmbedder {
    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
        Box::pin(async move {
            let mut out = self.embed_batch_inner(&[text.to_string()]).await?;
            out.pop().ok_or_else(|| RagError::EmbeddingUnavailable {
                attempts: 1,
                reason: "empty embeddings response".into(),
            })
        })
    }

    fn embed_batch<'a>(&'a self, texts: &'a [String]) -> EmbedFuture<'a, Vec<Vec<f32>>> {
        Box::pin(self.embed_batch_inner(texts))
    }
}

impl OllamaEmbedder {
    async fn embed_batch_inner(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        debug!(
            "OllamaEmbedder::embed_batch n={} model={}",
            texts.len(),
            self.svc.embedding_config().model
        );
        self.svc.embed_batch(texts).await.map_err(classify)
    }
}
