//! Shared LLM service with two active profiles: `chat` and `embedding`.
//!
//! - Lives in the same Tokio runtime as the application.
//! - Construct once, wrap in `Arc`, and pass clones to dependents.
//! - Caches underlying HTTP clients per config (endpoint+model+key+timeout).
//! - The embedding profile must be the same at ingestion and query time.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use ai_llm_service::service_profiles::LlmServiceProfiles;
//! use ai_llm_service::config::default_config::{config_ollama_chat, config_ollama_embedding};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let svc = Arc::new(LlmServiceProfiles::new(
//!         config_ollama_chat()?,
//!         config_ollama_embedding()?,
//!     )?);
//!
//!     let emb = svc.embed_batch(&["Ferris".to_string()]).await?;
//!     println!("Embedding dim = {}", emb[0].len());
//!     Ok(())
//! }
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    chat::ChatMessage,
    config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider},
    error_handler::{AiLlmError, ConfigError},
    services::ollama_service::{ChatFragmentStream, OllamaService},
};

/// Shared service that manages the **chat** and **embedding** profiles.
///
/// Internally, it caches Ollama clients keyed by their configuration to
/// avoid recreating HTTP clients on each call.
pub struct LlmServiceProfiles {
    chat: LlmModelConfig,
    embedding: LlmModelConfig,

    ollama: RwLock<HashMap<ClientKey, Arc<OllamaService>>>,
}

impl LlmServiceProfiles {
    /// Creates a new service with both profiles.
    ///
    /// # Errors
    /// Returns [`ConfigError::EmptyModel`] if a profile has no model name.
    pub fn new(chat: LlmModelConfig, embedding: LlmModelConfig) -> Result<Self, AiLlmError> {
        if chat.model.trim().is_empty() || embedding.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel.into());
        }
        Ok(Self {
            chat,
            embedding,
            ollama: RwLock::new(HashMap::new()),
        })
    }

    /// Chat profile config.
    pub fn chat_config(&self) -> &LlmModelConfig {
        &self.chat
    }

    /// Embedding profile config.
    pub fn embedding_config(&self) -> &LlmModelConfig {
        &self.embedding
    }

    /// Opens a streaming chat answer using the **chat** profile.
    ///
    /// The request is bounded by the profile timeout up to the response
    /// headers; pacing of the fragments is the caller's concern.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChatFragmentStream, AiLlmError> {
        let cli = self.client_for(&self.chat).await?;
        let fut = cli.chat_stream(messages);
        match self.chat.timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                tokio::time::timeout(limit, fut)
                    .await
                    .map_err(|_| AiLlmError::Timeout(limit))?
                    .map_err(AiLlmError::from)
            }
            None => fut.await.map_err(AiLlmError::from),
        }
    }

    /// Computes embeddings for a batch using the **embedding** profile.
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AiLlmError> {
        let cli = self.client_for(&self.embedding).await?;
        Ok(cli.embed_batch(inputs).await?)
    }

    async fn client_for(&self, cfg: &LlmModelConfig) -> Result<Arc<OllamaService>, AiLlmError> {
        match cfg.provider {
            LlmProvider::Ollama => self.get_or_init_ollama(cfg).await,
        }
    }

    async fn get_or_init_ollama(
        &self,
        cfg: &LlmModelConfig,
    ) -> Result<Arc<OllamaService>, AiLlmError> {
        let key = ClientKey::from(cfg);
        if let Some(cli) = self.ollama.read().await.get(&key).cloned() {
            return Ok(cli);
        }
        let mut w = self.ollama.write().await;
        if let Some(cli) = w.get(&key).cloned() {
            return Ok(cli);
        }
        debug!(model = %cfg.model, endpoint = %cfg.endpoint, "init ollama client");
        let cli = Arc::new(OllamaService::new(cfg.clone())?);
        w.insert(key, cli.clone());
        Ok(cli)
    }
}

/// Internal cache key to identify unique client configs.
#[derive(Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    provider: LlmProvider,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Option<u64>,
}

impl From<&LlmModelConfig> for ClientKey {
    fn from(cfg: &LlmModelConfig) -> Self {
        Self {
            provider: cfg.provider,
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            timeout: cfg.timeout_secs,
        }
    }
}
