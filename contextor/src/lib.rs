//! Movie question answering on top of `rag-store`.
//!
//! Public API: [`Contextor::ask`]. It retrieves the top-k movie chunks for a
//! question, bounds them into a context block, and returns either a lazy,
//! cancellable [`GenerationStream`] or the fixed fallback answer when nothing
//! relevant was found.

mod api_types;
mod cfg;
mod error;
mod llm;
mod prompt;
mod stream;

pub use api_types::{Answer, AskRequest, FallbackReason, UsedChunk};
pub use cfg::{ContextorConfig, DEFAULT_FALLBACK};
pub use error::ContextorError;
pub use llm::{ChatModel, FragmentStream, OllamaChat};
pub use prompt::{ConversationContext, DEFAULT_SYSTEM};
pub use stream::{CancelHandle, GenerationStream, Generator, StreamState};

use std::sync::Arc;

use ai_llm_service::ChatMessage;
use rag_store::{RagError, RagStore, SearchFilter, keys};
use tracing::{error, info, instrument};

/// Retrieval plus generation over one store and one chat model.
pub struct Contextor {
    rag: Arc<RagStore>,
    generator: Generator,
    cfg: ContextorConfig,
}

impl Contextor {
    pub fn new(rag: Arc<RagStore>, model: Arc<dyn ChatModel>, cfg: ContextorConfig) -> Self {
        let generator = Generator::from_config(model, &cfg);
        Self { rag, generator, cfg }
    }

    pub fn config(&self) -> &ContextorConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<RagStore> {
        &self.rag
    }

    /// Message to show when a stream ends in failure.
    pub fn fallback_answer(&self) -> &str {
        &self.cfg.fallback_answer
    }

    /// Answers a question.
    ///
    /// Adult titles are excluded unless the request filter already constrains
    /// `isAdult`. Embedding and index failures are logged and turned into the
    /// fallback answer, so only caller mistakes surface as errors.
    ///
    /// # Errors
    /// [`ContextorError::InvalidArgument`] for a blank question or `top_k == 0`,
    /// [`ContextorError::InvalidConversation`] for system turns in the history.
    ///
    /// # Example
    /// ```no_run
    /// # use contextor::{Answer, AskRequest, Contextor};
    /// # async fn demo(ctx: &Contextor) -> Result<(), contextor::ContextorError> {
    /// match ctx.ask(AskRequest::new("A movie about a heist?")).await? {
    ///     Answer::Streaming { mut stream, .. } => {
    ///         while let Some(fragment) = stream.next_fragment().await {
    ///             print!("{}", fragment?);
    ///         }
    ///     }
    ///     Answer::Fallback { message, .. } => println!("{message}"),
    /// }
    /// # Ok(()) }
    /// ```
    #[instrument(skip_all, fields(history = req.history.len()))]
    pub async fn ask(&self, req: AskRequest) -> Result<Answer, ContextorError> {
        let question = req.question.trim();
        if question.is_empty() {
            return Err(ContextorError::InvalidArgument("question is empty".into()));
        }
        let k = req.top_k.unwrap_or(self.cfg.top_k);
        if k == 0 {
            return Err(ContextorError::InvalidArgument("top_k must be >= 1".into()));
        }

        let filter = with_adult_guard(req.filter.unwrap_or_default());
        let hits = match self.rag.retriever().retrieve(question, &filter, k).await {
            Ok(hits) => hits,
            Err(e @ RagError::InvalidArgument(_)) => return Err(e.into()),
            Err(e) => {
                error!(error = %e, "retrieval failed");
                return Ok(self.fallback(FallbackReason::RetrievalFailed));
            }
        };

        let block = self.rag.retriever().build_context(hits);
        if block.is_empty() {
            info!("no context for question");
            return Ok(self.fallback(FallbackReason::NoContext));
        }
        info!(
            included = block.included.len(),
            dropped = block.dropped,
            chars = block.text.chars().count(),
            "context built"
        );

        let sources = block.included.iter().map(UsedChunk::from).collect();
        let mut history = req.history;
        history.push(ChatMessage::user(question));
        let conversation = ConversationContext::new(self.cfg.system_prompt.clone(), &block, history);
        let stream = self.generator.generate(conversation)?;
        Ok(Answer::Streaming { stream, sources })
    }

    fn fallback(&self, reason: FallbackReason) -> Answer {
        Answer::Fallback {
            message: self.cfg.fallback_answer.clone(),
            reason,
        }
    }
}

/// Adds `isAdult == false` unless the caller already decided on adult titles.
pub fn with_adult_guard(filter: SearchFilter) -> SearchFilter {
    if filter.constrains(keys::IS_ADULT) {
        filter
    } else {
        filter.matches(keys::IS_ADULT, false)
    }
}
