//! Public request/answer types, shared with callers such as the CLI.

use ai_llm_service::ChatMessage;
use rag_store::{SearchFilter, SearchHit};
use serde::{Deserialize, Serialize};

use crate::stream::GenerationStream;

/// One question plus what the caller knows about the conversation.
///
/// Deserializes from the caller-facing shape:
/// ```
/// use contextor::AskRequest;
/// let req: AskRequest = serde_json::from_str(r#"{
///     "question": "Any heist movies?",
///     "conversationHistory": [{"role": "user", "content": "hi"}],
///     "filterHints": [{"field": "voteAverage", "operator": "range", "value": {"gte": 7}}]
/// }"#).unwrap();
/// assert_eq!(req.history.len(), 1);
/// assert!(req.filter.is_some());
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AskRequest {
    pub question: String,
    /// Prior user/assistant turns, oldest first. The question is appended.
    #[serde(default, rename = "conversationHistory")]
    pub history: Vec<ChatMessage>,
    #[serde(default, rename = "filterHints")]
    pub filter: Option<SearchFilter>,
    /// Overrides the configured top-k.
    #[serde(default, rename = "topK")]
    pub top_k: Option<usize>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }
}

/// A chunk that made it into the prompt.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsedChunk {
    pub chunk_id: String,
    pub document_id: Option<String>,
    pub title: Option<String>,
    pub score: f32,
}

impl From<&SearchHit> for UsedChunk {
    fn from(h: &SearchHit) -> Self {
        Self {
            chunk_id: h.chunk_id.clone(),
            document_id: h.document_id().map(str::to_string),
            title: h.title().map(str::to_string),
            score: h.score,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Nothing relevant survived retrieval and filtering.
    NoContext,
    /// Embedding or index failure while retrieving.
    RetrievalFailed,
}

pub enum Answer {
    /// Grounded answer; pull fragments from `stream`.
    Streaming {
        stream: GenerationStream,
        sources: Vec<UsedChunk>,
    },
    /// Fixed user-facing message; the model was not called.
    Fallback {
        message: String,
        reason: FallbackReason,
    },
}

impl Answer {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Answer::Fallback { .. })
    }
}

impl std::fmt::Debug for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Answer::Streaming { stream, sources } => f
                .debug_struct("Streaming")
                .field("state", &stream.state())
                .field("sources", sources)
                .finish(),
            Answer::Fallback { message, reason } => f
                .debug_struct("Fallback")
                .field("message", message)
                .field("reason", reason)
                .finish(),
        }
    }
}
