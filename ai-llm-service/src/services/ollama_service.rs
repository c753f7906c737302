//! Lightweight Ollama service for streaming chat and embeddings.
//!
//! This module implements a thin client for the local Ollama API:
//! - `POST {endpoint}/api/chat`: streaming chat (`stream=true`, NDJSON body)
//! - `POST {endpoint}/api/embed`: batched embeddings retrieval
//!
//! It uses the universal configuration [`LlmModelConfig`] and ensures
//! that the selected provider is [`LlmProvider::Ollama`].
//!
//! # Examples
//!
//! ```no_run
//! use ai_llm_service::chat::ChatMessage;
//! use ai_llm_service::config::llm_model_config::LlmModelConfig;
//! use ai_llm_service::config::llm_provider::LlmProvider;
//! use ai_llm_service::services::ollama_service::OllamaService;
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = LlmModelConfig {
//!     provider: LlmProvider::Ollama,
//!     model: "llama3.1".into(),
//!     endpoint: "http://localhost:11434".into(),
//!     api_key: None,
//!     max_tokens: Some(256),
//!     temperature: Some(0.2),
//!     top_p: None,
//!     timeout_secs: Some(30),
//! };
//!
//! let svc = OllamaService::new(cfg)?;
//! let mut stream = svc.chat_stream(&[ChatMessage::user("Who is HAL 9000?")]).await?;
//! while let Some(fragment) = stream.next().await {
//!     print!("{}", fragment?);
//! }
//! # Ok(()) }
//! ```

use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::chat::ChatMessage;
use crate::config::llm_model_config::LlmModelConfig;
use crate::config::llm_provider::LlmProvider;

/// Errors produced by [`OllamaService`].
#[derive(Debug, Error)]
pub enum OllamaError {
    /// The provider in the config is not Ollama.
    #[error("[AI LLM Service] invalid provider: expected Ollama, got different provider")]
    InvalidProvider,

    /// Invalid endpoint (empty or missing http/https).
    #[error("[AI LLM Service] invalid Ollama endpoint: {0}")]
    InvalidEndpoint(String),

    /// Transport/HTTP client error.
    #[error("[AI LLM Service] transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-successful HTTP status from upstream.
    #[error("[AI LLM Service] unexpected HTTP status {status} from {url}: {snippet}")]
    HttpStatus {
        /// Numeric HTTP status code.
        status: StatusCode,
        /// Request URL.
        url: String,
        /// Optional short snippet of the response body.
        snippet: String,
    },

    /// Upstream reported an error inside an otherwise successful stream.
    #[error("[AI LLM Service] upstream error: {0}")]
    Upstream(String),

    /// Unexpected/invalid JSON response.
    #[error("[AI LLM Service] failed to decode response: {0}")]
    Decode(String),
}

impl OllamaError {
    /// Transport failures, `429` and `5xx` are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            OllamaError::Transport(_) => true,
            OllamaError::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }
}

/// Result alias for Ollama operations.
pub type Result<T> = std::result::Result<T, OllamaError>;

/// Incremental text fragments of a streamed chat answer.
pub type ChatFragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Thin client for Ollama.
///
/// Initialized with a full [`LlmModelConfig`]. Two HTTP clients are kept:
/// the embedding one applies `timeout_secs` to the whole request, the chat
/// one only to connecting, since a streamed answer may legitimately take longer.
pub struct OllamaService {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    cfg: LlmModelConfig,
    url_chat: String,
    url_embed: String,
}

impl OllamaService {
    /// Creates a new [`OllamaService`] from the given config.
    ///
    /// # Errors
    /// - [`OllamaError::InvalidProvider`] if `cfg.provider` is not `Ollama`
    /// - [`OllamaError::InvalidEndpoint`] if `cfg.endpoint` is invalid
    /// - [`OllamaError::Transport`] if HTTP client cannot be built
    pub fn new(cfg: LlmModelConfig) -> Result<Self> {
        if cfg.provider != LlmProvider::Ollama {
            return Err(OllamaError::InvalidProvider);
        }

        let endpoint = cfg.endpoint.trim();
        if endpoint.is_empty()
            || !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(OllamaError::InvalidEndpoint(cfg.endpoint));
        }

        let timeout = cfg
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;

        let base = endpoint.trim_end_matches('/').to_string();
        let url_chat = format!("{}/api/chat", base);
        let url_embed = format!("{}/api/embed", base);

        Ok(Self {
            client,
            stream_client,
            cfg,
            url_chat,
            url_embed,
        })
    }

    /// Opens a **streaming** chat request via `/api/chat`.
    ///
    /// Resolves once the response headers arrive. The returned stream yields
    /// each non-empty `message.content` fragment in arrival order and ends
    /// after the upstream `done: true` line. Dropping the stream closes the
    /// underlying connection.
    ///
    /// # Errors
    /// - [`OllamaError::HttpStatus`] for non-2xx responses
    /// - [`OllamaError::Transport`] for client errors
    #[instrument(skip_all, fields(model = %self.cfg.model, turns = messages.len()))]
    pub async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatFragmentStream> {
        let body = ChatRequest::from_cfg(&self.cfg, messages);

        debug!("POST {}", self.url_chat);
        let resp = self
            .stream_client
            .post(&self.url_chat)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error(resp, &self.url_chat).await);
        }

        Ok(decode_chat_ndjson(resp.bytes_stream()))
    }

    /// Retrieves embeddings for a batch of inputs via `/api/embed`.
    ///
    /// Output order matches input order.
    ///
    /// # Errors
    /// - [`OllamaError::HttpStatus`] for non-2xx responses
    /// - [`OllamaError::Transport`] for client errors
    /// - [`OllamaError::Decode`] if the response cannot be parsed or the
    ///   number of vectors differs from the number of inputs
    #[instrument(skip_all, fields(model = %self.cfg.model, batch = inputs.len()))]
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbedRequest {
            model: &self.cfg.model,
            input: inputs,
        };

        debug!("POST {}", self.url_embed);
        let resp = self
            .client
            .post(&self.url_embed)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error(resp, &self.url_embed).await);
        }

        let out: EmbedResponse = resp.json().await.map_err(|e| {
            OllamaError::Decode(format!(
                "serde error: {e}; expected `{{ embeddings: number[][] }}`"
            ))
        })?;

        if out.embeddings.len() != inputs.len() {
            return Err(OllamaError::Decode(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                out.embeddings.len()
            )));
        }
        Ok(out.embeddings)
    }
}

async fn status_error(resp: reqwest::Response, url: &str) -> OllamaError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let snippet = text.chars().take(240).collect::<String>();
    OllamaError::HttpStatus {
        status,
        url: url.to_string(),
        snippet,
    }
}

/* ==========================
NDJSON chat stream decoding
========================== */

struct NdjsonState {
    body: BoxStream<'static, std::result::Result<Vec<u8>, reqwest::Error>>,
    buf: Vec<u8>,
    eof: bool,
    finished: bool,
}

enum ChatLine {
    Fragment(String),
    Done(Option<String>),
    Skip,
}

/// Turns an Ollama `/api/chat` NDJSON body into a stream of text fragments.
///
/// Lines may be split across body chunks arbitrarily. The stream ends after
/// the line carrying `done: true`; an `{"error": ...}` line or an EOF before
/// `done` yields exactly one error and then ends.
pub fn decode_chat_ndjson<S, B>(body: S) -> ChatFragmentStream
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = NdjsonState {
        body: body.map(|r| r.map(|b| b.as_ref().to_vec())).boxed(),
        buf: Vec::new(),
        eof: false,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                match parse_chat_line(&line) {
                    Ok(ChatLine::Skip) => continue,
                    Ok(ChatLine::Fragment(s)) => return Some((Ok(s), st)),
                    Ok(ChatLine::Done(tail)) => {
                        st.finished = true;
                        return tail.map(|s| (Ok(s), st));
                    }
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                }
            }
            if st.eof {
                if st.buf.iter().any(|b| !b.is_ascii_whitespace()) {
                    // last line without a trailing newline
                    st.buf.push(b'\n');
                    continue;
                }
                st.finished = true;
                return Some((
                    Err(OllamaError::Decode("chat stream ended before `done`".into())),
                    st,
                ));
            }
            match st.body.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(OllamaError::Transport(e)), st));
                }
                None => st.eof = true,
            }
        }
    }))
}

fn parse_chat_line(line: &[u8]) -> Result<ChatLine> {
    let text = std::str::from_utf8(line)
        .map_err(|e| OllamaError::Decode(format!("invalid utf-8 in chat stream: {e}")))?
        .trim();
    if text.is_empty() {
        return Ok(ChatLine::Skip);
    }
    trace!(line = text, "chat stream line");

    let chunk: ChatChunk = serde_json::from_str(text)
        .map_err(|e| OllamaError::Decode(format!("serde error: {e}; line = {text}")))?;

    if let Some(err) = chunk.error {
        return Err(OllamaError::Upstream(err));
    }
    let content = chunk
        .message
        .map(|m| m.content)
        .filter(|c| !c.is_empty());

    if chunk.done {
        Ok(ChatLine::Done(content))
    } else {
        Ok(content.map_or(ChatLine::Skip, ChatLine::Fragment))
    }
}

/* ==========================
HTTP payloads & options
========================== */

/// Request body for `/api/chat` (streaming).
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

impl<'a> ChatRequest<'a> {
    /// Builds a request from config and conversation.
    fn from_cfg(cfg: &'a LlmModelConfig, messages: &'a [ChatMessage]) -> Self {
        let options = ChatOptions {
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            num_predict: cfg.max_tokens,
        };

        Self {
            model: &cfg.model,
            messages,
            stream: true,
            options: Some(options),
        }
    }
}

/// Subset of Ollama `options`.
#[derive(Debug, Default, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// One NDJSON line of a streamed `/api/chat` response.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunkMessage {
    #[serde(default)]
    content: String,
}

/// Request body for `/api/embed`.
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response body for `/api/embed`.
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&'static str]) -> impl Stream<Item = std::result::Result<&'static [u8], reqwest::Error>> + Send + 'static {
        let items: Vec<_> = chunks.iter().copied().map(|c| Ok(c.as_bytes())).collect();
        stream::iter(items)
    }

    async fn collect(s: ChatFragmentStream) -> Vec<std::result::Result<String, String>> {
        s.map(|r| r.map_err(|e| e.to_string())).collect().await
    }

    #[tokio::test]
    async fn fragments_arrive_in_order_and_stop_at_done() {
        let s = decode_chat_ndjson(body(&[
            "{\"message\":{\"role\":\"assistant\",\"content\":\"HAL \"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"is \"},\"done\":false}\n{\"message\":{\"role\":\"assistant\",\"content\":\"a computer\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"ignored\"},\"done\":false}\n",
        ]));
        let out = collect(s).await;
        assert_eq!(
            out,
            vec![
                Ok("HAL ".to_string()),
                Ok("is ".to_string()),
                Ok("a computer".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let s = decode_chat_ndjson(body(&[
            "{\"message\":{\"content\":\"Dave",
            "\"},\"done\":false}\n{\"done\":",
            "true}",
        ]));
        assert_eq!(collect(s).await, vec![Ok("Dave".to_string())]);
    }

    #[tokio::test]
    async fn error_line_yields_single_error() {
        let s = decode_chat_ndjson(body(&[
            "{\"message\":{\"content\":\"partial\"},\"done\":false}\n",
            "{\"error\":\"model crashed\"}\n",
            "{\"message\":{\"content\":\"never\"},\"done\":false}\n",
        ]));
        let out = collect(s).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Ok("partial".to_string()));
        assert!(out[1].as_ref().unwrap_err().contains("model crashed"));
    }

    #[tokio::test]
    async fn eof_before_done_is_an_error() {
        let s = decode_chat_ndjson(body(&["{\"message\":{\"content\":\"cut\"},\"done\":false}\n"]));
        let out = collect(s).await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }

    #[test]
    fn transient_statuses() {
        let e = |status| OllamaError::HttpStatus {
            status,
            url: String::new(),
            snippet: String::new(),
        };
        assert!(e(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(e(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!e(StatusCode::BAD_REQUEST).is_transient());
        assert!(!OllamaError::Decode("x".into()).is_transient());
    }
}
