//! Default LLM configs loaded from environment variables.
//!
//! Two roles are used by the movie RAG:
//!
//! - **Chat**      → streaming answer generation
//! - **Embedding** → vectors for ingestion and queries (same model for both)
//!
//! # Environment variables
//!
//! - `OLLAMA_URL` or `OLLAMA_PORT` = endpoint (default `http://localhost:11434`)
//! - `OLLAMA_MODEL`      = chat model (mandatory)
//! - `LLM_TEMPERATURE`   = optional sampling temperature (default 0.2)
//! - `LLM_MAX_TOKENS`    = optional max tokens (u32)
//! - `LLM_TIMEOUT_SECS`  = optional connect/first-byte timeout (default 30)
//! - `EMBEDDING_MODEL`   = embedding model (default `mxbai-embed-large`)
//! - `EMBEDDING_TIMEOUT_SECS` = optional embedding request timeout (default 30)

use crate::{
    config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider},
    error_handler::{
        AiLlmError, ConfigError, env_opt_f32, env_opt_u32, env_opt_u64, env_or, must_env,
        validate_http_endpoint, validate_range_f32,
    },
};

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_EMBEDDING_MODEL: &str = "mxbai-embed-large";

/// Resolves the Ollama endpoint from environment.
///
/// Precedence:
/// 1. `OLLAMA_URL` if present and non-empty
/// 2. `OLLAMA_PORT` → `http://localhost:{port}`
/// 3. `http://localhost:11434`
///
/// # Errors
///
/// - [`ConfigError::InvalidNumber`] if `OLLAMA_PORT` is invalid
/// - [`ConfigError::InvalidFormat`] if `OLLAMA_URL` has no http(s) scheme
fn ollama_endpoint() -> Result<String, AiLlmError> {
    if let Ok(url) = std::env::var("OLLAMA_URL") {
        if !url.trim().is_empty() {
            validate_http_endpoint("OLLAMA_URL", &url)?;
            return Ok(url.trim().to_string());
        }
    }
    if let Ok(port) = std::env::var("OLLAMA_PORT") {
        if !port.trim().is_empty() {
            let _ = port
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: "OLLAMA_PORT",
                    reason: "expected u16 (1..=65535)",
                })?;
            return Ok(format!("http://localhost:{}", port.trim()));
        }
    }
    Ok(DEFAULT_OLLAMA_URL.to_string())
}

/// Default bound, in seconds, for opening a chat stream.
pub const DEFAULT_CHAT_OPEN_TIMEOUT_SECS: u64 = 10;

/// Constructs a config for the **chat** model used to stream answers.
///
/// # Env
/// - `OLLAMA_MODEL` (required)
/// - `LLM_TEMPERATURE`, `LLM_MAX_TOKENS`, `LLM_TIMEOUT_SECS` (optional)
///
/// # Defaults
/// - `temperature = Some(0.2)`
/// - `timeout_secs = Some(10)`: bounds opening the stream (until headers),
///   kept well below the generation timeout so an open can be retried.
pub fn config_ollama_chat() -> Result<LlmModelConfig, AiLlmError> {
    let endpoint = ollama_endpoint()?;
    let model = must_env("OLLAMA_MODEL")?;
    let max_tokens = env_opt_u32("LLM_MAX_TOKENS")?;
    let temperature = env_opt_f32("LLM_TEMPERATURE")?.unwrap_or(0.2);
    validate_range_f32("temperature", temperature, 0.0, 2.0)?;
    let timeout_secs = env_opt_u64("LLM_TIMEOUT_SECS")?.unwrap_or(DEFAULT_CHAT_OPEN_TIMEOUT_SECS);

    Ok(LlmModelConfig {
        provider: LlmProvider::Ollama,
        model,
        endpoint,
        api_key: std::env::var("OLLAMA_API_KEY").ok().filter(|k| !k.is_empty()),
        max_tokens,
        temperature: Some(temperature),
        top_p: None,
        timeout_secs: Some(timeout_secs),
    })
}

/// Constructs a config for the **embedding** model.
///
/// The same config must be used at ingestion and query time.
///
/// # Env
/// - `EMBEDDING_MODEL` (default `mxbai-embed-large`)
/// - `EMBEDDING_TIMEOUT_SECS` (default 30)
///
/// # Defaults
/// - `temperature = Some(0.0)` (deterministic)
pub fn config_ollama_embedding() -> Result<LlmModelConfig, AiLlmError> {
    let endpoint = ollama_endpoint()?;
    let model = env_or("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL);
    let timeout_secs = env_opt_u64("EMBEDDING_TIMEOUT_SECS")?.unwrap_or(30);

    Ok(LlmModelConfig {
        provider: LlmProvider::Ollama,
        model,
        endpoint,
        api_key: std::env::var("OLLAMA_API_KEY").ok().filter(|k| !k.is_empty()),
        max_tokens: None,
        temperature: Some(0.0),
        top_p: None,
        timeout_secs: Some(timeout_secs),
    })
}
