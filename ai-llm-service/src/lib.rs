//! Shared LLM service used by the movie RAG crates.
//!
//! - [`config`]: model configuration and env-driven defaults.
//! - [`services::ollama_service`]: thin Ollama client (embeddings + streaming chat).
//! - [`service_profiles`]: chat/embedding profiles sharing cached HTTP clients.
//! - [`telemetry`]: tracing layer helpers for binaries.

pub mod chat;
pub mod config;
pub mod error_handler;
pub mod service_profiles;
pub mod services;
pub mod telemetry;

pub use chat::{ChatMessage, ChatRole};
pub use error_handler::AiLlmError;
pub use service_profiles::LlmServiceProfiles;
