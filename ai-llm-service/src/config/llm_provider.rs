/// Represents the provider (backend) used for model inference.
///
/// Only a local/remote Ollama runtime is wired today. Adding more providers
/// is done by extending this enum and teaching
/// [`LlmServiceProfiles`](crate::service_profiles::LlmServiceProfiles) how to
/// build a client for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmProvider {
    /// Ollama runtime (`/api/embed`, `/api/chat`).
    Ollama,
}
