use crate::errors::RagError;
use std::{future::Future, pin::Pin};

/// Boxed future returned by [`EmbeddingsProvider`] methods.
pub type EmbedFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RagError>> + Send + 'a>>;

/// Provider interface for embedding generation.
///
/// Async is required because real providers perform HTTP requests. The same
/// provider (model and dimension) must serve ingestion and queries.
///
/// Errors should be classified: transient failures as [`RagError::Provider`]
/// (retried by [`crate::Embedder`]), permanent ones as
/// [`RagError::EmbeddingUnavailable`].
pub trait EmbeddingsProvider: Send + Sync {
    /// Embeds a single text.
    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>>;

    /// Embeds many texts, output order matching input order.
    ///
    /// The default issues one [`embed`](Self::embed) call per text.
    fn embed_batch<'a>(&'a self, texts: &'a [String]) -> EmbedFuture<'a, Vec<Vec<f32>>> {
        Box::pin(async move {
            let mut out = Vec::with_capacity(texts.len());
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        })
    }
}

pub mod hashing;
pub mod ollama;
