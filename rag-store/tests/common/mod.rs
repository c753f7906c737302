#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rag_store::{
    Document, EmbedFuture, EmbeddingsProvider, HashEmbedder, IndexBackend, RagConfig, RagError,
    RagStore,
};

pub const DIM: usize = 256;

pub fn config(chunk_size: usize, overlap: usize) -> RagConfig {
    let mut cfg = RagConfig::new_default("http://localhost:6334", "movies-test", DIM);
    cfg.backend = IndexBackend::Memory;
    cfg.chunk_size = chunk_size;
    cfg.chunk_overlap = overlap;
    cfg.embedding_backoff = Duration::from_millis(1);
    cfg.embedding_backoff_max = Duration::from_millis(2);
    cfg
}

pub async fn store(chunk_size: usize, overlap: usize) -> RagStore {
    store_with(chunk_size, overlap, Arc::new(HashEmbedder::new(DIM))).await
}

pub async fn store_with(
    chunk_size: usize,
    overlap: usize,
    provider: Arc<dyn EmbeddingsProvider>,
) -> RagStore {
    RagStore::open(config(chunk_size, overlap), provider)
        .await
        .expect("memory store")
}

pub fn movie(id: &str, overview: &str, adult: bool) -> Document {
    let mut d = Document::new(id, format!("Movie {id}"), overview);
    d.is_adult = adult;
    d
}

/// Hash embeddings, except texts containing `poison` (permanent failure),
/// `flaky` (always transient) or `wide` (one component too many).
pub struct Scripted {
    inner: HashEmbedder,
}

impl Scripted {
    pub fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIM),
        }
    }
}

impl EmbeddingsProvider for Scripted {
    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
        Box::pin(async move {
            if text.contains("poison") {
                return Err(RagError::EmbeddingUnavailable {
                    attempts: 1,
                    reason: "model rejected input".into(),
                });
            }
            if text.contains("flaky") {
                return Err(RagError::Provider("503 Service Unavailable".into()));
            }
            let mut v = self.inner.embed_now(text);
            if text.contains("wide") {
                v.push(0.0);
            }
            Ok(v)
        })
    }
}
