//! Movie RAG core: ingestion + retrieval over a vector index.
//!
//! This crate provides:
//! - [`Chunker`]: recursive character chunking with overlap
//! - [`Embedder`]: retrying, bounded, order-preserving embedding executor
//! - [`VectorIndex`]: idempotent upsert + filtered top-k search, with
//!   [`MemoryIndex`] and [`QdrantIndex`] backends
//! - [`IngestionPipeline`]: documents → chunks → vectors → index, partial-failure reporting
//! - [`RetrievalOrchestrator`]: question → hits → bounded context block
//!
//! [`RagStore`] wires them from one [`RagConfig`].

mod chunker;
mod config;
mod embed;
mod embed_pool;
mod errors;
mod filters;
mod index;
mod ingest;
mod progress;
mod record;
mod retrieve;
mod source;

pub use chunker::{ChunkSpan, Chunker, reconstruct};
pub use config::{DistanceKind, IndexBackend, IngestMode, RagConfig, VectorSpace};
pub use embed::{EmbedFuture, EmbeddingsProvider, hashing::HashEmbedder, ollama::OllamaEmbedder};
pub use embed_pool::{Embedder, RetryPolicy, retry_with_policy};
pub use errors::RagError;
pub use filters::{FieldPredicate, FilterOp, SearchFilter};
pub use index::{VectorIndex, memory::MemoryIndex, qdrant::QdrantIndex};
pub use ingest::{IngestFailure, IngestReport, IngestionPipeline};
pub use progress::{IndicatifProgress, NoopProgress, Progress};
pub use record::{Chunk, Document, IndexEntry, Metadata, SearchHit, chunk_id, keys};
pub use retrieve::{CONTEXT_HEADER_OVERHEAD, ContextBlock, RetrievalOrchestrator};
pub use source::{SourceBatch, document_from_value, parse_documents, read_documents};

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

/// High-level facade that wires configuration, embedder and index.
///
/// Construct once at startup and share; every component is injected, nothing
/// is global.
pub struct RagStore {
    cfg: RagConfig,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<Embedder>,
    pipeline: IngestionPipeline,
    retriever: RetrievalOrchestrator,
}

impl RagStore {
    /// Opens the index selected by `cfg.backend` (connecting to Qdrant if needed).
    ///
    /// # Errors
    /// [`RagError::Config`] on invalid settings, [`RagError::IndexUnavailable`]
    /// if the store cannot be reached.
    pub async fn open(
        cfg: RagConfig,
        provider: Arc<dyn EmbeddingsProvider>,
    ) -> Result<Self, RagError> {
        cfg.validate()?;
        let index: Arc<dyn VectorIndex> = match cfg.backend {
            IndexBackend::Qdrant => Arc::new(QdrantIndex::connect(&cfg).await?),
            IndexBackend::Memory => Arc::new(MemoryIndex::new(cfg.space)),
        };
        info!(
            "RagStore::open backend={:?} collection={} dim={} distance={:?}",
            cfg.backend, cfg.collection, cfg.space.size, cfg.space.distance
        );
        Self::with_index(cfg, provider, index)
    }

    /// Builds the store around an existing index.
    ///
    /// # Errors
    /// [`RagError::Config`] if the index dimension or metric differs from `cfg`.
    pub fn with_index(
        cfg: RagConfig,
        provider: Arc<dyn EmbeddingsProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self, RagError> {
        cfg.validate()?;
        if index.dimension() != cfg.space.size || index.distance() != cfg.space.distance {
            return Err(RagError::Config(format!(
                "index is {}d/{:?}, config wants {}d/{:?}",
                index.dimension(),
                index.distance(),
                cfg.space.size,
                cfg.space.distance
            )));
        }
        let embedder = Arc::new(Embedder::from_config(provider, &cfg));
        let pipeline = IngestionPipeline::from_config(&cfg, embedder.clone(), index.clone())?;
        let retriever = RetrievalOrchestrator::from_config(&cfg, embedder.clone(), index.clone());
        Ok(Self {
            cfg,
            index,
            embedder,
            pipeline,
            retriever,
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.cfg
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn retriever(&self) -> &RetrievalOrchestrator {
        &self.retriever
    }

    /// Ingests documents in `mode`.
    pub async fn ingest(
        &self,
        documents: &[Document],
        mode: IngestMode,
        progress: &dyn Progress,
    ) -> Result<IngestReport, RagError> {
        self.pipeline.run(documents, mode, progress).await
    }

    /// Reads a movie batch from disk and ingests it.
    ///
    /// # Errors
    /// [`RagError::Io`] if the file cannot be read; see [`Self::ingest`].
    pub async fn ingest_file(
        &self,
        path: impl AsRef<Path>,
        mode: IngestMode,
        progress: &dyn Progress,
    ) -> Result<IngestReport, RagError> {
        let batch = read_documents(path).await?;
        let mut report = self.ingest(&batch.documents, mode, progress).await?;
        report.skipped_records = batch.skipped;
        Ok(report)
    }

    pub async fn count(&self) -> Result<usize, RagError> {
        self.index.count().await
    }

    /// Clears the index.
    pub async fn reset(&self) -> Result<(), RagError> {
        debug!("RagStore::reset collection={}", self.cfg.collection);
        self.index.delete_all().await
    }
}
