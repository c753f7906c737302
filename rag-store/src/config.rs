//! Runtime and collection configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::chunker::Chunker;
use crate::embed_pool::RetryPolicy;
use crate::errors::RagError;
use crate::retrieve::CONTEXT_HEADER_OVERHEAD;

/// Distance function used for the vector space.
///
/// One metric per index: ingestion and queries always use the metric the
/// index was built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceKind {
    /// Cosine similarity (recommended for most embeddings).
    Cosine,
    /// Dot product (useful for normalized vectors).
    Dot,
}

impl FromStr for DistanceKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceKind::Cosine),
            "dot" | "dot_product" => Ok(DistanceKind::Dot),
            other => Err(RagError::Config(format!(
                "unknown VECTOR_DISTANCE '{other}', expected cosine|dot"
            ))),
        }
    }
}

/// Describes the vector space of the collection.
#[derive(Clone, Copy, Debug)]
pub struct VectorSpace {
    /// Dimensionality of vectors.
    pub size: usize,
    /// Distance function.
    pub distance: DistanceKind,
}

/// Which VectorIndex implementation backs the pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexBackend {
    Qdrant,
    Memory,
}

impl FromStr for IndexBackend {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "qdrant" => Ok(IndexBackend::Qdrant),
            "memory" => Ok(IndexBackend::Memory),
            other => Err(RagError::Config(format!(
                "unknown INDEX_BACKEND '{other}', expected qdrant|memory"
            ))),
        }
    }
}

/// Ingestion mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestMode {
    /// Idempotent upsert by chunk id, stale chunks removed per document.
    Upsert,
    /// Clear the whole index first, then upsert.
    Rebuild,
}

impl FromStr for IngestMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(IngestMode::Upsert),
            "rebuild" => Ok(IngestMode::Rebuild),
            other => Err(RagError::Config(format!(
                "unknown INGEST_MODE '{other}', expected upsert|rebuild"
            ))),
        }
    }
}

/// Configuration for RAG ingestion and retrieval.
#[derive(Clone, Debug)]
pub struct RagConfig {
    /// Index implementation.
    pub backend: IndexBackend,
    /// Qdrant gRPC endpoint, e.g. `http://localhost:6334`.
    pub qdrant_url: String,
    /// Optional API key for Qdrant Cloud.
    pub qdrant_api_key: Option<String>,
    /// Target collection name.
    pub collection: String,
    /// Vector size and metric of the collection.
    pub space: VectorSpace,
    /// Upsert batch size (typical range: 128..512).
    pub upsert_batch: usize,
    /// Maximum chunk length, in characters.
    pub chunk_size: usize,
    /// Characters repeated between adjacent chunks.
    pub chunk_overlap: usize,
    /// Concurrent embedding requests.
    pub embedding_concurrency: usize,
    /// Texts per embedding request.
    pub embedding_batch: usize,
    /// Attempts per embedding request, first one included.
    pub embedding_max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub embedding_backoff: Duration,
    /// Upper bound for a single retry delay.
    pub embedding_backoff_max: Duration,
    /// Per-request embedding timeout.
    pub embedding_timeout: Duration,
    /// Documents processed concurrently during ingestion.
    pub ingest_concurrency: usize,
    /// Default ingestion mode.
    pub ingest_mode: IngestMode,
    /// Default number of chunks retrieved per question.
    pub top_k: usize,
    /// Upper bound for the assembled context block, in characters.
    pub max_context_chars: usize,
}

impl RagConfig {
    /// Creates a sane default config for a given collection and vector size.
    pub fn new_default(url: impl Into<String>, collection: impl Into<String>, dim: usize) -> Self {
        Self {
            backend: IndexBackend::Qdrant,
            qdrant_url: url.into(),
            qdrant_api_key: None,
            collection: collection.into(),
            space: VectorSpace {
                size: dim,
                distance: DistanceKind::Cosine,
            },
            upsert_batch: 256,
            chunk_size: 500,
            chunk_overlap: 50,
            embedding_concurrency: 4,
            embedding_batch: 16,
            embedding_max_attempts: 3,
            embedding_backoff: Duration::from_millis(200),
            embedding_backoff_max: Duration::from_millis(5000),
            embedding_timeout: Duration::from_secs(30),
            ingest_concurrency: 4,
            ingest_mode: IngestMode::Upsert,
            top_k: 4,
            max_context_chars: 4000,
        }
    }

    /// Reads configuration from environment variables and validates it.
    ///
    /// `EMBEDDING_DIM` is required; everything else has a default.
    ///
    /// # Errors
    /// Returns [`RagError::Config`] on missing/invalid values.
    pub fn from_env() -> Result<Self, RagError> {
        let dim: usize = match env_str("EMBEDDING_DIM") {
            Some(v) => parse_var("EMBEDDING_DIM", &v)?,
            None => return Err(RagError::Config("EMBEDDING_DIM is required".into())),
        };

        let mut cfg = Self::new_default(
            env_str("QDRANT_URL").unwrap_or_else(|| "http://localhost:6334".into()),
            env_str("QDRANT_COLLECTION").unwrap_or_else(|| "movies".into()),
            dim,
        );
        cfg.qdrant_api_key = env_str("QDRANT_API_KEY");
        if let Some(v) = env_str("INDEX_BACKEND") {
            cfg.backend = v.parse()?;
        }
        if let Some(v) = env_str("VECTOR_DISTANCE") {
            cfg.space.distance = v.parse()?;
        }
        if let Some(v) = env_str("INGEST_MODE") {
            cfg.ingest_mode = v.parse()?;
        }
        cfg.upsert_batch = env_parse("QDRANT_BATCH_SIZE", cfg.upsert_batch)?;
        cfg.chunk_size = env_parse("CHUNK_SIZE", cfg.chunk_size)?;
        cfg.chunk_overlap = env_parse("CHUNK_OVERLAP", cfg.chunk_overlap)?;
        cfg.embedding_concurrency = env_parse("EMBEDDING_CONCURRENCY", cfg.embedding_concurrency)?;
        cfg.embedding_batch = env_parse("EMBEDDING_BATCH_SIZE", cfg.embedding_batch)?;
        cfg.embedding_max_attempts =
            env_parse("EMBEDDING_MAX_ATTEMPTS", cfg.embedding_max_attempts)?;
        cfg.embedding_backoff = Duration::from_millis(env_parse("EMBEDDING_BACKOFF_MS", 200u64)?);
        cfg.embedding_backoff_max =
            Duration::from_millis(env_parse("EMBEDDING_BACKOFF_MAX_MS", 5000u64)?);
        cfg.embedding_timeout = Duration::from_secs(env_parse("EMBEDDING_TIMEOUT_SECS", 30u64)?);
        cfg.ingest_concurrency = env_parse("INGEST_CONCURRENCY", cfg.ingest_concurrency)?;
        cfg.top_k = env_parse("RAG_TOP_K", cfg.top_k)?;
        cfg.max_context_chars = env_parse("MAX_CONTEXT_CHARS", cfg.max_context_chars)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates config values.
    pub fn validate(&self) -> Result<(), RagError> {
        if self.backend == IndexBackend::Qdrant && self.qdrant_url.trim().is_empty() {
            return Err(RagError::Config("qdrant_url is empty".into()));
        }
        if self.collection.trim().is_empty() {
            return Err(RagError::Config("collection is empty".into()));
        }
        if self.space.size == 0 {
            return Err(RagError::Config("EMBEDDING_DIM must be > 0".into()));
        }
        if self.upsert_batch == 0 {
            return Err(RagError::Config("upsert_batch must be > 0".into()));
        }
        if self.embedding_max_attempts == 0 {
            return Err(RagError::Config("EMBEDDING_MAX_ATTEMPTS must be > 0".into()));
        }
        if self.embedding_batch == 0 {
            return Err(RagError::Config("EMBEDDING_BATCH_SIZE must be > 0".into()));
        }
        if self.top_k == 0 {
            return Err(RagError::Config("RAG_TOP_K must be > 0".into()));
        }
        // Chunker owns the size/overlap rules.
        Chunker::new(self.chunk_size, self.chunk_overlap)?;
        if self.max_context_chars < self.chunk_size + CONTEXT_HEADER_OVERHEAD {
            return Err(RagError::Config(format!(
                "MAX_CONTEXT_CHARS ({}) must hold one chunk: CHUNK_SIZE ({}) + {} header chars",
                self.max_context_chars, self.chunk_size, CONTEXT_HEADER_OVERHEAD
            )));
        }
        Ok(())
    }

    /// Chunker configured with `chunk_size` / `chunk_overlap`.
    pub fn chunker(&self) -> Result<Chunker, RagError> {
        Chunker::new(self.chunk_size, self.chunk_overlap)
    }

    /// Retry policy for embedding calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.embedding_max_attempts,
            base_delay: self.embedding_backoff,
            max_delay: self.embedding_backoff_max,
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T, RagError> {
    raw.parse::<T>()
        .map_err(|_| RagError::Config(format!("{name} has invalid value '{raw}'")))
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, RagError> {
    match env_str(name) {
        Some(v) => parse_var(name, &v),
        None => Ok(default),
    }
}
