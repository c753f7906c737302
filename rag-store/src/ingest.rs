//! Ingestion pipeline: documents → chunks → embeddings → index.
//!
//! Documents are processed independently and concurrently (bounded by
//! `concurrency`). A failing document is recorded in the report and never
//! aborts the batch. Work on the same document id is serialized, so two
//! writers never race on the same chunk ids.
//!
//! Re-ingesting a document replaces its chunks by id and deletes chunk ids at
//! or beyond the new chunk count, so a shrinking overview leaves no stale entries.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::chunker::Chunker;
use crate::config::{IngestMode, RagConfig};
use crate::embed_pool::{Embedder, RetryPolicy, retry_with_policy};
use crate::errors::RagError;
use crate::filters::SearchFilter;
use crate::index::VectorIndex;
use crate::progress::{NoopProgress, Progress};
use crate::record::{Document, IndexEntry, keys};

/// Outcome of one ingestion run.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<IngestFailure>,
    /// Index entries written across all documents.
    pub chunks_written: usize,
    /// Entries removed because their document now has fewer chunks.
    pub stale_deleted: usize,
    /// Raw records the source adapter could not map.
    pub skipped_records: usize,
}

#[derive(Debug)]
pub struct IngestFailure {
    pub document_id: String,
    pub error: RagError,
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ingested={} failed={} chunks={} stale_deleted={} skipped_records={}",
            self.succeeded, self.failed, self.chunks_written, self.stale_deleted, self.skipped_records
        )
    }
}

struct DocOutcome {
    chunks: usize,
    stale: usize,
}

pub struct IngestionPipeline {
    chunker: Chunker,
    embedder: Arc<Embedder>,
    index: Arc<dyn VectorIndex>,
    concurrency: usize,
    index_retry: RetryPolicy,
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IngestionPipeline {
    pub fn new(chunker: Chunker, embedder: Arc<Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            chunker,
            embedder,
            index,
            concurrency: 4,
            index_retry: RetryPolicy::default(),
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Pipeline configured from [`RagConfig`].
    pub fn from_config(
        cfg: &RagConfig,
        embedder: Arc<Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self, RagError> {
        Ok(Self::new(cfg.chunker()?, embedder, index)
            .with_concurrency(cfg.ingest_concurrency)
            .with_index_retry(cfg.retry_policy()))
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_index_retry(mut self, retry: RetryPolicy) -> Self {
        self.index_retry = retry;
        self
    }

    /// Idempotent upsert of every document; always returns a full report.
    pub async fn ingest(&self, documents: &[Document]) -> IngestReport {
        self.ingest_batch(documents, &NoopProgress).await
    }

    /// Runs one ingestion in the given mode.
    ///
    /// # Errors
    /// Only the `Rebuild` wipe can fail the run as a whole; per-document
    /// failures land in the report.
    pub async fn run(
        &self,
        documents: &[Document],
        mode: IngestMode,
        progress: &dyn Progress,
    ) -> Result<IngestReport, RagError> {
        if mode == IngestMode::Rebuild {
            info!("ingest::run: rebuild requested, clearing index");
            retry_with_policy(&self.index_retry, "delete_all", || self.index.delete_all()).await?;
        }
        Ok(self.ingest_batch(documents, progress).await)
    }

    #[instrument(skip_all, fields(documents = documents.len()))]
    async fn ingest_batch(&self, documents: &[Document], progress: &dyn Progress) -> IngestReport {
        info!(
            "ingest: documents={} concurrency={}",
            documents.len(),
            self.concurrency
        );
        progress.set_total(documents.len() as u64);

        let mut report = IngestReport::default();
        let mut results = stream::iter(documents)
            .map(|doc| async move { (doc.id.as_str(), self.ingest_one(doc).await) })
            .buffer_unordered(self.concurrency);

        while let Some((id, res)) = results.next().await {
            match res {
                Ok(out) => {
                    report.succeeded += 1;
                    report.chunks_written += out.chunks;
                    report.stale_deleted += out.stale;
                    progress.step(id);
                }
                Err(error) => {
                    warn!(document_id = %id, error = %error, "document ingestion failed");
                    report.failed += 1;
                    report.errors.push(IngestFailure {
                        document_id: id.to_string(),
                        error,
                    });
                    progress.step(&format!("{id} failed"));
                }
            }
        }
        report
            .errors
            .sort_by(|a, b| a.document_id.cmp(&b.document_id));

        progress.finish(&format!("{} ok, {} failed", report.succeeded, report.failed));
        info!("ingest: {report}");
        report
    }

    async fn ingest_one(&self, doc: &Document) -> Result<DocOutcome, RagError> {
        let lock = self.lock_for(&doc.id).await;
        let res = {
            let _guard = lock.lock().await;
            self.write_document(doc).await
        };
        self.release_lock(&doc.id, lock).await;
        res
    }

    async fn write_document(&self, doc: &Document) -> Result<DocOutcome, RagError> {
        let chunks = self.chunker.chunk_document(doc);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(c, vector)| IndexEntry {
                chunk_id: c.chunk_id(),
                vector,
                metadata: c.metadata,
                text: c.text,
            })
            .collect();
        let n = entries.len();

        retry_with_policy(&self.index_retry, "upsert", || self.index.upsert(&entries)).await?;

        let stale_filter = SearchFilter::new()
            .term(keys::DOCUMENT_ID, doc.id.clone())
            .range(keys::CHUNK, Some(n as f64), None);
        let stale =
            retry_with_policy(&self.index_retry, "scan", || self.index.scan_ids(&stale_filter))
                .await?;
        if !stale.is_empty() {
            debug!(document_id = %doc.id, stale = stale.len(), "deleting stale chunks");
            retry_with_policy(&self.index_retry, "delete", || self.index.delete_ids(&stale))
                .await?;
        }

        debug!(document_id = %doc.id, chunks = n, "document ingested");
        Ok(DocOutcome {
            chunks: n,
            stale: stale.len(),
        })
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.doc_locks.lock().await;
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Drops the map entry once no other task holds the lock.
    async fn release_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.doc_locks.lock().await;
        // map + ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }
}
