//! Vector index abstraction and its backends.
//!
//! - [`memory::MemoryIndex`]: in-process store, exact search.
//! - [`qdrant::QdrantIndex`]: persistent store behind `qdrant-client`.
//!
//! Every backend enforces the same contract: fixed dimension, whole-batch
//! rejection on dimension mismatch, idempotent upsert by chunk id, filtered
//! top-k ordered by descending score with ties broken by ascending chunk id.

use async_trait::async_trait;

use crate::config::DistanceKind;
use crate::errors::RagError;
use crate::filters::SearchFilter;
use crate::record::{IndexEntry, SearchHit};

pub mod memory;
pub mod qdrant;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Vector size every entry and query must have.
    fn dimension(&self) -> usize;

    /// Metric the index was built with.
    fn distance(&self) -> DistanceKind;

    /// Inserts or replaces entries by `chunk_id`. Returns the number written.
    ///
    /// # Errors
    /// [`RagError::VectorSizeMismatch`] if any vector has the wrong size; no
    /// entry of the batch is written in that case.
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize, RagError>;

    /// Top `k` entries satisfying `filter`, by descending score.
    ///
    /// # Errors
    /// [`RagError::InvalidArgument`] if `k == 0`,
    /// [`RagError::VectorSizeMismatch`] if `query` has the wrong size.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, RagError>;

    /// Removes entries by id; unknown ids are ignored.
    async fn delete_ids(&self, ids: &[String]) -> Result<(), RagError>;

    /// Ids of all entries satisfying `filter`.
    async fn scan_ids(&self, filter: &SearchFilter) -> Result<Vec<String>, RagError>;

    /// Removes every entry. Safe on an empty index.
    async fn delete_all(&self) -> Result<(), RagError>;

    /// Number of stored entries.
    async fn count(&self) -> Result<usize, RagError>;
}

/// Rejects the whole batch if any vector has the wrong size.
pub(crate) fn check_entries(entries: &[IndexEntry], dim: usize) -> Result<(), RagError> {
    match entries.iter().find(|e| e.vector.len() != dim) {
        Some(bad) => Err(RagError::VectorSizeMismatch {
            got: bad.vector.len(),
            want: dim,
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_query(
    query: &[f32],
    k: usize,
    dim: usize,
    filter: &SearchFilter,
) -> Result<(), RagError> {
    if k == 0 {
        return Err(RagError::InvalidArgument("k must be >= 1".into()));
    }
    filter.validate()?;
    if query.len() != dim {
        return Err(RagError::VectorSizeMismatch {
            got: query.len(),
            want: dim,
        });
    }
    Ok(())
}

/// Score descending, then chunk id ascending.
pub(crate) fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}
