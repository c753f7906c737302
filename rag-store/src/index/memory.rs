//! In-memory vector index.
//!
//! Entries are stored as `Arc<IndexEntry>` and swapped whole on upsert, so a
//! concurrent reader sees either the old or the new entry, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::{VectorIndex, check_entries, check_query, sort_hits};
use crate::config::{DistanceKind, VectorSpace};
use crate::errors::RagError;
use crate::filters::SearchFilter;
use crate::record::{IndexEntry, SearchHit};

pub struct MemoryIndex {
    space: VectorSpace,
    entries: RwLock<HashMap<String, Arc<IndexEntry>>>,
}

impl MemoryIndex {
    pub fn new(space: VectorSpace) -> Self {
        Self {
            space,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Stored entry by id (test and debugging helper).
    pub async fn get(&self, chunk_id: &str) -> Option<Arc<IndexEntry>> {
        self.entries.read().await.get(chunk_id).cloned()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dimension(&self) -> usize {
        self.space.size
    }

    fn distance(&self) -> DistanceKind {
        self.space.distance
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize, RagError> {
        check_entries(entries, self.space.size)?;
        let fresh: Vec<Arc<IndexEntry>> = entries.iter().cloned().map(Arc::new).collect();

        let mut w = self.entries.write().await;
        for e in fresh {
            w.insert(e.chunk_id.clone(), e);
        }
        debug!("MemoryIndex::upsert n={} total={}", entries.len(), w.len());
        Ok(entries.len())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, RagError> {
        check_query(query, k, self.space.size, filter)?;

        let candidates: Vec<Arc<IndexEntry>> = {
            let r = self.entries.read().await;
            r.values().filter(|e| filter.eval(&e.metadata)).cloned().collect()
        };

        let mut hits: Vec<SearchHit> = candidates
            .iter()
            .map(|e| SearchHit {
                chunk_id: e.chunk_id.clone(),
                score: similarity(self.space.distance, query, &e.vector),
                text: e.text.clone(),
                metadata: e.metadata.clone(),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        trace!(
            "MemoryIndex::search candidates={} hits={}",
            candidates.len(),
            hits.len()
        );
        Ok(hits)
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<(), RagError> {
        let mut w = self.entries.write().await;
        for id in ids {
            w.remove(id);
        }
        Ok(())
    }

    async fn scan_ids(&self, filter: &SearchFilter) -> Result<Vec<String>, RagError> {
        filter.validate()?;
        let r = self.entries.read().await;
        let mut ids: Vec<String> = r
            .values()
            .filter(|e| filter.eval(&e.metadata))
            .map(|e| e.chunk_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_all(&self) -> Result<(), RagError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize, RagError> {
        Ok(self.entries.read().await.len())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine is 0 when either vector has zero norm.
pub(crate) fn similarity(kind: DistanceKind, a: &[f32], b: &[f32]) -> f32 {
    match kind {
        DistanceKind::Dot => dot(a, b),
        DistanceKind::Cosine => {
            let na = dot(a, a).sqrt();
            let nb = dot(b, b).sqrt();
            if na == 0.0 || nb == 0.0 {
                0.0
            } else {
                dot(a, b) / (na * nb)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, v: Vec<f32>, adult: bool) -> IndexEntry {
        IndexEntry {
            chunk_id: id.into(),
            vector: v,
            metadata: json!({"isAdult": adult, "documentId": id})
                .as_object()
                .cloned()
                .unwrap(),
            text: format!("text {id}"),
        }
    }

    fn index(distance: DistanceKind) -> MemoryIndex {
        MemoryIndex::new(VectorSpace { size: 2, distance })
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let idx = index(DistanceKind::Cosine);
        idx.upsert(&[entry("a", vec![1.0, 0.0], false)]).await.unwrap();
        idx.upsert(&[entry("a", vec![0.0, 1.0], false)]).await.unwrap();
        assert_eq!(idx.count().await.unwrap(), 1);
        assert_eq!(idx.get("a").await.unwrap().vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn mismatched_batch_leaves_state_unchanged() {
        let idx = index(DistanceKind::Cosine);
        idx.upsert(&[entry("a", vec![1.0, 0.0], false)]).await.unwrap();
        let err = idx
            .upsert(&[
                entry("a", vec![0.0, 1.0], false),
                entry("b", vec![1.0, 2.0, 3.0], false),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::VectorSizeMismatch { got: 3, want: 2 }));
        assert_eq!(idx.count().await.unwrap(), 1);
        assert_eq!(idx.get("a").await.unwrap().vector, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn ties_break_by_chunk_id() {
        let idx = index(DistanceKind::Dot);
        idx.upsert(&[
            entry("c", vec![1.0, 0.0], false),
            entry("a", vec![1.0, 0.0], false),
            entry("b", vec![1.0, 0.0], false),
        ])
        .await
        .unwrap();
        let hits = idx.search(&[1.0, 0.0], 2, &SearchFilter::new()).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn zero_k_is_invalid() {
        let idx = index(DistanceKind::Cosine);
        assert!(matches!(
            idx.search(&[1.0, 0.0], 0, &SearchFilter::new()).await,
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn filter_applies_before_ranking() {
        let idx = index(DistanceKind::Cosine);
        idx.upsert(&[
            entry("adult", vec![1.0, 0.0], true),
            entry("family", vec![0.0, 1.0], false),
        ])
        .await
        .unwrap();
        let f = SearchFilter::new().matches("isAdult", false);
        let hits = idx.search(&[1.0, 0.0], 5, &f).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "family");

        let none = SearchFilter::new().matches("isAdult", "maybe");
        assert!(idx.search(&[1.0, 0.0], 5, &none).await.unwrap().is_empty());

        let list = SearchFilter::new().matches("isAdult", json!([false]));
        assert!(matches!(
            idx.search(&[1.0, 0.0], 5, &list).await,
            Err(RagError::InvalidArgument(_))
        ));
        assert!(idx.scan_ids(&list).await.is_err());
    }

    #[tokio::test]
    async fn delete_all_on_empty_is_ok() {
        let idx = index(DistanceKind::Cosine);
        idx.delete_all().await.unwrap();
        idx.delete_all().await.unwrap();
        assert_eq!(idx.count().await.unwrap(), 0);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(similarity(DistanceKind::Cosine, &[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
