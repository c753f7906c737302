//! Retrieval: question → embedding → filtered search → bounded context block.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::config::RagConfig;
use crate::embed_pool::{Embedder, RetryPolicy, retry_with_policy};
use crate::errors::RagError;
use crate::filters::SearchFilter;
use crate::index::VectorIndex;
use crate::record::SearchHit;

/// Retrieved chunks joined for the generation step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextBlock {
    /// Chunk texts, each under a `==[n]==` header, in score order.
    pub text: String,
    /// Hits whose text is in `text`.
    pub included: Vec<SearchHit>,
    /// Hits left out because they did not fit in the remaining room.
    pub dropped: usize,
    /// The top hit alone exceeded the bound and was cut.
    pub truncated: bool,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }
}

pub struct RetrievalOrchestrator {
    embedder: Arc<Embedder>,
    index: Arc<dyn VectorIndex>,
    max_context_chars: usize,
    index_retry: RetryPolicy,
}

impl RetrievalOrchestrator {
    pub fn new(embedder: Arc<Embedder>, index: Arc<dyn VectorIndex>, max_context_chars: usize) -> Self {
        Self {
            embedder,
            index,
            max_context_chars,
            index_retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(cfg: &RagConfig, embedder: Arc<Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        let mut r = Self::new(embedder, index, cfg.max_context_chars);
        r.index_retry = cfg.retry_policy();
        r
    }

    /// Top `k` chunks for `question` satisfying `filter`, by descending score.
    ///
    /// # Errors
    /// [`RagError::InvalidArgument`] for a blank question or `k == 0`,
    /// embedding and index failures otherwise.
    #[instrument(skip_all, fields(k = k, predicates = filter.predicates.len()))]
    pub async fn retrieve(
        &self,
        question: &str,
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<SearchHit>, RagError> {
        if question.trim().is_empty() {
            return Err(RagError::InvalidArgument("question is empty".into()));
        }
        if k == 0 {
            return Err(RagError::InvalidArgument("k must be >= 1".into()));
        }

        let qv = self.embedder.embed(question).await?;
        let hits = retry_with_policy(&self.index_retry, "search", || {
            self.index.search(&qv, k, filter)
        })
        .await?;
        debug!("retrieve: {} hits", hits.len());
        Ok(hits)
    }

    /// Joins hits, best first, within `max_context_chars`.
    ///
    /// A hit that does not fit in the remaining room is left out whole and
    /// counted in `dropped`; smaller hits ranked below it may still fit. The
    /// top hit always contributes: if it alone is over the limit its text is
    /// cut at the limit and `truncated` is set.
    pub fn build_context(&self, hits: Vec<SearchHit>) -> ContextBlock {
        let mut block = ContextBlock::default();
        let mut used = 0usize;
        let total = hits.len();

        for hit in hits {
            let n = block.included.len() + 1;
            let part = render_chunk(n, &hit);
            let len = part.chars().count();
            if used + len <= self.max_context_chars {
                used += len;
                block.text.push_str(&part);
                block.included.push(hit);
            } else if block.included.is_empty() {
                let clipped = clip_chunk(n, &hit, self.max_context_chars);
                used += clipped.chars().count();
                block.text.push_str(&clipped);
                block.included.push(hit);
                block.truncated = true;
            } else {
                block.dropped += 1;
            }
        }
        if block.dropped > 0 || block.truncated {
            info!(
                "build_context: kept {} of {} chunks, truncated={} (limit {} chars)",
                block.included.len(),
                total,
                block.truncated,
                self.max_context_chars
            );
        }
        block
    }

    /// [`retrieve`](Self::retrieve) followed by [`build_context`](Self::build_context).
    pub async fn context_for(
        &self,
        question: &str,
        filter: &SearchFilter,
        k: usize,
    ) -> Result<ContextBlock, RagError> {
        let hits = self.retrieve(question, filter, k).await?;
        Ok(self.build_context(hits))
    }
}

/// Header plus separator added around every chunk, excluding the title.
pub const CONTEXT_HEADER_OVERHEAD: usize = 96;

fn render_header(n: usize, hit: &SearchHit) -> String {
    let title = hit.title().or(hit.document_id()).unwrap_or("untitled");
    format!("==[{n}]== {title} (score {:.3})\n", hit.score)
}

fn render_chunk(n: usize, hit: &SearchHit) -> String {
    format!("{}{}\n\n", render_header(n, hit), hit.text.trim_end())
}

/// Like [`render_chunk`] but never longer than `limit` chars when the header fits.
fn clip_chunk(n: usize, hit: &SearchHit, limit: usize) -> String {
    let header = render_header(n, hit);
    let room = limit.saturating_sub(header.chars().count() + 2);
    let text: String = hit.text.trim_end().chars().take(room).collect();
    format!("{header}{text}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistanceKind, VectorSpace};
    use crate::embed::hashing::HashEmbedder;
    use crate::index::memory::MemoryIndex;
    use serde_json::json;

    fn hit(id: &str, score: f32, text: &str) -> SearchHit {
        SearchHit {
            chunk_id: id.into(),
            score,
            text: text.into(),
            metadata: json!({"title": format!("Movie {id}")})
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    fn orchestrator(max_chars: usize) -> RetrievalOrchestrator {
        let embedder = Arc::new(Embedder::new(Arc::new(HashEmbedder::new(8)), 8));
        let index = Arc::new(MemoryIndex::new(VectorSpace {
            size: 8,
            distance: DistanceKind::Cosine,
        }));
        RetrievalOrchestrator::new(embedder, index, max_chars)
    }

    #[test]
    fn context_keeps_order_and_headers() {
        let r = orchestrator(10_000);
        let block = r.build_context(vec![hit("a", 0.9, "first"), hit("b", 0.5, "second")]);
        assert_eq!(block.included.len(), 2);
        assert_eq!(block.dropped, 0);
        let first = block.text.find("==[1]== Movie a").unwrap();
        let second = block.text.find("==[2]== Movie b").unwrap();
        assert!(first < second);
    }

    #[test]
    fn over_limit_drops_lowest_ranked_whole() {
        let one = render_chunk(1, &hit("a", 0.9, "first")).chars().count();
        let r = orchestrator(one + 5);
        let block = r.build_context(vec![
            hit("a", 0.9, "first"),
            hit("b", 0.5, "second"),
            hit("c", 0.4, "third"),
        ]);
        assert_eq!(block.included.len(), 1);
        assert_eq!(block.dropped, 2);
        assert!(!block.text.contains("second"));
    }

    #[test]
    fn oversized_top_hit_is_cut_and_smaller_hits_still_fit() {
        let r = orchestrator(120);
        let long = "x".repeat(300);
        let block = r.build_context(vec![
            hit("a", 0.9, &long),
            hit("b", 0.5, &"y".repeat(200)),
        ]);
        assert_eq!(block.included.len(), 1);
        assert!(block.truncated);
        assert_eq!(block.dropped, 1);
        assert!(block.text.starts_with("==[1]== Movie a"));
        assert!(block.text.chars().count() <= 120);
    }

    #[test]
    fn no_hits_no_context() {
        let r = orchestrator(100);
        let block = r.build_context(Vec::new());
        assert!(block.is_empty());
        assert!(block.text.is_empty());
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let r = orchestrator(100);
        assert!(matches!(
            r.retrieve("   ", &SearchFilter::new(), 3).await,
            Err(RagError::InvalidArgument(_))
        ));
    }
}
