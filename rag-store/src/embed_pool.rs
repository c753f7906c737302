//! Embedding executor with retries, timeouts, concurrency and dimension checks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::{config::RagConfig, embed::EmbeddingsProvider, errors::RagError};

/// Exponential backoff for transient embedding failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Attempts per call, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is reached; the last error is returned as is.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RagError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RagError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, max_attempts, error = %e, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Embeds texts through an [`EmbeddingsProvider`], identically for ingestion
/// and queries.
///
/// - batches of `batch_size` texts per provider call, output order preserved
/// - at most `concurrency` provider calls in flight (shared by all callers)
/// - each call bounded by `timeout`; timeouts count as transient failures
/// - transient failures retried per [`RetryPolicy`], then
///   [`RagError::EmbeddingUnavailable`]
/// - every vector must have exactly `dim` components
pub struct Embedder {
    provider: Arc<dyn EmbeddingsProvider>,
    dim: usize,
    retry: RetryPolicy,
    timeout: Duration,
    batch_size: usize,
    concurrency: usize,
    permits: Arc<Semaphore>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingsProvider>, dim: usize) -> Self {
        Self {
            provider,
            dim,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            batch_size: 16,
            concurrency: 4,
            permits: Arc::new(Semaphore::new(4)),
        }
    }

    /// Embedder configured from [`RagConfig`].
    pub fn from_config(provider: Arc<dyn EmbeddingsProvider>, cfg: &RagConfig) -> Self {
        Self::new(provider, cfg.space.size)
            .with_retry(cfg.retry_policy())
            .with_timeout(cfg.embedding_timeout)
            .with_batch_size(cfg.embedding_batch)
            .with_concurrency(cfg.embedding_concurrency)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self.permits = Arc::new(Semaphore::new(self.concurrency));
        self
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Embeds one text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let mut out = self.call_with_retry(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| RagError::EmbeddingUnavailable {
            attempts: 1,
            reason: "provider returned no vector".into(),
        })
    }

    /// Embeds many texts; same length and order as `texts`.
    #[instrument(skip_all, fields(n = texts.len()))]
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(self.batch_size))
            .map(|batch| self.call_with_retry(batch))
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        debug!("embed_pool::embed_batch: {} batches done", batches.len());
        Ok(batches.into_iter().flatten().collect())
    }

    async fn call_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let res = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| RagError::Provider(e.to_string()))?;
                tokio::time::timeout(self.timeout, self.provider.embed_batch(batch)).await
            };

            let err = match res {
                Ok(Ok(vectors)) => return self.check(batch.len(), vectors),
                Ok(Err(e)) => e,
                Err(_) => RagError::Provider(format!(
                    "embedding request timed out after {:?}",
                    self.timeout
                )),
            };

            if !err.is_retryable() {
                return Err(match err {
                    RagError::EmbeddingUnavailable { reason, .. } => {
                        RagError::EmbeddingUnavailable {
                            attempts: attempt,
                            reason,
                        }
                    }
                    other => other,
                });
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %err, "embedding retries exhausted");
                return Err(RagError::EmbeddingUnavailable {
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "embedding failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn check(&self, want_len: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, RagError> {
        if vectors.len() != want_len {
            return Err(RagError::EmbeddingUnavailable {
                attempts: 1,
                reason: format!("asked for {want_len} vectors, got {}", vectors.len()),
            });
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dim) {
            return Err(RagError::VectorSizeMismatch {
                got: bad.len(),
                want: self.dim,
            });
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbedFuture;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails transiently `fail_first` times, then returns `[len, 0, 0, ...]` vectors.
    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
        dim: usize,
    }

    impl EmbeddingsProvider for Flaky {
        fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first {
                    return Err(RagError::Provider("503".into()));
                }
                let mut v = vec![0.0; self.dim];
                v[0] = text.len() as f32;
                Ok(v)
            })
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let flaky = Arc::new(Flaky {
            fail_first: 2,
            calls: AtomicU32::new(0),
            dim: 3,
        });
        let e = Embedder::new(flaky.clone(), 3).with_retry(fast_retry(3));
        let v = e.embed("abcd").await.unwrap();
        assert_eq!(v, vec![4.0, 0.0, 0.0]);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_embedding_unavailable() {
        let flaky = Arc::new(Flaky {
            fail_first: 10,
            calls: AtomicU32::new(0),
            dim: 3,
        });
        let e = Embedder::new(flaky, 3).with_retry(fast_retry(2));
        match e.embed("x").await {
            Err(RagError::EmbeddingUnavailable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let flaky = Arc::new(Flaky {
            fail_first: 0,
            calls: AtomicU32::new(0),
            dim: 5,
        });
        let e = Embedder::new(flaky, 3);
        assert!(matches!(
            e.embed("x").await,
            Err(RagError::VectorSizeMismatch { got: 5, want: 3 })
        ));
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let flaky = Arc::new(Flaky {
            fail_first: 0,
            calls: AtomicU32::new(0),
            dim: 2,
        });
        let e = Embedder::new(flaky, 2).with_batch_size(2).with_concurrency(3);
        let texts: Vec<String> = (1..=7).map(|n| "x".repeat(n)).collect();
        let out = e.embed_batch(&texts).await.unwrap();
        let firsts: Vec<f32> = out.iter().map(|v| v[0]).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        struct Stuck;
        impl EmbeddingsProvider for Stuck {
            fn embed<'a>(&'a self, _text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
                Box::pin(futures::future::pending())
            }
        }
        let e = Embedder::new(Arc::new(Stuck), 3)
            .with_retry(fast_retry(2))
            .with_timeout(Duration::from_secs(1));
        assert!(matches!(
            e.embed("x").await,
            Err(RagError::EmbeddingUnavailable { attempts: 2, .. })
        ));
    }
}
