//! Deterministic offline embedder based on feature hashing.
//!
//! Each lowercase word and each character trigram inside a word is hashed
//! with `blake3` into one of `dim` buckets with a signed weight; the result is
//! L2-normalized. Texts sharing words or word fragments score higher under
//! cosine/dot similarity. No network, no model: meant for local runs and tests.

use super::{EmbedFuture, EmbeddingsProvider};

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

#[derive(Clone, Copy, Debug)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Synchronous embedding; the trait impl just wraps this.
    pub fn embed_now(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        let lower = text.to_lowercase();
        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add(&mut v, b"w:", word, WORD_WEIGHT);
            let chars: Vec<char> = word.chars().collect();
            for tri in chars.windows(3) {
                let s: String = tri.iter().collect();
                self.add(&mut v, b"t:", &s, TRIGRAM_WEIGHT);
            }
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    fn add(&self, v: &mut [f32], tag: &[u8], feature: &str, weight: f32) {
        let mut h = blake3::Hasher::new();
        h.update(tag);
        h.update(feature.as_bytes());
        let bytes = h.finalize();
        let b = bytes.as_bytes();
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&b[..8]);
        let bucket = (u64::from_le_bytes(idx) % self.dim as u64) as usize;
        let sign = if b[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl EmbeddingsProvider for HashEmbedder {
    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
        let v = self.embed_now(text);
        Box::pin(async move { Ok(v) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cos(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed_now("A romantic comedy in Paris");
        assert_eq!(a, e.embed_now("A romantic comedy in Paris"));
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_score_higher() {
        let e = HashEmbedder::new(256);
        let q = e.embed_now("anti-hero fighting crime");
        let crime = e.embed_now("The dark knight rises to fight crime");
        let paris = e.embed_now("A romantic comedy in Paris");
        assert!(cos(&q, &crime) > cos(&q, &paris));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashEmbedder::new(8);
        assert!(e.embed_now("").iter().all(|x| *x == 0.0));
    }
}
