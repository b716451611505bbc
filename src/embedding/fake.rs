//! Deterministic hash-based embedder for tests and offline runs.

use super::Embedder;
use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Embedder that derives a unit vector from a hash of the text. The same
/// text always maps to the same vector, and word overlap between texts
/// yields some similarity because vectors are summed per word.
pub struct FakeEmbedder {
    dimensions: usize,
}

impl FakeEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn word_vector(&self, word: &str) -> Vec<f32> {
        let digest = Sha256::digest(word.as_bytes());
        (0..self.dimensions)
            .map(|i| {
                let byte = digest[i % digest.len()];
                // Rotate per dimension so short digests still spread out.
                let mixed = byte.wrapping_add((i / digest.len()) as u8);
                (mixed as f32 / 127.5) - 1.0
            })
            .collect()
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut sum = vec![0.0f32; self.dimensions];
        let mut words = 0usize;
        for word in text.to_lowercase().split_whitespace() {
            let v = self.word_vector(word);
            for (acc, x) in sum.iter_mut().zip(v) {
                *acc += x;
            }
            words += 1;
        }
        if words == 0 {
            sum[0] = 1.0;
            return sum;
        }

        let norm: f32 = sum.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut sum {
                *x /= norm;
            }
        }
        sum
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deterministic_and_unit_length() {
        let embedder = FakeEmbedder::new(4);
        let a = embedder.embed("the quick brown fox").await.unwrap();
        let b = embedder.embed("the quick brown fox").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_shared_words_score_higher_than_disjoint() {
        let embedder = FakeEmbedder::new(16);
        let query = embedder.embed("brown fox").await.unwrap();
        let close = embedder.embed("the brown fox jumps").await.unwrap();
        let far = embedder.embed("completely unrelated words here").await.unwrap();

        let sim = |a: &[f32], b: &[f32]| -> f32 {
            a.iter().zip(b).map(|(x, y)| x * y).sum()
        };
        assert!(sim(&query, &close) > sim(&query, &far));
    }
}
