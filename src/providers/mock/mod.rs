//! Deterministic in-process provider for tests and offline development.
use crate::chunker::estimate_tokens;
use crate::errors::Result;
use crate::providers::{EmbeddingBatch, EmbeddingProvider};
use crate::vectors::content_hash;
use async_trait::async_trait;

/// Derives unit vectors from the SHA-256 of the input text. Identical texts
/// always embed identically, and all components are non-negative so cosine
/// scores between mock vectors stay in [0, 1].
#[derive(Debug)]
pub struct MockProvider {
    dimensions: usize,
}

impl MockProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = content_hash(text);
        let mut v: Vec<f32> = (0..self.dimensions)
            .map(|i| f32::from(digest[i % digest.len()]) / 255.0)
            .collect();
        let norm: f32 = v.iter().map(|c| c * c).sum::<f32>().sqrt();
        if norm > 0.0 {
            for c in &mut v {
                *c /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    async fn embed_text(&self, text: &str) -> Result<(Vec<f32>, u32)> {
        Ok((self.vector_for(text), estimate_tokens(text).max(1) as u32))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let vectors: Vec<Vec<f32>> = texts.iter().map(|t| self.vector_for(t)).collect();
        let token_counts: Vec<u32> = texts
            .iter()
            .map(|t| estimate_tokens(t).max(1) as u32)
            .collect();
        let total_tokens = token_counts.iter().sum();
        Ok(EmbeddingBatch {
            vectors,
            token_counts,
            total_tokens,
        })
    }

    fn format(&self) -> &str {
        "mock"
    }
}
