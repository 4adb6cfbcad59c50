//! Pluggable embedding providers.
//!
//! A provider turns text into fixed-dimension vectors. The trait is the
//! narrow seam the rest of the crate depends on; concrete implementations
//! are the remote HTTP provider and a deterministic mock for tests.
use crate::errors::{MemodexError, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub mod mock;
pub mod openai;

pub use mock::MockProvider;
pub use openai::OpenAiProvider;

/// One embedding per input, in input order, plus token accounting.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub token_counts: Vec<u32>,
    pub total_tokens: u32,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    /// Embed a single text. Returns the vector and its token count.
    async fn embed_text(&self, text: &str) -> Result<(Vec<f32>, u32)>;

    /// Embed a batch. Output order matches input order and every vector has
    /// the provider's configured dimensionality.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingBatch>;

    /// The format tag this provider answers for ("openai", "mock", ...).
    fn format(&self) -> &str;
}

/// Everything a constructor needs to build a provider for a bound service.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub dimensions: usize,
}

type ProviderCtor = fn(&ProviderSpec) -> Result<Arc<dyn EmbeddingProvider>>;

fn build_openai(spec: &ProviderSpec) -> Result<Arc<dyn EmbeddingProvider>> {
    let api_key = spec
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            MemodexError::Config("format 'openai' requires an api_key".to_string())
        })?;
    Ok(Arc::new(OpenAiProvider::new(
        api_key.to_string(),
        spec.model.clone(),
        spec.dimensions,
        spec.base_url.clone(),
    )))
}

fn build_mock(spec: &ProviderSpec) -> Result<Arc<dyn EmbeddingProvider>> {
    Ok(Arc::new(MockProvider::new(spec.dimensions)))
}

const REGISTRY: &[(&str, ProviderCtor)] = &[("openai", build_openai), ("mock", build_mock)];

/// Build a provider for the given format, or a configuration error when the
/// format is unknown or its requirements (e.g. an api_key) are not met.
pub fn create_provider(format: &str, spec: &ProviderSpec) -> Result<Arc<dyn EmbeddingProvider>> {
    for (name, ctor) in REGISTRY {
        if *name == format {
            return ctor(spec);
        }
    }
    Err(MemodexError::Config(format!(
        "unknown embedding provider format '{format}'"
    )))
}
