use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

fn default_chunking_max_tokens() -> usize {
    2000
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

/// Configuration for binding a [`Service`](crate::Service) to a data
/// directory and an embedding service.
///
/// Either `service` names a pre-registered embedding service, or `format` +
/// `model` (+ `dimensions` + `max_tokens` for a first registration) describe
/// one inline. Validation happens at bind time.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding `embeddings.db` and (optionally) `text.db`.
    /// Created if absent.
    pub data_dir: PathBuf,

    /// Bearer token for remote providers. Required by the openai family.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Name of a pre-registered embedding service to bind.
    #[serde(default)]
    pub service: Option<String>,

    /// Provider format ("openai", "mock", ...) when registering inline.
    #[serde(default)]
    pub format: Option<String>,

    /// Override for the provider endpoint base URL.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model name when registering inline.
    #[serde(default)]
    pub model: Option<String>,

    /// Vector dimensionality when registering inline.
    #[serde(default)]
    pub dimensions: Option<usize>,

    /// Per-request token ceiling of the model when registering inline.
    #[serde(default)]
    pub max_tokens: Option<usize>,

    /// Upper bound on chunk size in estimated tokens. Must not exceed the
    /// bound service's `max_tokens`.
    #[serde(default = "default_chunking_max_tokens")]
    pub chunking_max_tokens: usize,

    /// Keep chunk text in an attached `text.db` so searches can filter on
    /// content and return it.
    #[serde(default = "default_true")]
    pub store_text: bool,

    /// Extra databases to attach, alias → file path. Attached schemas can
    /// be referenced from `sql_where` search predicates.
    #[serde(default)]
    pub attach: HashMap<String, PathBuf>,

    /// Queue items pulled per processing round.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts before a queue item is marked terminally failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl ServiceConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            api_key: None,
            service: None,
            format: None,
            base_url: None,
            model: None,
            dimensions: None,
            max_tokens: None,
            chunking_max_tokens: default_chunking_max_tokens(),
            store_text: default_true(),
            attach: HashMap::new(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
        }
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("data_dir", &self.data_dir)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("service", &self.service)
            .field("format", &self.format)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("max_tokens", &self.max_tokens)
            .field("chunking_max_tokens", &self.chunking_max_tokens)
            .field("store_text", &self.store_text)
            .field("attach", &self.attach)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
