//! Remote embedding provider speaking the OpenAI embeddings protocol.
use crate::chunker::estimate_tokens;
use crate::errors::{MemodexError, Result};
use crate::providers::{EmbeddingBatch, EmbeddingProvider};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const API_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug)]
pub struct OpenAiProvider {
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        model: String,
        dimensions: usize,
        base_url: Option<String>,
    ) -> Self {
        Self {
            api_key,
            model,
            dimensions,
            base_url: base_url.unwrap_or_else(|| API_URL.to_string()),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn parse_batch(&self, body: &Value, expected: usize) -> Result<EmbeddingBatch> {
        let data = body["data"].as_array().ok_or_else(|| MemodexError::Provider {
            message: "embeddings response missing 'data' array".to_string(),
            retryable: false,
        })?;
        if data.len() != expected {
            return Err(MemodexError::Provider {
                message: format!(
                    "embeddings response has {} entries for {} inputs",
                    data.len(),
                    expected
                ),
                retryable: false,
            });
        }

        // The response carries an index per entry; order by it rather than
        // trusting the array order.
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; expected];
        for entry in data {
            let index = entry["index"].as_u64().map_or(usize::MAX, |i| i as usize);
            let slot = vectors.get_mut(index).ok_or_else(|| MemodexError::Provider {
                message: format!("embeddings response index {index} out of range"),
                retryable: false,
            })?;
            let raw = entry["embedding"]
                .as_array()
                .ok_or_else(|| MemodexError::Provider {
                    message: "embeddings response entry missing 'embedding'".to_string(),
                    retryable: false,
                })?;
            let vector: Vec<f32> = raw
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            if vector.len() != self.dimensions {
                return Err(MemodexError::Provider {
                    message: format!(
                        "model '{}' returned {}-dimensional vector, expected {}",
                        self.model,
                        vector.len(),
                        self.dimensions
                    ),
                    retryable: false,
                });
            }
            *slot = Some(vector);
        }
        let vectors: Vec<Vec<f32>> = vectors
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| MemodexError::Provider {
                    message: "embeddings response left an input without a vector".to_string(),
                    retryable: false,
                })
            })
            .collect::<Result<_>>()?;

        Ok(EmbeddingBatch {
            vectors,
            token_counts: Vec::new(),
            total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Value> {
        let payload = json!({
            "model": self.model,
            "input": texts,
        });

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| MemodexError::Provider {
                message: format!("embeddings request to {url} failed: {e}"),
                retryable: true,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MemodexError::Provider {
                message: format!("embeddings request returned {status}: {body}"),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let body: Value = resp
            .json()
            .await
            .context("failed to decode embeddings response body")?;
        Ok(body)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    async fn embed_text(&self, text: &str) -> Result<(Vec<f32>, u32)> {
        let input = [text.to_string()];
        let batch = self.embed_texts(&input).await?;
        let vector = batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| MemodexError::Provider {
                message: "empty embeddings response".to_string(),
                retryable: false,
            })?;
        let tokens = batch.token_counts.first().copied().unwrap_or(0);
        Ok((vector, tokens))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch {
                vectors: Vec::new(),
                token_counts: Vec::new(),
                total_tokens: 0,
            });
        }

        let body = self.request(texts).await?;
        let mut batch = self.parse_batch(&body, texts.len())?;

        // The API reports only usage totals; per-text counts fall back to
        // the character estimate.
        batch.token_counts = texts
            .iter()
            .map(|t| estimate_tokens(t).max(1) as u32)
            .collect();
        if batch.total_tokens == 0 {
            batch.total_tokens = batch.token_counts.iter().sum();
        }
        Ok(batch)
    }

    fn format(&self) -> &str {
        "openai"
    }
}
