//! Query embedding through an Ollama-compatible embeddings endpoint.

use std::time::Duration;

use async_trait::async_trait;
use healmate_common::{HealmateError, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::types::EmbeddingConfig;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("embedding has dimension {actual}, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("cannot embed empty text")]
    EmptyInput,
}

impl From<EmbeddingError> for HealmateError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::EmptyInput => HealmateError::validation(err.to_string()),
            EmbeddingError::Status { status: 429, .. } => {
                HealmateError::rate_limited("embedding", None)
            }
            other => HealmateError::upstream("embedding", other.to_string()),
        }
    }
}

/// Turns text into a vector for similarity search.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    dimension: usize,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
            timeout: Duration::from_millis(config.timeout_ms),
            http_client: reqwest::Client::new(),
        }
    }

    async fn request(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let response = self
            .http_client
            .post(format!("{}/api/embeddings", self.base_url))
            .timeout(self.timeout)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        if parsed.embedding.len() != self.dimension {
            return Err(EmbeddingError::Dimension {
                expected: self.dimension,
                actual: parsed.embedding.len(),
            });
        }
        Ok(parsed.embedding)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    #[instrument(skip(self, text), fields(model = %self.model, text_len = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.request(text).await?;
        debug!(dimension = embedding.len(), "Generated embedding");
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Cosine similarity of two vectors; 0.0 when either is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
