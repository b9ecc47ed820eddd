//! Read-only adapters over the vector similarity store.

use std::time::Duration;

use async_trait::async_trait;
use healmate_common::{HealmateError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::embedding::cosine_similarity;
use crate::types::KnowledgeConfig;

/// Knowledge collections a routing decision can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeDomain {
    /// Tarot card meanings.
    Tarot,
    /// Coping-strategy and psychology articles.
    Coping,
}

impl KnowledgeDomain {
    pub fn source_type(&self) -> &'static str {
        match self {
            Self::Tarot => "tarot",
            Self::Coping => "coping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tarot" => Some(Self::Tarot),
            "coping" | "psychology" => Some(Self::Coping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub source_id: String,
    pub score: f32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub source_type: String,
}

impl From<KnowledgeDomain> for SearchFilter {
    fn from(domain: KnowledgeDomain) -> Self {
        Self {
            source_type: domain.source_type().to_string(),
        }
    }
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Top-`k` passages by similarity, best first.
    async fn search(
        &self,
        embedding: &[f32],
        filter: Option<&SearchFilter>,
        k: usize,
    ) -> Result<Vec<RetrievedPassage>>;
}

struct IndexedPassage {
    embedding: Vec<f32>,
    source_id: String,
    text: String,
    source_type: Option<String>,
}

/// Brute-force cosine store for small corpora and tests.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    passages: parking_lot::RwLock<Vec<IndexedPassage>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        source_id: impl Into<String>,
        text: impl Into<String>,
        source_type: Option<&str>,
        embedding: Vec<f32>,
    ) {
        self.passages.write().push(IndexedPassage {
            embedding,
            source_id: source_id.into(),
            text: text.into(),
            source_type: source_type.map(str::to_string),
        });
    }

    pub fn len(&self) -> usize {
        self.passages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn search(
        &self,
        embedding: &[f32],
        filter: Option<&SearchFilter>,
        k: usize,
    ) -> Result<Vec<RetrievedPassage>> {
        let passages = self.passages.read();
        let mut scored: Vec<RetrievedPassage> = passages
            .iter()
            .filter(|p| match filter {
                Some(f) => p.source_type.as_deref() == Some(f.source_type.as_str()),
                None => true,
            })
            .map(|p| RetrievedPassage {
                source_id: p.source_id.clone(),
                score: cosine_similarity(embedding, &p.embedding),
                text: p.text.clone(),
                source_type: p.source_type.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Qdrant REST adapter.
pub struct QdrantKnowledgeStore {
    base_url: String,
    collection: String,
    api_key: Option<String>,
    timeout: Duration,
    http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantPoint>,
}

#[derive(Deserialize)]
struct QdrantPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: serde_json::Map<String, Value>,
}

impl QdrantKnowledgeStore {
    pub fn new(config: &KnowledgeConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            http_client: reqwest::Client::new(),
        }
    }

    fn build_body(embedding: &[f32], filter: Option<&SearchFilter>, k: usize) -> Value {
        let mut body = json!({
            "vector": embedding,
            "limit": k,
            "with_payload": true,
        });
        if let Some(f) = filter {
            body["filter"] = json!({
                "must": [{ "key": "source_type", "match": { "value": f.source_type } }]
            });
        }
        body
    }

    fn to_passage(point: QdrantPoint) -> Option<RetrievedPassage> {
        let text = point.payload.get("text")?.as_str()?.to_string();
        let source_id = match point.payload.get("source_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => match &point.id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        Some(RetrievedPassage {
            source_id,
            score: point.score,
            text,
            source_type: point
                .payload
                .get("source_type")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[async_trait]
impl KnowledgeStore for QdrantKnowledgeStore {
    #[instrument(skip(self, embedding), fields(collection = %self.collection))]
    async fn search(
        &self,
        embedding: &[f32],
        filter: Option<&SearchFilter>,
        k: usize,
    ) -> Result<Vec<RetrievedPassage>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let mut request = self
            .http_client
            .post(&url)
            .timeout(self.timeout)
            .json(&Self::build_body(embedding, filter, k));
        if let Some(ref key) = self.api_key {
            request = request.header("api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HealmateError::upstream("qdrant", e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(HealmateError::rate_limited("qdrant", None));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HealmateError::upstream("qdrant", format!("{status}: {body}")));
        }

        let parsed: QdrantSearchResponse = response
            .json()
            .await
            .map_err(|e| HealmateError::upstream("qdrant", format!("unparseable response: {e}")))?;

        let passages: Vec<RetrievedPassage> =
            parsed.result.into_iter().filter_map(Self::to_passage).collect();
        debug!(hits = passages.len(), "Qdrant search complete");
        Ok(passages)
    }
}
