use std::sync::Arc;

use async_trait::async_trait;
use healmate_common::{HealmateError, Result, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::client::{LlmClient, LlmRequest, LlmResponse};
use crate::openai::OpenAiClient;
use crate::retry::RetryingClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// One of `openai`, `deepseek`, `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "RetryPolicy::llm")]
    pub retry: RetryPolicy,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            api_url: None,
            temperature: None,
            max_tokens: None,
            max_concurrent_requests: default_max_concurrent(),
            retry: RetryPolicy::llm(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl LlmConfig {
    /// Config value first, then the provider's conventional env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        let env_var = match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY",
            "deepseek" => "DEEPSEEK_API_KEY",
            _ => return None,
        };
        std::env::var(env_var).ok().filter(|k| !k.is_empty())
    }
}

pub struct SemaphoredClient {
    inner: Arc<dyn LlmClient>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl SemaphoredClient {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize) -> Self {
        Self {
            inner,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl LlmClient for SemaphoredClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| HealmateError::upstream("llm", format!("semaphore closed: {e}")))?;
        self.inner.complete(request).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

pub fn build_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    let api_key = config.resolve_api_key();
    let timeout = std::time::Duration::from_millis(config.request_timeout_ms);
    let base_client: Box<dyn LlmClient> = match config.provider.as_str() {
        "openai" | "deepseek" => {
            if api_key.is_none() && config.api_url.is_none() {
                return Err(HealmateError::Config(format!(
                    "{} requires an API key",
                    config.provider
                )));
            }
            Box::new(
                OpenAiClient::for_service(
                    config.provider.clone(),
                    config.api_url.clone(),
                    config.model.clone(),
                    api_key,
                )
                .with_timeout(timeout),
            )
        }
        "ollama" => Box::new(
            OpenAiClient::for_service(
                "ollama",
                config.api_url.clone(),
                config.model.clone(),
                None,
            )
            .with_timeout(timeout),
        ),
        other => {
            return Err(HealmateError::Config(format!(
                "Unknown LLM provider: {other}"
            )));
        }
    };

    let retrying: Box<dyn LlmClient> =
        Box::new(RetryingClient::new(base_client, config.retry.clone()));

    let semaphored = SemaphoredClient::new(Arc::from(retrying), config.max_concurrent_requests);

    Ok(Arc::new(semaphored))
}
