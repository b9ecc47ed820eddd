use std::time::Duration;

use async_trait::async_trait;
use healmate_common::{HealmateError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{LlmClient, LlmRequest, LlmResponse, Role, TokenUsage};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    model: String,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Client for any OpenAI-compatible chat-completions endpoint
/// (OpenAI, DeepSeek, Ollama).
pub struct OpenAiClient {
    service: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, model: String, api_key: Option<String>) -> Self {
        Self::for_service("openai", base_url, model, api_key)
    }

    pub fn for_service(
        service: impl Into<String>,
        base_url: Option<String>,
        model: String,
        api_key: Option<String>,
    ) -> Self {
        let service = service.into();
        let default_url = match service.as_str() {
            "deepseek" => DEEPSEEK_BASE_URL,
            "ollama" => OLLAMA_BASE_URL,
            _ => OPENAI_BASE_URL,
        };
        Self {
            base_url: base_url
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            service,
            model,
            api_key,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            http_client: reqwest::Client::new(),
        }
    }

    /// Bound on one HTTP exchange, connect through body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn role_to_string(role: &Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_body(&self, request: &LlmRequest) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system_prompt {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        for msg in &request.messages {
            messages.push(WireMessage {
                role: Self::role_to_string(&msg.role).to_string(),
                content: msg.content.clone(),
            });
        }
        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        }
    }

    /// Map a non-success HTTP status onto the error taxonomy.
    fn classify_status(
        &self,
        status: reqwest::StatusCode,
        retry_after: Option<u64>,
        body: &str,
    ) -> HealmateError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return HealmateError::rate_limited(&self.service, retry_after);
        }
        if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            return HealmateError::upstream(&self.service, format!("{status}: {body}"));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return HealmateError::Config(format!("{} rejected credentials: {status}", self.service));
        }
        HealmateError::upstream(&self.service, format!("request rejected {status}: {body}"))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs * 1000)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(&request);

        let mut http_req = self
            .http_client
            .post(&url)
            .timeout(self.timeout)
            .json(&body);
        if let Some(ref key) = self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        debug!(service = %self.service, model = %self.model, "Sending chat completion");

        let response = http_req
            .send()
            .await
            .map_err(|e| HealmateError::upstream(&self.service, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body_text = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, retry_after, &body_text));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            HealmateError::upstream(&self.service, format!("unparseable response: {e}"))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| HealmateError::upstream(&self.service, "no choices in response"))?;

        Ok(LlmResponse {
            content: choice.message.content,
            model: parsed.model,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
