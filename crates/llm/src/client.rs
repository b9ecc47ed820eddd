use async_trait::async_trait;
use healmate_common::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider to constrain output to a JSON object.
    #[serde(default)]
    pub json_mode: bool,
}

impl LlmRequest {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system_prompt: Some(system_prompt.into()),
            messages,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse>;
    fn model_name(&self) -> &str;
}

#[async_trait]
impl LlmClient for Box<dyn LlmClient> {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        (**self).complete(request).await
    }
    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let request = LlmRequest::new("You are HealMate.", vec![ChatMessage::user("嗨")])
            .with_temperature(0.2)
            .with_max_tokens(256)
            .json();
        assert_eq!(request.system_prompt.as_deref(), Some("You are HealMate."));
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(256));
        assert!(request.json_mode);
    }

    #[test]
    fn json_mode_defaults_to_false_when_absent() {
        let json = r#"{"system_prompt":null,"messages":[],"temperature":null,"max_tokens":null}"#;
        let request: LlmRequest = serde_json::from_str(json).unwrap();
        assert!(!request.json_mode);
    }

    #[test]
    fn llm_response_deserializes_without_usage() {
        let json = r#"{"content":"你好","model":"deepseek-chat","usage":null,"finish_reason":"stop"}"#;
        let response: LlmResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.content, "你好");
        assert!(response.usage.is_none());
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
