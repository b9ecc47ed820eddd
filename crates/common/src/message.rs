//! Turn data model shared by the orchestrator, memory and transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HealmateError, Result};

/// Longest accepted user message, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 10_000;

/// Text used when a turn carries an image but no words.
pub const IMAGE_ONLY_PROMPT: &str = "請根據這張圖片提供你的分析或見解。";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Image,
    Audio,
}

/// Reference to media stored by the transport (e.g. a LINE content id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub modality: Modality,
    pub reference: String,
}

impl Attachment {
    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            modality: Modality::Image,
            reference: reference.into(),
        }
    }

    pub fn audio(reference: impl Into<String>) -> Self {
        Self {
            modality: Modality::Audio,
            reference: reference.into(),
        }
    }
}

/// One inbound user turn, before orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnInput {
    pub session_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TurnInput {
    pub fn text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(HealmateError::validation("session id must not be empty"));
        }
        if self.text.len() > MAX_MESSAGE_BYTES {
            return Err(HealmateError::validation(format!(
                "message exceeds {MAX_MESSAGE_BYTES} bytes"
            )));
        }
        if self.text.trim().is_empty() && self.attachments.is_empty() {
            return Err(HealmateError::validation("message is empty"));
        }
        if let Some(first) = self.attachments.first() {
            if self.attachments.iter().any(|a| a.modality != first.modality) {
                return Err(HealmateError::validation(
                    "a turn may carry images or audio, not both",
                ));
            }
            if self.attachments.iter().any(|a| a.reference.trim().is_empty()) {
                return Err(HealmateError::validation("attachment reference is empty"));
            }
        }
        Ok(())
    }

    /// Text handed to the model; image-only turns get a default prompt.
    pub fn effective_text(&self) -> String {
        let trimmed = self.text.trim();
        if trimmed.is_empty() && self.modality() == Some(Modality::Image) {
            IMAGE_ONLY_PROMPT.to_string()
        } else {
            trimmed.to_string()
        }
    }

    pub fn modality(&self) -> Option<Modality> {
        self.attachments.first().map(|a| a.modality)
    }
}

/// How the orchestrator decided to handle a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    Direct,
    Actions,
    /// Keyword router used because the model routing call failed.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Audit record of one tool invocation inside a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: serde_json::Value,
    pub idempotency_key: String,
    pub status: ToolCallStatus,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A sealed user/assistant exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub user_text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub route: RouteKind,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub passage_ids: Vec<String>,
    pub reply: String,
    #[serde(default)]
    pub degraded: bool,
}

/// Derive the idempotency key for a tool call within a turn.
pub fn idempotency_key(session_id: &str, turn_id: u64, tool: &str) -> String {
    format!("{session_id}:{turn_id}:{tool}")
}
