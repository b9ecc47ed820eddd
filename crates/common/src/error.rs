//! Error types for HealMate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealmateError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream unavailable ({service}): {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("Rate limited by {service}")]
    RateLimited {
        service: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Turn timed out after {0} ms")]
    TurnTimeout(u64),

    #[error("Idempotency key {key} reused with different arguments")]
    ToolIdempotencyConflict { key: String },

    #[error("Required tool {tool} failed: {reason}")]
    RequiredToolFailed { tool: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used by the orchestrator and the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UpstreamUnavailable,
    RateLimited,
    TurnTimeout,
    RequiredToolFailed,
    Internal,
}

impl HealmateError {
    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn rate_limited(service: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited {
            service: service.into(),
            retry_after_ms,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Idempotency conflicts are caller mistakes and classify as validation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::ToolIdempotencyConflict { .. } => ErrorKind::Validation,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::TurnTimeout(_) => ErrorKind::TurnTimeout,
            Self::RequiredToolFailed { .. } => ErrorKind::RequiredToolFailed,
            Self::Config(_) | Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UpstreamUnavailable | ErrorKind::RateLimited
        )
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Text shown to the end user when a turn ends in this error.
    pub fn user_reply(&self) -> String {
        match self {
            Self::Validation(msg) => format!("我不太確定你的意思，可以再說明一下嗎？（{msg}）"),
            Self::ToolIdempotencyConflict { .. } => {
                "這筆紀錄和剛才送出的內容不一致，可以再確認一次你想記錄的心情嗎？".to_string()
            }
            Self::RequiredToolFailed { tool, .. } => {
                format!("抱歉，{}暫時無法完成，請稍後再試一次。", tool_display_name(tool))
            }
            Self::TurnTimeout(_) => "抱歉，這次回覆花了太久時間，請再試一次。".to_string(),
            _ => "抱歉，我現在遇到一點問題，暫時無法回應。".to_string(),
        }
    }
}

fn tool_display_name(tool: &str) -> &str {
    match tool {
        "record-mood" => "心情紀錄",
        "query-mood-history" => "心情歷史查詢",
        "draw-tarot" => "塔羅抽牌",
        "lookup-horoscope" => "星座運勢查詢",
        "classify-emotion" => "情緒分析",
        other => other,
    }
}

pub type Result<T> = std::result::Result<T, HealmateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_conflict_classifies_as_validation() {
        let err = HealmateError::ToolIdempotencyConflict {
            key: "s1:3:record-mood".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(HealmateError::upstream("qdrant", "connection refused").is_retryable());
        assert!(HealmateError::rate_limited("openai", Some(2000)).is_retryable());
        assert!(!HealmateError::validation("empty message").is_retryable());
        assert!(!HealmateError::TurnTimeout(1000).is_retryable());
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        assert_eq!(
            HealmateError::rate_limited("openai", Some(5000)).retry_after_ms(),
            Some(5000)
        );
        assert_eq!(HealmateError::upstream("x", "y").retry_after_ms(), None);
    }

    #[test]
    fn required_tool_reply_names_the_tool() {
        let err = HealmateError::RequiredToolFailed {
            tool: "record-mood".to_string(),
            reason: "db down".to_string(),
        };
        assert!(err.user_reply().contains("心情紀錄"));
        assert!(!err.user_reply().contains("db down"));
    }
}
