//! Bearer-key check for the `/api/*` routes; `/health` stays open.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::warn;

/// The key from `HEALMATE_API_KEY`.
#[derive(Debug, Clone)]
pub struct ApiKeyConfig(Arc<[u8]>);

impl ApiKeyConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().into_bytes().into())
    }

    /// Constant-time compare against the `Authorization: Bearer` token.
    fn accepts(&self, headers: &HeaderMap) -> bool {
        let Some(token) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        token.len() == self.0.len()
            && token
                .bytes()
                .zip(self.0.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

pub async fn api_key_auth(
    State(key): State<ApiKeyConfig>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" || key.accepts(request.headers()) {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "Rejected request without a valid API key");
    let body = json!({
        "error": "missing or invalid API key, use Authorization: Bearer <key>",
        "code": "unauthorized",
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
