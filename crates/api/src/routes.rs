//! HTTP route handlers for the API.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use healmate_common::{Attachment, ErrorKind, HealmateError, RouteKind, TurnInput};
use healmate_coordinator::TurnReply;
use healmate_memory::{KnowledgeDomain, RetrievedPassage};
use healmate_tools::{ToolContext, ToolName, ToolOutput, ToolRequest, ToolSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::AppState;

/// Session id used for tarot draws made outside a conversation.
const ANONYMOUS_SESSION: &str = "anonymous";

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub sessions: usize,
    pub summary_failures: u64,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let memory = state.orchestrator.memory();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        sessions: memory.session_count(),
        summary_failures: memory.summary_failures(),
    })
}

/// API error response. `reply` is safe to show to the end user.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorKind,
    pub reply: String,
    #[serde(skip)]
    pub retry_after_ms: Option<u64>,
    #[serde(skip)]
    status: Option<StatusCode>,
}

impl ErrorResponse {
    fn not_found(error: String, reply: &str) -> Self {
        Self {
            error,
            code: ErrorKind::Validation,
            reply: reply.to_string(),
            retry_after_ms: None,
            status: Some(StatusCode::NOT_FOUND),
        }
    }
}

impl From<HealmateError> for ErrorResponse {
    fn from(e: HealmateError) -> Self {
        Self {
            error: e.to_string(),
            code: e.kind(),
            reply: e.user_reply(),
            retry_after_ms: e.retry_after_ms(),
            status: None,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status.unwrap_or(match self.code {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::TurnTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamUnavailable | ErrorKind::RequiredToolFailed => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        });
        let retry_after = self
            .retry_after_ms
            .map(|ms| ms.div_ceil(1000))
            .and_then(|secs| HeaderValue::from_str(&secs.to_string()).ok());

        let mut response = (status, Json(self)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

/// Turn request body.
#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Handle one user turn.
pub async fn handle_turn(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnReply>, ErrorResponse> {
    info!(
        session_id = %request.session_id,
        content_preview = %request.text.chars().take(50).collect::<String>(),
        attachments = request.attachments.len(),
        "Received turn"
    );

    let input = TurnInput {
        session_id: request.session_id,
        text: request.text,
        attachments: request.attachments,
    };
    match state.orchestrator.handle_turn(input).await {
        Ok(reply) => Ok(Json(reply)),
        Err(e) => {
            match e.kind() {
                ErrorKind::Validation => warn!(error = %e, "Turn rejected"),
                _ => error!(error = %e, "Turn failed"),
            }
            Err(e.into())
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TurnView {
    pub id: u64,
    pub timestamp: String,
    pub route: RouteKind,
    pub user_text: String,
    pub reply: String,
    pub degraded: bool,
    pub citations: Vec<String>,
    pub tools: Vec<String>,
}

/// Session snapshot response.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub summary: String,
    pub facts: BTreeMap<String, String>,
    pub evicted_turns: u64,
    pub turns: Vec<TurnView>,
}

/// Read a session's window, summary and facts.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ErrorResponse> {
    debug!(session_id = %session_id, "Getting session");

    let Some(session) = state.orchestrator.memory().get_session(&session_id).await? else {
        return Err(ErrorResponse::not_found(
            format!("Session {session_id} not found"),
            "找不到這段對話。",
        ));
    };

    let turns = session
        .window
        .iter()
        .map(|t| TurnView {
            id: t.id,
            timestamp: t.timestamp.to_rfc3339(),
            route: t.route,
            user_text: t.user_text.clone(),
            reply: t.reply.clone(),
            degraded: t.degraded,
            citations: t.passage_ids.clone(),
            tools: t.tool_calls.iter().map(|c| c.tool.clone()).collect(),
        })
        .collect();

    Ok(Json(SessionResponse {
        session_id,
        summary: session.summary,
        facts: session.facts,
        evicted_turns: session.evicted_turns,
        turns,
    }))
}

/// Tarot draw request body.
#[derive(Debug, Default, Deserialize)]
pub struct TarotDrawRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub spread: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct TarotDrawResponse {
    pub draw: ToolOutput,
    pub meanings: Vec<RetrievedPassage>,
    pub degraded: bool,
}

/// Draw a spread outside a conversation, with the cards' meanings.
pub async fn draw_tarot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TarotDrawRequest>,
) -> Result<Json<TarotDrawResponse>, ErrorResponse> {
    let mut arguments = serde_json::Map::new();
    if let Some(spread) = request.spread {
        arguments.insert("spread".to_string(), spread);
    }
    let tool_request = ToolRequest::parse(ToolName::DrawTarot, Value::Object(arguments))?;

    let session_id = request
        .session_id
        .unwrap_or_else(|| ANONYMOUS_SESSION.to_string());
    let ctx = ToolContext::new(session_id, 0);
    let draw = state.orchestrator.tools().execute(&ctx, tool_request).await?;

    let grounded = match &draw {
        ToolOutput::Tarot(draw) => Some(
            state
                .orchestrator
                .retrieval()
                .compose(&draw.meaning_query(), Some(KnowledgeDomain::Tarot))
                .await,
        ),
        _ => None,
    };
    let (meanings, degraded) = grounded
        .map(|g| (g.passages, g.degraded))
        .unwrap_or_default();

    Ok(Json(TarotDrawResponse {
        draw,
        meanings,
        degraded,
    }))
}

/// Knowledge query request body.
#[derive(Debug, Deserialize)]
pub struct KnowledgeQueryRequest {
    pub query: String,
    #[serde(default)]
    pub domain: Option<KnowledgeDomain>,
}

#[derive(Debug, Serialize)]
pub struct KnowledgeQueryResponse {
    pub passages: Vec<RetrievedPassage>,
    pub context: String,
    pub degraded: bool,
}

/// Run a retrieval query directly against the knowledge store.
pub async fn query_knowledge(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KnowledgeQueryRequest>,
) -> Result<Json<KnowledgeQueryResponse>, ErrorResponse> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(HealmateError::validation("query must not be empty").into());
    }
    debug!(domain = ?request.domain, "Knowledge query");

    let grounded = state
        .orchestrator
        .retrieval()
        .compose(query, request.domain)
        .await;

    Ok(Json(KnowledgeQueryResponse {
        passages: grounded.passages,
        context: grounded.text,
        degraded: grounded.degraded,
    }))
}

/// List the registered tools and their schemas.
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<&'static [ToolSpec]> {
    Json(state.orchestrator.tools().specs())
}
