//! HTTP adapter for the HealMate turn orchestrator.
//!
//! Chat platforms (LINE webhooks, web chat) post user turns here and relay
//! the reply; the orchestrator itself knows nothing about HTTP.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check (no auth)
//! - `POST /api/v1/turns` - Handle one user turn
//! - `GET /api/v1/sessions/{id}` - Session window, summary and facts
//! - `POST /api/v1/tarot/draw` - Draw a spread with its card meanings
//! - `POST /api/v1/knowledge/query` - Query the knowledge store directly
//! - `GET /api/v1/tools` - Registered tools and their schemas
//!
//! # Architecture
//!
//! ```text
//! Client (LINE bot / web chat)
//!    │
//!    ▼
//! ┌─────────────────┐
//! │   API Adapter   │ ◄── This crate
//! │     (Axum)      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Orchestrator   │
//! └─────────────────┘
//! ```

pub mod auth;
pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use auth::ApiKeyConfig;
pub use state::AppState;

/// Request bodies above this are rejected with 413.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

fn cors_layer(origins: Option<Vec<String>>) -> CorsLayer {
    let origins = origins.unwrap_or_default();
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Create the API router with all routes configured.
pub fn create_router(state: Arc<AppState>, cors_origins: Option<Vec<String>>) -> Router {
    let mut router = Router::new()
        .route("/health", get(routes::health))
        .route("/api/v1/turns", post(routes::handle_turn))
        .route("/api/v1/sessions/{id}", get(routes::get_session))
        .route("/api/v1/tarot/draw", post(routes::draw_tarot))
        .route("/api/v1/knowledge/query", post(routes::query_knowledge))
        .route("/api/v1/tools", get(routes::list_tools));

    if let Some(api_key) = state.api_key.clone() {
        router = router.layer(middleware::from_fn_with_state(api_key, auth::api_key_auth));
    }

    router
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Start the API server on the given address.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    cors_origins: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let router = create_router(state, cors_origins);

    info!(%addr, "Starting HealMate API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
