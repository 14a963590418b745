//! HTTP surface: the WebSocket endpoint plus a health check.

use axum::{extract::State, routing::get, Json, Router};
use ::http::{HeaderValue, Method};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::websocket::{websocket_router, WebSocketState};

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
}

async fn health(State(state): State<WebSocketState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.dispatcher.connection_count(),
    })
}

/// Build the CORS layer for the given origins. Unparseable origins are
/// skipped with a warning.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
}

/// Create the application router.
///
/// Routes:
/// - `GET /` - WebSocket upgrade
/// - `GET /health` - liveness and connection count
pub fn app_router(state: WebSocketState, cors_origins: &[String]) -> Router {
    Router::new()
        .merge(websocket_router())
        .route("/health", get(health))
        .with_state(state)
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}
