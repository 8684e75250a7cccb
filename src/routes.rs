use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::handlers::{aggregate_query, health_check, stats};
use crate::state::GatewayState;
use crate::subscribers::handle_websocket;

/// Build the HTTP surface
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/receive/ws", get(handle_websocket))
        .route("/receive/ajax", get(aggregate_query))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .with_state(state)
}

/// CORS for the configured origins; `*` allows any origin
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    cors.allow_origin(allowed)
}
