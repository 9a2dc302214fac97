//! HTTP route handlers.

pub mod health;
pub mod jobs;
pub mod options;
pub mod orchestrate;
pub mod orders;
pub mod placeholders;

use std::sync::Arc;

use axum::Router;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(health::routes())
        .merge(orchestrate::routes())
        .merge(orders::routes())
        .merge(jobs::routes())
        .merge(options::routes())
        .merge(placeholders::routes())
}

/// Decode a JSON body, reporting shape errors as 400s.
pub(crate) fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::bad_request(format!("invalid request: {}", e)))
}
