//! Health and store summary.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use cloudshop_store::schema::{BUILDER, JOBS, ORDERS, RESOURCES};

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

/// GET /api/health — liveness plus collection counts.
async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let everything = json!({});
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now().to_rfc3339(),
        "db": state.store.db_path().display().to_string(),
        "defaultRegion": state.config.default_region,
        "counts": {
            "orders": state.store.count(ORDERS, &everything)?,
            "jobs": state.store.count(JOBS, &everything)?,
            "templates": state.store.count(RESOURCES, &everything)?,
            "builder": state.store.count(BUILDER, &everything)?,
        },
    })))
}
