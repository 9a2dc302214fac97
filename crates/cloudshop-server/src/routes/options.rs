//! Catalogue option tree.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;

use cloudshop_core::Error;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/options/{option}", get(list_options))
}

/// GET /api/options/{option} — children of an option (plans of a bundle, ...).
async fn list_options(
    State(state): State<Arc<AppState>>,
    Path(option): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let options = state.catalogue.options(&option)?;
    if options.is_empty() {
        return Err(Error::NotFound(format!("options under {}", option)).into());
    }
    Ok(Json(options))
}
