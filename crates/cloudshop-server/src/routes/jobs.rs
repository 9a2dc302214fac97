//! Job lookup by id.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use cloudshop_core::Error;
use cloudshop_store::Job;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/jobs/{id}", get(get_job))
}

/// GET /api/jobs/{id}
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .ledger
        .get_job(&id)?
        .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
    Ok(Json(job))
}
