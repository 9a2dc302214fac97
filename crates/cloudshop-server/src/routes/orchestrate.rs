//! Orchestration trigger.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use cloudshop_core::Error;
use cloudshop_runtime::{OrchestrationReport, RunOptions};

use crate::error::ApiError;
use crate::routes::parse_body;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/orchestrate", post(orchestrate))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrchestrateRequest {
    #[serde(rename = "orderID")]
    order_id: String,
    #[serde(default)]
    allow_unresolved: bool,
}

/// POST /api/orchestrate — provision every resource of an order.
///
/// The run is spawned so a dropped connection does not abandon it halfway.
async fn orchestrate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<OrchestrationReport>, ApiError> {
    let request: OrchestrateRequest = parse_body(body)?;
    if request.order_id.trim().is_empty() {
        return Err(ApiError::bad_request("orderID is required"));
    }
    info!("Orchestration requested for order {}", request.order_id);

    let orchestrator = state.orchestrator.clone();
    let options = RunOptions {
        allow_unresolved: request.allow_unresolved,
    };
    let order_id = request.order_id;
    let report = tokio::spawn(async move { orchestrator.orchestrate(&order_id, options).await })
        .await
        .map_err(|e| ApiError::from(Error::Internal(format!("orchestration task failed: {}", e))))?
        .map_err(ApiError::graph)?;

    Ok(Json(report))
}
