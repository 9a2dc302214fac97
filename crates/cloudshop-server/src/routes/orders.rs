//! Order placement and lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use cloudshop_core::Error;
use cloudshop_store::{Job, Order, OrderStatus};

use crate::error::ApiError;
use crate::routes::parse_body;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(place_order))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/submit", post(submit_order))
        .route("/orders/{id}/jobs", get(list_jobs))
        .route("/orders/{id}/jobs/{name}", get(get_job))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderRequest {
    bundle: String,
    plan: String,
    #[serde(default)]
    input_fields: Map<String, Value>,
}

/// POST /api/orders — place an order for a catalogue bundle + plan.
async fn place_order(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: PlaceOrderRequest = parse_body(body)?;
    if request.bundle.trim().is_empty() || request.plan.trim().is_empty() {
        return Err(ApiError::bad_request("bundle and plan are required"));
    }
    let input_fields = stringify_fields(request.input_fields)?;

    let entry = state
        .catalogue
        .builder_entry(&request.bundle, &request.plan)?;
    let id = state.orders.place(&entry, input_fields)?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id }))))
}

/// GET /api/orders/{id}
async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    Ok(Json(state.orders.get_order(&id)?))
}

/// POST /api/orders/{id}/submit — confirm a reviewed order for provisioning.
async fn submit_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    state.orders.set_status(&id, OrderStatus::Submitted)?;
    Ok(Json(state.orders.get_order(&id)?))
}

/// GET /api/orders/{id}/jobs — every job of the order, oldest first.
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Job>>, ApiError> {
    state.orders.get_order(&id)?;
    Ok(Json(state.ledger.list_jobs(&id)?))
}

/// GET /api/orders/{id}/jobs/{name} — the job recorded for one resource.
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .ledger
        .find_job(&id, &name)?
        .ok_or_else(|| Error::NotFound(format!("job {} in order {}", name, id)))?;
    Ok(Json(job))
}

/// Form values arrive as JSON scalars; orders store them as strings.
fn stringify_fields(raw: Map<String, Value>) -> Result<BTreeMap<String, String>, ApiError> {
    let mut fields = BTreeMap::new();
    for (key, value) in raw {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(_) | Value::Number(_) => value.to_string(),
            _ => {
                return Err(ApiError::bad_request(format!(
                    "inputFields.{} must be a scalar",
                    key
                )))
            }
        };
        fields.insert(key, text);
    }
    Ok(fields)
}
