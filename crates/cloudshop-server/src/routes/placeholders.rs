//! Placeholder resolution preview.
//!
//! Lets the builder UI show what a template will resolve to before an order
//! is orchestrated. Nothing is stored.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use cloudshop_runtime::resolve;
use cloudshop_store::{FieldType, InputValue};

use crate::error::ApiError;
use crate::routes::parse_body;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/placeholders", post(resolve_placeholders))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewTemplate {
    inputs: BTreeMap<String, InputValue>,
    #[serde(default)]
    field_types: BTreeMap<String, FieldType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewRequest {
    template: PreviewTemplate,
    #[serde(default)]
    input_fields: BTreeMap<String, String>,
    /// Outputs keyed by parent resource name.
    #[serde(default)]
    parent_outputs: HashMap<String, Map<String, Value>>,
}

/// POST /api/placeholders
async fn resolve_placeholders(Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    let request: PreviewRequest = parse_body(body)?;
    let resolution = resolve(
        &request.template.inputs,
        &request.template.field_types,
        &request.input_fields,
        &request.parent_outputs,
    )?;

    Ok(Json(json!({
        "success": true,
        "resolvedInputs": resolution.inputs,
        "unresolvedPlaceholders": resolution.unresolved,
    })))
}
