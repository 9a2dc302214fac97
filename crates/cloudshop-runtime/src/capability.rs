//! Creation capability — the seam between the orchestrator and whatever
//! actually creates cloud resources.
//!
//! [`HttpCapability`] posts to the per-resource creation endpoints
//! (`POST <base><api>`); tests substitute in-process implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use cloudshop_core::{Error, Result};

/// Everything a capability needs to create one resource.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub order_id: String,
    pub name: String,
    pub resource_type: String,
    pub api: String,
    pub region: String,
    pub inputs: Map<String, Value>,
}

impl CapabilityRequest {
    /// Wire body: `{id, region, name, ...inputs}`. Resolved inputs are laid
    /// over the envelope; an input `name` is the tag the endpoint applies.
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("id".into(), Value::String(self.order_id.clone()));
        body.insert("region".into(), Value::String(self.region.clone()));
        body.insert("name".into(), Value::String(self.name.clone()));
        body.extend(self.inputs.clone());
        Value::Object(body)
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    /// Create the resource and return its outputs.
    async fn create(&self, request: &CapabilityRequest) -> Result<Map<String, Value>>;
}

/// Capability backed by the storefront's HTTP creation endpoints.
#[derive(Debug, Clone)]
pub struct HttpCapability {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCapability {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, api: &str) -> String {
        if api.starts_with("http://") || api.starts_with("https://") {
            api.to_string()
        } else if api.starts_with('/') {
            format!("{}{}", self.base_url, api)
        } else {
            format!("{}/{}", self.base_url, api)
        }
    }
}

#[async_trait]
impl Capability for HttpCapability {
    async fn create(&self, request: &CapabilityRequest) -> Result<Map<String, Value>> {
        let url = self.endpoint(&request.api);
        debug!("POST {} for {}/{}", url, request.order_id, request.name);

        let response = self
            .client
            .post(&url)
            .json(&request.body())
            .send()
            .await
            .map_err(|e| Error::Capability(format!("{} request failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Capability(format!("{} response unreadable: {}", url, e)))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let message = error_message(&body).unwrap_or_else(|| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    text.clone()
                }
            });
            return Err(Error::Capability(format!("{} ({})", message, status.as_u16())));
        }

        let Value::Object(body) = body else {
            return Err(Error::Capability(format!(
                "{} returned a non-object response",
                url
            )));
        };
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            let message = error_message(&Value::Object(body.clone()))
                .unwrap_or_else(|| "creation reported failure".to_string());
            return Err(Error::Capability(message));
        }

        Ok(extract_outputs(body))
    }
}

/// `outputs` if the endpoint returned one, otherwise `details` merged with the
/// top-level scalar fields.
pub fn extract_outputs(mut body: Map<String, Value>) -> Map<String, Value> {
    if let Some(Value::Object(outputs)) = body.remove("outputs") {
        return outputs;
    }

    let mut outputs = match body.remove("details") {
        Some(Value::Object(details)) => details,
        _ => Map::new(),
    };
    for (key, value) in body {
        if key == "success" || key == "message" {
            continue;
        }
        if !value.is_object() && !value.is_array() {
            outputs.entry(key).or_insert(value);
        }
    }
    outputs
}

fn error_message(body: &Value) -> Option<String> {
    let error = body
        .get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)?;
    Some(match body.get("details") {
        Some(Value::String(details)) => format!("{}: {}", error, details),
        Some(details) if !details.is_null() => format!("{}: {}", error, details),
        _ => error.to_string(),
    })
}
