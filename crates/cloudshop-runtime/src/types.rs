//! Runtime types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cloudshop_core::Error;

/// What happened to one resource during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Created during this run.
    Completed,
    /// A completed job already existed; nothing was done.
    Skipped,
    Failed,
    /// Never started because a dependency failed.
    Blocked,
    /// A fresh `created` job from another run exists.
    InFlight,
}

impl ResourceState {
    /// Whether the resource is provisioned after the run.
    pub fn is_done(&self) -> bool {
        matches!(self, ResourceState::Completed | ResourceState::Skipped)
    }
}

/// Per-resource result returned by an orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOutcome {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub status: ResourceState,
    #[serde(rename = "jobID", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ResourceOutcome {
    pub fn new(name: &str, resource_type: &str, status: ResourceState) -> Self {
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            status,
            job_id: None,
            outputs: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn with_job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    pub fn with_outputs(mut self, outputs: Map<String, Value>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_error(mut self, error: &Error) -> Self {
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind().to_string());
        self
    }
}

/// Result of [`crate::Orchestrator::orchestrate`], in topological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationReport {
    #[serde(rename = "orderID")]
    pub order_id: String,
    pub success: bool,
    pub results: Vec<ResourceOutcome>,
}

impl OrchestrationReport {
    pub fn outcome(&self, name: &str) -> Option<&ResourceOutcome> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// Caller switches for a single run.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Let resources with unresolved placeholders proceed with `null` values.
    #[serde(default)]
    pub allow_unresolved: bool,
}
