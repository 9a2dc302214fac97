//! Data types for orders, resource templates and jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::input::InputValue;

/// Lifecycle of an order.
///
/// `InProgress` doubles as the advisory lock held by an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Review,
    Submitted,
    InProgress,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Review => "Review",
            OrderStatus::Submitted => "Submitted",
            OrderStatus::InProgress => "InProgress",
            OrderStatus::Completed => "Completed",
            OrderStatus::Failed => "Failed",
        }
    }
}

/// A user's bundle + plan request and the resources it expands to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: String,
    pub bundle: String,
    pub plan: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub input_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Order contents before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub bundle: String,
    pub plan: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub input_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
    pub status: OrderStatus,
}

/// One resource inside an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Unique within the order; jobs are keyed by it.
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Names of resources in the same order that must be created first.
    #[serde(default, deserialize_with = "one_or_many")]
    pub parent: Vec<String>,
    /// Coarse sequencing hint; only breaks ties between independent resources.
    #[serde(default)]
    pub order: i64,
    /// Per-resource overrides laid over the template inputs.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
}

/// How a resolved field is shaped for the creation capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Scalar,
    /// The capability expects a list; a single resolved value is wrapped.
    List,
}

/// Registry entry describing how to create one resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Creation endpoint, e.g. `/api/aws/ec2/create-vpc`.
    pub api: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Parent resource *types* this template expects (advisory).
    #[serde(default, deserialize_with = "parent_types")]
    pub parent: Vec<String>,
    /// Field shape annotations keyed by input path (`SecurityGroupIds`, `Tags[0].Value`).
    #[serde(default)]
    pub field_types: BTreeMap<String, FieldType>,
}

/// Status of a job in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// A placeholder the resolver could not fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedPlaceholder {
    /// Path of the input, e.g. `name` or `TagSpecifications[0].Tags[0].Value`.
    pub key: String,
    /// The placeholder expression in bare form.
    pub expression: String,
}

/// Durable record of one resource-creation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "orderID")]
    pub order_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub api: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub status: JobStatus,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<UnresolvedPlaceholder>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a job is created (or restarted).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    #[serde(rename = "orderID")]
    pub order_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub api: String,
    pub region: String,
    pub inputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<UnresolvedPlaceholder>,
}

/// A status transition recorded on a job.
#[derive(Debug, Clone)]
pub struct JobPatch {
    pub status: JobStatus,
    pub outputs: Option<Map<String, Value>>,
    pub error: Option<String>,
}

impl JobPatch {
    pub fn completed(outputs: Map<String, Value>) -> Self {
        Self {
            status: JobStatus::Completed,
            outputs: Some(outputs),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            outputs: None,
            error: Some(error.into()),
        }
    }
}

/// Catalogue entry mapping a bundle + plan to its region and resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderEntry {
    pub bundle: String,
    pub plan: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

/// Accepts `"vpc"`, `["vpc", "sg"]` or null.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) if s.is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Accepts `["AWS::EC2::VPC"]` or the keyed form `[{"vpc": "AWS::EC2::VPC"}]`.
fn parent_types<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut types = Vec::new();
    for entry in raw {
        match entry {
            Value::String(s) => types.push(s),
            Value::Object(map) => {
                types.extend(map.into_iter().filter_map(|(_, v)| v.as_str().map(String::from)))
            }
            _ => {}
        }
    }
    Ok(types)
}
