//! Template input values.
//!
//! Raw template and order inputs are JSON. Strings that name a user field
//! (`inputFields.sitename`) or another resource's output (`vpc.outputs.VpcId`)
//! are parsed into tagged variants when the document is loaded, so nothing
//! downstream inspects string prefixes. Both `{{...}}`-delimited and bare
//! forms are accepted and serialize back in the bare form.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use cloudshop_core::{Error, Result};

static FIELD_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^inputFields\.([A-Za-z0-9_\-]+)$").expect("valid regex"));
static OUTPUT_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_\-]+)\.outputs\.([A-Za-z0-9_\-]+)$").expect("valid regex")
});

/// A single template input, literal or placeholder, possibly nested.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// A scalar copied through unchanged.
    Literal(Value),
    /// `inputFields.<name>`: a value the user typed into the order form.
    FieldRef(String),
    /// `<parent>.outputs.<field>`: an output recorded on a completed job.
    OutputRef { parent: String, field: String },
    Object(BTreeMap<String, InputValue>),
    List(Vec<InputValue>),
}

impl InputValue {
    /// Parse raw JSON into an input value.
    pub fn parse(raw: &Value) -> Result<Self> {
        match raw {
            Value::String(s) => Self::parse_str(s),
            Value::Object(map) => {
                let mut fields = BTreeMap::new();
                for (key, value) in map {
                    fields.insert(key.clone(), Self::parse(value)?);
                }
                Ok(InputValue::Object(fields))
            }
            Value::Array(items) => items
                .iter()
                .map(Self::parse)
                .collect::<Result<Vec<_>>>()
                .map(InputValue::List),
            scalar => Ok(InputValue::Literal(scalar.clone())),
        }
    }

    fn parse_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let delimited = trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.len() >= 4;
        let expr = if delimited {
            trimmed[2..trimmed.len() - 2].trim()
        } else {
            trimmed
        };

        if let Some(caps) = FIELD_REF.captures(expr) {
            return Ok(InputValue::FieldRef(caps[1].to_string()));
        }
        if let Some(caps) = OUTPUT_REF.captures(expr) {
            return Ok(InputValue::OutputRef {
                parent: caps[1].to_string(),
                field: caps[2].to_string(),
            });
        }
        if delimited {
            return Err(Error::Validation(format!(
                "malformed placeholder {:?}: expected inputFields.<field> or <parent>.outputs.<field>",
                raw
            )));
        }
        Ok(InputValue::Literal(Value::String(raw.to_string())))
    }

    /// Parse every entry of a raw input map.
    pub fn parse_map(raw: &serde_json::Map<String, Value>) -> Result<BTreeMap<String, InputValue>> {
        raw.iter()
            .map(|(k, v)| Ok((k.clone(), Self::parse(v)?)))
            .collect()
    }

    /// Names of every resource whose outputs this value refers to.
    pub fn referenced_parents(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_parents(&mut out);
        out
    }

    fn collect_parents(&self, out: &mut BTreeSet<String>) {
        match self {
            InputValue::OutputRef { parent, .. } => {
                out.insert(parent.clone());
            }
            InputValue::Object(fields) => fields.values().for_each(|v| v.collect_parents(out)),
            InputValue::List(items) => items.iter().for_each(|v| v.collect_parents(out)),
            InputValue::Literal(_) | InputValue::FieldRef(_) => {}
        }
    }

    /// Back to raw JSON; placeholders become their bare dotted form.
    pub fn to_json(&self) -> Value {
        match self {
            InputValue::Literal(v) => v.clone(),
            InputValue::FieldRef(_) | InputValue::OutputRef { .. } => Value::String(self.to_string()),
            InputValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            InputValue::List(items) => Value::Array(items.iter().map(InputValue::to_json).collect()),
        }
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::FieldRef(name) => write!(f, "inputFields.{}", name),
            InputValue::OutputRef { parent, field } => write!(f, "{}.outputs.{}", parent, field),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Names of every resource referenced anywhere in an input map.
pub fn referenced_parents(inputs: &BTreeMap<String, InputValue>) -> BTreeSet<String> {
    inputs
        .values()
        .flat_map(InputValue::referenced_parents)
        .collect()
}

/// Overlay `overrides` on `base`, key by key.
pub fn merge_inputs(
    base: &BTreeMap<String, InputValue>,
    overrides: &BTreeMap<String, InputValue>,
) -> BTreeMap<String, InputValue> {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

impl Serialize for InputValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        InputValue::parse(&raw).map_err(D::Error::custom)
    }
}
