//! Placeholder resolver.
//!
//! Pure function from parsed template inputs to concrete JSON. Placeholders
//! that cannot be filled become `null` and are reported back, so the caller
//! decides whether a partially resolved resource may proceed.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::{Map, Value};

use cloudshop_core::{Error, Result};
use cloudshop_store::{FieldType, InputValue, UnresolvedPlaceholder};

/// Inputs nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 64;

/// Output of [`resolve`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    #[serde(rename = "resolvedInputs")]
    pub inputs: Map<String, Value>,
    #[serde(rename = "unresolvedPlaceholders")]
    pub unresolved: Vec<UnresolvedPlaceholder>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Expressions that were left unresolved, in input order.
    pub fn unresolved_expressions(&self) -> Vec<String> {
        self.unresolved
            .iter()
            .map(|u| format!("{} ({})", u.expression, u.key))
            .collect()
    }
}

struct Sources<'a> {
    input_fields: &'a BTreeMap<String, String>,
    parent_outputs: &'a HashMap<String, Map<String, Value>>,
    field_types: &'a BTreeMap<String, FieldType>,
}

/// Resolve `inputs` against the order's input fields and the outputs of
/// completed parent jobs (keyed by parent resource name).
///
/// Values at paths annotated [`FieldType::List`] are wrapped in a
/// one-element array unless they already are arrays or stayed unresolved.
pub fn resolve(
    inputs: &BTreeMap<String, InputValue>,
    field_types: &BTreeMap<String, FieldType>,
    input_fields: &BTreeMap<String, String>,
    parent_outputs: &HashMap<String, Map<String, Value>>,
) -> Result<Resolution> {
    let sources = Sources {
        input_fields,
        parent_outputs,
        field_types,
    };
    let mut resolution = Resolution::default();
    for (key, value) in inputs {
        let resolved = resolve_value(value, key, 1, &sources, &mut resolution.unresolved)?;
        resolution.inputs.insert(key.clone(), resolved);
    }
    Ok(resolution)
}

fn resolve_value(
    value: &InputValue,
    path: &str,
    depth: usize,
    sources: &Sources<'_>,
    unresolved: &mut Vec<UnresolvedPlaceholder>,
) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::Validation(format!(
            "input {} is nested deeper than {} levels",
            path, MAX_DEPTH
        )));
    }

    let resolved = match value {
        InputValue::Literal(v) => v.clone(),
        InputValue::FieldRef(field) => match sources.input_fields.get(field) {
            Some(v) => Value::String(v.clone()),
            None => missing(value, path, unresolved),
        },
        InputValue::OutputRef { parent, field } => match sources
            .parent_outputs
            .get(parent)
            .and_then(|outputs| outputs.get(field))
        {
            Some(v) => v.clone(),
            None => missing(value, path, unresolved),
        },
        InputValue::Object(fields) => {
            let mut out = Map::new();
            for (key, child) in fields {
                let child_path = format!("{}.{}", path, key);
                out.insert(
                    key.clone(),
                    resolve_value(child, &child_path, depth + 1, sources, unresolved)?,
                );
            }
            Value::Object(out)
        }
        InputValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, child) in items.iter().enumerate() {
                let child_path = format!("{}[{}]", path, i);
                out.push(resolve_value(child, &child_path, depth + 1, sources, unresolved)?);
            }
            Value::Array(out)
        }
    };

    Ok(match sources.field_types.get(path) {
        Some(FieldType::List) if !resolved.is_null() && !resolved.is_array() => {
            Value::Array(vec![resolved])
        }
        _ => resolved,
    })
}

fn missing(value: &InputValue, path: &str, unresolved: &mut Vec<UnresolvedPlaceholder>) -> Value {
    unresolved.push(UnresolvedPlaceholder {
        key: path.to_string(),
        expression: value.to_string(),
    });
    Value::Null
}
