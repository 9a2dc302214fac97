//! Storefront catalogue — the option tree the UI browses and the builder
//! entries that turn a bundle + plan into a resource list.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::schema::{BUILDER, OPTIONS};
use crate::sqlite::DocumentStore;
use crate::types::BuilderEntry;
use cloudshop_core::{Error, Result};

#[derive(Clone)]
pub struct Catalogue {
    store: Arc<DocumentStore>,
}

impl Catalogue {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Options listed under `parent` (a bundle, or an option id for its plans).
    pub fn options(&self, parent: &str) -> Result<Vec<Value>> {
        Ok(self
            .store
            .find(OPTIONS, &json!({ "parent": parent }))?
            .iter()
            .map(|r| r.to_json())
            .collect())
    }

    pub fn add_option(&self, option: Value) -> Result<String> {
        if option.get("parent").and_then(Value::as_str).is_none() {
            return Err(Error::Validation("option requires a parent".to_string()));
        }
        self.store.insert(OPTIONS, option)
    }

    /// Builder entry for a bundle + plan.
    pub fn builder_entry(&self, bundle: &str, plan: &str) -> Result<BuilderEntry> {
        self.store
            .find_one(BUILDER, &json!({ "bundle": bundle, "plan": plan }))?
            .ok_or_else(|| Error::NotFound(format!("builder entry {}/{}", bundle, plan)))?
            .decode()
    }

    /// Insert or replace the builder entry for its bundle + plan.
    pub fn put_builder_entry(&self, entry: &BuilderEntry) -> Result<String> {
        self.store.upsert(
            BUILDER,
            &json!({ "bundle": entry.bundle, "plan": entry.plan }),
            serde_json::to_value(entry)?,
        )
    }
}
