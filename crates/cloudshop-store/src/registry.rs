//! Resource registry — resource type → creation template.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::schema::RESOURCES;
use crate::sqlite::DocumentStore;
use crate::types::ResourceTemplate;
use cloudshop_core::{Error, Result};

/// Read-mostly lookup of [`ResourceTemplate`]s by type.
#[derive(Clone)]
pub struct ResourceRegistry {
    store: Arc<DocumentStore>,
}

impl ResourceRegistry {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Template for `resource_type`. Unknown types are an error, never a default.
    ///
    /// Placeholders are parsed here, so a malformed template fails the lookup.
    pub fn lookup(&self, resource_type: &str) -> Result<ResourceTemplate> {
        let record = self
            .store
            .find_one(RESOURCES, &json!({ "type": resource_type }))?
            .ok_or_else(|| Error::NotFound(format!("resource template {}", resource_type)))?;

        let template: ResourceTemplate = record.decode().map_err(|e| {
            Error::Validation(format!("resource template {} is invalid: {}", resource_type, e))
        })?;
        debug!("Loaded template {} → {}", resource_type, template.api);
        Ok(template)
    }

    /// Insert or replace the template for its type. Returns the document id.
    pub fn register(&self, template: &ResourceTemplate) -> Result<String> {
        if template.resource_type.trim().is_empty() || template.api.trim().is_empty() {
            return Err(Error::Validation(
                "resource template requires type and api".to_string(),
            ));
        }
        let mut body = serde_json::to_value(template)?;
        if let Some(map) = body.as_object_mut() {
            map.remove("_id");
        }
        let id = self.store.upsert(
            RESOURCES,
            &json!({ "type": template.resource_type }),
            body,
        )?;
        info!("Registered resource template {}", template.resource_type);
        Ok(id)
    }
}
