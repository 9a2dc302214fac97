//! Catalogue seeding — loads resource templates, builder entries and
//! storefront options from a JSON file.
//!
//! Expected shape:
//!
//! ```json
//! { "resources": [ {template}, ... ], "builder": [ {entry}, ... ], "options": [ {...}, ... ] }
//! ```
//!
//! Templates and builder entries are upserted (by type, and by bundle + plan),
//! so seeding the same file twice is harmless. Options are appended.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use cloudshop_store::{BuilderEntry, Catalogue, DocumentStore, ResourceRegistry, ResourceTemplate};

/// Result of a seed run.
#[derive(Debug, Default)]
pub struct SeedReport {
    pub templates: usize,
    pub builder_entries: usize,
    pub options: usize,
    pub errors: Vec<String>,
}

/// Load `path` into `store`. Bad entries are reported and skipped.
pub fn run_seed(path: &Path, store: Arc<DocumentStore>) -> SeedReport {
    let mut report = SeedReport::default();

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            report
                .errors
                .push(format!("Failed to read {}: {}", path.display(), e));
            return report;
        }
    };
    let doc: Value = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            report.errors.push(format!("Invalid JSON: {}", e));
            return report;
        }
    };

    let registry = ResourceRegistry::new(store.clone());
    for (i, entry) in section(&doc, "resources").iter().enumerate() {
        let outcome = serde_json::from_value::<ResourceTemplate>(entry.clone())
            .map_err(|e| e.to_string())
            .and_then(|t| registry.register(&t).map_err(|e| e.to_string()));
        match outcome {
            Ok(_) => report.templates += 1,
            Err(e) => report.errors.push(format!("resources[{}]: {}", i, e)),
        }
    }

    let catalogue = Catalogue::new(store);
    for (i, entry) in section(&doc, "builder").iter().enumerate() {
        let outcome = serde_json::from_value::<BuilderEntry>(entry.clone())
            .map_err(|e| e.to_string())
            .and_then(|b| catalogue.put_builder_entry(&b).map_err(|e| e.to_string()));
        match outcome {
            Ok(_) => report.builder_entries += 1,
            Err(e) => report.errors.push(format!("builder[{}]: {}", i, e)),
        }
    }

    for (i, option) in section(&doc, "options").iter().enumerate() {
        match catalogue.add_option(option.clone()) {
            Ok(_) => report.options += 1,
            Err(e) => report.errors.push(format!("options[{}]: {}", i, e)),
        }
    }

    if report.errors.is_empty() {
        info!(
            "Seeded {} templates, {} builder entries, {} options",
            report.templates, report.builder_entries, report.options
        );
    } else {
        warn!("Seeding finished with {} errors", report.errors.len());
    }
    report
}

fn section<'a>(doc: &'a Value, key: &str) -> &'a [Value] {
    doc.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn print_report(report: &SeedReport) {
    println!("=== CloudShop Seed Report ===");
    println!();
    println!("Templates:          {}", report.templates);
    println!("Builder entries:    {}", report.builder_entries);
    println!("Options:            {}", report.options);

    if !report.errors.is_empty() {
        println!();
        println!("Errors:");
        for e in &report.errors {
            println!("  - {}", e);
        }
    }

    println!();
    if report.errors.is_empty() {
        println!("Status: OK");
    } else {
        println!("Status: SEED INCOMPLETE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudshop_store::FieldType;
    use serde_json::json;

    fn test_store(dir: &Path) -> Arc<DocumentStore> {
        Arc::new(DocumentStore::open(dir.join("cloudshop.db")).unwrap())
    }

    fn write_seed(dir: &Path, doc: Value) -> std::path::PathBuf {
        let path = dir.join("seed.json");
        std::fs::write(&path, doc.to_string()).unwrap();
        path
    }

    #[test]
    fn test_seed_loads_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let path = write_seed(
            dir.path(),
            json!({
                "resources": [
                    {"type": "VPC", "api": "/api/aws/ec2/create-vpc",
                     "inputs": {"CidrBlock": "10.0.0.0/16", "name": "inputFields.sitename"}},
                    {"type": "EC2", "api": "/api/aws/ec2/create-instance",
                     "inputs": {"SecurityGroupIds": "{{sg.outputs.GroupId}}"},
                     "fieldTypes": {"SecurityGroupIds": "list"}}
                ],
                "builder": [
                    {"bundle": "starter", "plan": "basic", "region": "us-east-1",
                     "resources": [{"name": "vpc", "type": "VPC"}]}
                ],
                "options": [{"parent": "starter", "name": "basic"}]
            }),
        );

        let report = run_seed(&path, store.clone());
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.templates, 2);
        assert_eq!(report.builder_entries, 1);
        assert_eq!(report.options, 1);

        let ec2 = ResourceRegistry::new(store.clone()).lookup("EC2").unwrap();
        assert_eq!(ec2.field_types["SecurityGroupIds"], FieldType::List);
        let entry = Catalogue::new(store).builder_entry("starter", "basic").unwrap();
        assert_eq!(entry.resources[0].name, "vpc");
    }

    #[test]
    fn test_seed_twice_replaces_templates() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let path = write_seed(
            dir.path(),
            json!({"resources": [{"type": "VPC", "api": "/api/aws/ec2/create-vpc"}]}),
        );
        run_seed(&path, store.clone());
        run_seed(&path, store.clone());
        let templates = store
            .count(cloudshop_store::schema::RESOURCES, &json!({}))
            .unwrap();
        assert_eq!(templates, 1);
    }

    #[test]
    fn test_bad_entries_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let path = write_seed(
            dir.path(),
            json!({
                "resources": [{"type": "VPC", "api": "/x", "inputs": {"VpcId": "{{broken}}"}}],
                "options": [{"name": "orphan"}]
            }),
        );
        let report = run_seed(&path, store);
        assert_eq!(report.templates, 0);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].starts_with("resources[0]"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_seed(&dir.path().join("nope.json"), test_store(dir.path()));
        assert_eq!(report.errors.len(), 1);
    }
}
