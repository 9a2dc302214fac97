//! Database schema SQL.

/// Every collection lives in one table; bodies are JSON objects.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    collection TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
"#;

/// Uniqueness rules that individual collections rely on.
pub const UNIQUE_INDEXES_SQL: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_order_name
    ON documents(json_extract(body, '$.orderID'), json_extract(body, '$.name'))
    WHERE collection = 'jobs';

CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_type
    ON documents(json_extract(body, '$.type'))
    WHERE collection = 'resources';
"#;

/// Collection names.
pub const ORDERS: &str = "orders";
pub const JOBS: &str = "jobs";
pub const RESOURCES: &str = "resources";
pub const BUILDER: &str = "builder";
pub const OPTIONS: &str = "options";
