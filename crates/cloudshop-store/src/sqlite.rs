//! SQLite-backed document store.
//!
//! Collections are rows of one table tagged by name, with the document body
//! kept as JSON text. Filters are JSON objects of equality conditions on
//! dotted field paths (`{"data.orderID": "o1"}`), compiled to `json_extract`
//! comparisons. `_id` values are opaque strings generated on insert.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::schema::{SCHEMA_SQL, UNIQUE_INDEXES_SQL};
use cloudshop_core::{Error, Result};

/// Document store over a single SQLite connection.
pub struct DocumentStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// A stored document: its id plus the JSON body.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    pub body: Map<String, Value>,
}

impl Record {
    /// The body with `_id` folded in, as returned to API callers.
    pub fn to_json(&self) -> Value {
        let mut body = self.body.clone();
        body.insert("_id".to_string(), Value::String(self.id.clone()));
        Value::Object(body)
    }

    /// Deserialize the record (including `_id`) into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }
}

impl DocumentStore {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
            }
        }

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        info!(
            "DocumentStore initialized: {} documents, path={}",
            store.count_all()?,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}", SCHEMA_SQL, UNIQUE_INDEXES_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------------------------------------------------------
    // CRUD
    // ---------------------------------------------------------------

    /// Insert a document. Returns the new `_id`.
    ///
    /// `createdAt`/`updatedAt` are stamped on the body. A unique-index
    /// violation surfaces as [`Error::Conflict`].
    pub fn insert(&self, collection: &str, data: Value) -> Result<String> {
        let mut body = into_object(data)?;
        body.remove("_id");
        let now = now_rfc3339();
        body.insert("createdAt".to_string(), Value::String(now.clone()));
        body.insert("updatedAt".to_string(), Value::String(now));

        let id = uuid::Uuid::new_v4().simple().to_string();
        let text = serde_json::to_string(&body)?;

        let conn = self.conn.lock();
        conn.prepare_cached("INSERT INTO documents (id, collection, body) VALUES (?1, ?2, ?3)")
            .map_err(|e| Error::Database(e.to_string()))?
            .execute(params![id, collection, text])
            .map_err(|e| write_error(collection, e))?;

        debug!("Inserted {} into {}", id, collection);
        Ok(id)
    }

    /// First document matching `filter`, in insertion order.
    pub fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Record>> {
        let (where_sql, args) = build_filter(collection, filter)?;
        let sql = format!(
            "SELECT id, body FROM documents WHERE {} ORDER BY seq LIMIT 1",
            where_sql
        );

        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params_from_iter(args.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        row.map(|(id, body)| to_record(id, &body)).transpose()
    }

    /// All documents matching `filter`, in insertion order.
    pub fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Record>> {
        let (where_sql, args) = build_filter(collection, filter)?;
        let sql = format!("SELECT id, body FROM documents WHERE {} ORDER BY seq", where_sql);

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, body) = row.map_err(|e| Error::Database(e.to_string()))?;
            records.push(to_record(id, &body)?);
        }
        Ok(records)
    }

    /// Merge `patch` into the first document matching `filter` (`$set`
    /// semantics on top-level keys). Returns the number of modified documents.
    ///
    /// The match and the write happen in one transaction, so a filter on the
    /// current value of a field acts as a compare-and-set.
    pub fn update_one(&self, collection: &str, filter: &Value, patch: Value) -> Result<usize> {
        let patch = into_object(patch)?;
        let (where_sql, args) = build_filter(collection, filter)?;
        let select = format!(
            "SELECT id, body FROM documents WHERE {} ORDER BY seq LIMIT 1",
            where_sql
        );

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| Error::Database(e.to_string()))?;

        let row: Option<(String, String)> = tx
            .query_row(&select, params_from_iter(args.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        let Some((id, body)) = row else {
            return Ok(0);
        };

        let mut body: Map<String, Value> = serde_json::from_str(&body)?;
        for (key, value) in patch {
            if key == "_id" || key == "createdAt" {
                continue;
            }
            body.insert(key, value);
        }
        body.insert("updatedAt".to_string(), Value::String(now_rfc3339()));

        tx.execute(
            "UPDATE documents SET body = ?1 WHERE id = ?2",
            params![serde_json::to_string(&body)?, id],
        )
        .map_err(|e| write_error(collection, e))?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        debug!("Updated {} in {}", id, collection);
        Ok(1)
    }

    /// Replace the body of the document matching `filter`, or insert `data`
    /// when nothing matches. Returns the document id.
    pub fn upsert(&self, collection: &str, filter: &Value, data: Value) -> Result<String> {
        let mut body = into_object(data)?;
        body.remove("_id");
        let (where_sql, args) = build_filter(collection, filter)?;
        let select = format!(
            "SELECT id, body FROM documents WHERE {} ORDER BY seq LIMIT 1",
            where_sql
        );

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| Error::Database(e.to_string()))?;

        let existing: Option<(String, String)> = tx
            .query_row(&select, params_from_iter(args.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = now_rfc3339();
        let id = match existing {
            Some((id, old)) => {
                let old: Map<String, Value> = serde_json::from_str(&old)?;
                let created = old
                    .get("createdAt")
                    .cloned()
                    .unwrap_or_else(|| Value::String(now.clone()));
                body.insert("createdAt".to_string(), created);
                body.insert("updatedAt".to_string(), Value::String(now));
                tx.execute(
                    "UPDATE documents SET body = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&body)?, id],
                )
                .map_err(|e| write_error(collection, e))?;
                id
            }
            None => {
                body.insert("createdAt".to_string(), Value::String(now.clone()));
                body.insert("updatedAt".to_string(), Value::String(now));
                let id = uuid::Uuid::new_v4().simple().to_string();
                tx.execute(
                    "INSERT INTO documents (id, collection, body) VALUES (?1, ?2, ?3)",
                    params![id, collection, serde_json::to_string(&body)?],
                )
                .map_err(|e| write_error(collection, e))?;
                id
            }
        };
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(id)
    }

    /// Count documents in a collection matching `filter`.
    pub fn count(&self, collection: &str, filter: &Value) -> Result<i64> {
        let (where_sql, args) = build_filter(collection, filter)?;
        let sql = format!("SELECT COUNT(*) FROM documents WHERE {}", where_sql);
        let conn = self.conn.lock();
        conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    fn count_all(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }
}

// ---------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn into_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!(
            "document must be a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

fn to_record(id: String, body: &str) -> Result<Record> {
    let body: Map<String, Value> = serde_json::from_str(body)?;
    Ok(Record { id, body })
}

fn write_error(collection: &str, e: rusqlite::Error) -> Error {
    if e.to_string().contains("UNIQUE constraint") {
        Error::Conflict(format!("duplicate document in {}", collection))
    } else {
        Error::Database(e.to_string())
    }
}

/// Compile a JSON filter into a WHERE clause and its bound parameters.
///
/// Supported conditions per key: a scalar (equality), `null` (missing or
/// null), `{"$ne": scalar}` and `{"$in": [scalar, ...]}`.
fn build_filter(collection: &str, filter: &Value) -> Result<(String, Vec<SqlValue>)> {
    let mut clauses = vec!["collection = ?".to_string()];
    let mut args = vec![SqlValue::Text(collection.to_string())];

    let conditions = match filter {
        Value::Null => return Ok((clauses.join(" AND "), args)),
        Value::Object(map) => map,
        other => {
            return Err(Error::Validation(format!(
                "filter must be a JSON object, got {}",
                type_name(other)
            )))
        }
    };

    for (key, condition) in conditions {
        let field = if key == "_id" {
            Field::Id
        } else {
            Field::Path(json_path(key)?)
        };

        match condition {
            Value::Null => {
                clauses.push(format!("{} IS NULL", field.push_lhs(&mut args)));
            }
            Value::Object(op) if op.len() == 1 => {
                let (name, operand) = op
                    .iter()
                    .next()
                    .ok_or_else(|| Error::Validation("empty filter operator".to_string()))?;
                match name.as_str() {
                    "$ne" if operand.is_null() => {
                        clauses.push(format!("{} IS NOT NULL", field.push_lhs(&mut args)));
                    }
                    "$ne" => {
                        let first = field.push_lhs(&mut args);
                        let second = field.push_lhs(&mut args);
                        args.push(scalar_param(operand)?);
                        clauses.push(format!("({} IS NULL OR {} != ?)", first, second));
                    }
                    "$in" => {
                        let items = operand.as_array().ok_or_else(|| {
                            Error::Validation(format!("$in on {} expects an array", key))
                        })?;
                        if items.is_empty() {
                            clauses.push("0".to_string());
                            continue;
                        }
                        let lhs = field.push_lhs(&mut args);
                        for item in items {
                            args.push(scalar_param(item)?);
                        }
                        let marks = vec!["?"; items.len()].join(", ");
                        clauses.push(format!("{} IN ({})", lhs, marks));
                    }
                    other => {
                        return Err(Error::Validation(format!(
                            "unsupported filter operator {} on {}",
                            other, key
                        )))
                    }
                }
            }
            scalar => {
                let lhs = field.push_lhs(&mut args);
                args.push(scalar_param(scalar)?);
                clauses.push(format!("{} = ?", lhs));
            }
        }
    }

    Ok((clauses.join(" AND "), args))
}

enum Field {
    Id,
    Path(String),
}

impl Field {
    /// Left-hand side SQL for this field, pushing its bound path if needed.
    fn push_lhs(&self, args: &mut Vec<SqlValue>) -> &'static str {
        match self {
            Field::Id => "id",
            Field::Path(path) => {
                args.push(SqlValue::Text(path.clone()));
                "json_extract(body, ?)"
            }
        }
    }
}

/// `a.b.c` → `$."a"."b"."c"`.
fn json_path(key: &str) -> Result<String> {
    let mut path = String::from("$");
    for segment in key.split('.') {
        if segment.is_empty() || segment.contains('"') {
            return Err(Error::Validation(format!("invalid filter key: {:?}", key)));
        }
        path.push_str(".\"");
        path.push_str(segment);
        path.push('"');
    }
    Ok(path)
}

fn scalar_param(value: &Value) -> Result<SqlValue> {
    match value {
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(SqlValue::Integer(i)),
            None => n
                .as_f64()
                .map(SqlValue::Real)
                .ok_or_else(|| Error::Validation(format!("unsupported number {}", n))),
        },
        other => Err(Error::Validation(format!(
            "filter values must be scalars, got {}",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
