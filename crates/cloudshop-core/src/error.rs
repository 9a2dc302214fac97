//! Error types for CloudShop.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Order {0} is already being orchestrated")]
    AlreadyRunning(String),

    #[error("Dependency cycle involving: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Parent {parent} is not ready: {reason}")]
    ParentNotReady { parent: String, reason: String },

    #[error("Unresolved placeholders: {}", .0.join(", "))]
    UnresolvedPlaceholder(Vec<String>),

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable name of the variant, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) => "storage",
            Error::Database(_) => "database",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::AlreadyRunning(_) => "already_running",
            Error::DependencyCycle(_) => "dependency_cycle",
            Error::ParentNotReady { .. } => "parent_not_ready",
            Error::UnresolvedPlaceholder(_) => "unresolved_placeholder",
            Error::Capability(_) => "capability",
            Error::Timeout(_) => "timeout",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Config(_) => "config",
            Error::Http(_) => "http",
            Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
