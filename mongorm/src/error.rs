use crate::validation::ValidationErrors;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MongormError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Document not found in '{collection}' matching {criteria}")]
    NotFound { collection: String, criteria: String },

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Failures turning a stored record back into a live document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("dangling reference to {collection}/{id}")]
    DanglingReference { collection: String, id: String },

    #[error("record does not match schema '{schema}' at '{field}': {reason}")]
    SchemaMismatch {
        schema: String,
        field: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, MongormError>;
