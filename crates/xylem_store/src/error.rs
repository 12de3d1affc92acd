//! Error taxonomy for the store.

use std::io;

use thiserror::Error;
use xylem_schema::SchemaError;

use crate::lock::LockError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Anything that can go wrong while configuring or operating a backend.
///
/// Callers can branch on the variant: configuration and schema problems are
/// permanent, lock and database errors are worth retrying.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    #[error("Result '{result}' not found for record '{record}'")]
    ResultNotFound { record: String, result: String },

    #[error("'{result}' is not a known result. Results defined in the schema are: {defined}.")]
    UnknownResult { result: String, defined: String },

    #[error("'{status}' is not a defined status identifier. These are allowed: {allowed}")]
    UnrecognizedStatus { status: String, allowed: String },

    #[error("Multiple status flags found for '{record}': {}", .candidates.join(", "))]
    AmbiguousStatus {
        record: String,
        candidates: Vec<String>,
    },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("'{path}' is already in use for {count} namespace(s): {names}")]
    FileInUse {
        path: String,
        count: usize,
        names: String,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter(message.into())
    }
}
