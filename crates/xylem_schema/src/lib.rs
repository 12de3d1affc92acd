//! Results schema parsing and storage-model derivation.
//!
//! A results schema declares which results a pipeline may report at the
//! project level and at the sample level, plus an optional status section.
//! The schema is parsed and validated once, then shared immutably by every
//! storage backend.

pub mod results;
pub mod status;
pub mod validate;

pub use results::{ColumnSpec, ColumnType, FieldMap, ResultsSchema};
pub use status::StatusSchema;
pub use validate::validate_value;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key under which the pipeline name lives in schema files.
pub const PIPELINE_NAME_KEY: &str = "pipeline_name";
/// Column holding the record identifier in both backends.
pub const RECORD_ID_KEY: &str = "record_identifier";
/// Column and flag key holding the current status value.
pub const STATUS_KEY: &str = "status";
/// Bookkeeping key set when a record is first created.
pub const CREATED_TIME_KEY: &str = "created_time";
/// Bookkeeping key refreshed on every write.
pub const MODIFIED_TIME_KEY: &str = "modified_time";
/// Primary-key column added by the database backend.
pub const ID_KEY: &str = "id";

/// Format for `created_time` / `modified_time` values.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Names reserved for bookkeeping; user schemas may not define them.
pub const RESERVED_KEYS: &[&str] = &[
    ID_KEY,
    RECORD_ID_KEY,
    STATUS_KEY,
    CREATED_TIME_KEY,
    MODIFIED_TIME_KEY,
    PIPELINE_NAME_KEY,
];

/// Whether a record belongs to the project table or the sample table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineType {
    Project,
    #[default]
    Sample,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::Project => "project",
            PipelineType::Sample => "sample",
        }
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(PipelineType::Project),
            "sample" => Ok(PipelineType::Sample),
            other => Err(SchemaError::UnknownPipelineType(other.to_string())),
        }
    }
}

/// Schema parsing and validation errors.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read schema file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse schema YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Schema must be a mapping at the top level")]
    NotAMapping,

    #[error("Missing top-level schema key: 'pipeline_name'")]
    MissingPipelineName,

    #[error("No 'items' in sample-level schema section")]
    MissingSampleItems,

    #[error("No 'properties' in sample-level schema items")]
    MissingSampleProperties,

    #[error("Result '{result}' is missing required key(s): {keys}")]
    MissingResultKeys { result: String, keys: String },

    #[error("{count} keys shared between project level and sample level: {keys}")]
    OverlappingKeys { count: usize, keys: String },

    #[error("{count} reserved key(s) used in schema: {keys}")]
    ReservedKeys { count: usize, keys: String },

    #[error("Unknown pipeline type '{0}', expected 'project' or 'sample'")]
    UnknownPipelineType(String),

    #[error("Value for '{result}' is not a valid '{expected}': {value}")]
    InvalidValue {
        result: String,
        expected: String,
        value: String,
    },
}
