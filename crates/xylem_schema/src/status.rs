//! Status schemas: the identifiers a pipeline may set as its current status.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{FieldMap, SchemaError};

/// The built-in status schema, used when no file overrides it.
pub const DEFAULT_STATUS_SCHEMA_YAML: &str = r#"running:
  description: the pipeline is running
completed:
  description: the pipeline has completed
failed:
  description: the pipeline has failed
waiting:
  description: the pipeline is waiting
partial:
  description: the pipeline stopped before the completion point
"#;

#[derive(Debug, Clone, Deserialize)]
struct StatusEntry {
    #[serde(default)]
    description: String,
}

/// The set of status identifiers a record may carry, with descriptions.
#[derive(Debug, Clone)]
pub struct StatusSchema {
    source: String,
    statuses: BTreeMap<String, String>,
}

impl Default for StatusSchema {
    fn default() -> Self {
        let mut statuses = BTreeMap::new();
        for (identifier, description) in [
            ("running", "the pipeline is running"),
            ("completed", "the pipeline has completed"),
            ("failed", "the pipeline has failed"),
            ("waiting", "the pipeline is waiting"),
            ("partial", "the pipeline stopped before the completion point"),
        ] {
            statuses.insert(identifier.to_string(), description.to_string());
        }
        Self {
            source: "<built-in>".to_string(),
            statuses,
        }
    }
}

impl StatusSchema {
    /// Load a status schema from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut schema = Self::from_yaml(&text)?;
        schema.source = path.display().to_string();
        Ok(schema)
    }

    /// Parse a status schema from YAML text: identifier to `{description}`.
    pub fn from_yaml(text: &str) -> Result<Self, SchemaError> {
        let entries: BTreeMap<String, StatusEntry> = serde_yaml::from_str(text)?;
        let statuses = entries
            .into_iter()
            .map(|(identifier, entry)| (identifier, entry.description))
            .collect();
        Ok(Self {
            source: "<inline>".to_string(),
            statuses,
        })
    }

    /// Build a status schema from a results schema's `status` section.
    pub fn from_fields(fields: &FieldMap) -> Self {
        let statuses = fields
            .iter()
            .map(|(identifier, descriptor)| {
                let description = descriptor
                    .get("description")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                (identifier.clone(), description)
            })
            .collect();
        Self {
            source: "<results schema>".to_string(),
            statuses,
        }
    }

    /// Where this schema came from: a file path or a built-in marker.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn contains(&self, status_identifier: &str) -> bool {
        self.statuses.contains_key(status_identifier)
    }

    pub fn description(&self, status_identifier: &str) -> Option<&str> {
        self.statuses.get(status_identifier).map(String::as_str)
    }

    /// All identifiers, in stable order.
    pub fn identifiers(&self) -> Vec<&str> {
        self.statuses.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}
