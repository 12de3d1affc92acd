//! Parsed results schemas and their storage columns.

use std::fs;
use std::path::Path;

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::{PipelineType, SchemaError, RESERVED_KEYS, STATUS_KEY};

/// Field name to field descriptor, as parsed from the schema file.
pub type FieldMap = Map<String, JsonValue>;

/// Storage-level type for one schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    /// Arrays, objects and the canonical composite types, stored as JSON text.
    Json,
}

impl ColumnType {
    /// Type name used in CREATE TABLE statements.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Json => "TEXT",
        }
    }
}

/// One storage column derived from the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

/// A parsed results schema: the pipeline name plus the project-level,
/// sample-level and status field groups. Immutable after load.
#[derive(Debug, Clone)]
pub struct ResultsSchema {
    pipeline_name: String,
    project_level_data: FieldMap,
    sample_level_data: FieldMap,
    status_data: FieldMap,
}

impl ResultsSchema {
    /// Parse a schema from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded results schema from {}", path.display());
        Self::from_yaml(&text)
    }

    /// Parse a schema from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, SchemaError> {
        let raw: JsonValue = serde_yaml::from_str(text)?;
        Self::from_value(raw)
    }

    /// Parse a schema from an in-memory document.
    ///
    /// Expects the external layout: top-level `pipeline_name`, sample-level
    /// fields under `samples.items.properties`, project-level fields under
    /// the remaining top-level `properties`, and an optional `status`
    /// section. Canonical composite types are expanded in place.
    pub fn from_value(raw: JsonValue) -> Result<Self, SchemaError> {
        let JsonValue::Object(mut root) = raw else {
            return Err(SchemaError::NotAMapping);
        };

        let pipeline_name = match root.remove(crate::PIPELINE_NAME_KEY) {
            Some(JsonValue::String(name)) => name,
            _ => return Err(SchemaError::MissingPipelineName),
        };

        let status_data = match root.remove(STATUS_KEY) {
            Some(JsonValue::Object(mut status)) => match status.remove("properties") {
                Some(JsonValue::Object(props)) => props,
                _ => status,
            },
            _ => FieldMap::new(),
        };

        let sample_level_data = match root.remove("samples") {
            None => FieldMap::new(),
            Some(JsonValue::Object(mut samples)) => {
                let Some(items) = samples.remove("items") else {
                    return Err(SchemaError::MissingSampleItems);
                };
                let items_props = items
                    .as_object()
                    .and_then(|items| items.get("properties"))
                    .and_then(JsonValue::as_object);
                let Some(props) = items_props else {
                    return Err(SchemaError::MissingSampleProperties);
                };
                let mut fields = props.clone();
                expand_canonical_types(&mut fields)?;
                fields
            }
            Some(_) => return Err(SchemaError::MissingSampleItems),
        };

        let project_level_data = match root.remove("properties") {
            Some(JsonValue::Object(mut props)) => {
                expand_canonical_types(&mut props)?;
                props
            }
            _ => FieldMap::new(),
        };

        let overlap: Vec<&str> = project_level_data
            .keys()
            .filter(|k| sample_level_data.contains_key(*k))
            .map(String::as_str)
            .collect();
        if !overlap.is_empty() {
            return Err(SchemaError::OverlappingKeys {
                count: overlap.len(),
                keys: overlap.join(", "),
            });
        }

        let mut reserved: Vec<&str> = Vec::new();
        for data in [&project_level_data, &sample_level_data, &status_data] {
            for key in data.keys() {
                if RESERVED_KEYS.contains(&key.as_str()) && !reserved.contains(&key.as_str()) {
                    reserved.push(key);
                }
            }
        }
        if !reserved.is_empty() {
            return Err(SchemaError::ReservedKeys {
                count: reserved.len(),
                keys: reserved.join(", "),
            });
        }

        Ok(Self {
            pipeline_name,
            project_level_data,
            sample_level_data,
            status_data,
        })
    }

    /// Replace the pipeline name, e.g. with an explicitly configured
    /// namespace. Table names and file keys follow the new name.
    pub fn with_pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = name.into();
        self
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn project_level_data(&self) -> &FieldMap {
        &self.project_level_data
    }

    pub fn sample_level_data(&self) -> &FieldMap {
        &self.sample_level_data
    }

    pub fn status_data(&self) -> &FieldMap {
        &self.status_data
    }

    /// Fields declared for one pipeline level.
    pub fn typed_data(&self, pipeline_type: PipelineType) -> &FieldMap {
        match pipeline_type {
            PipelineType::Project => &self.project_level_data,
            PipelineType::Sample => &self.sample_level_data,
        }
    }

    /// Project-level and sample-level fields merged into one view.
    pub fn results_data(&self) -> FieldMap {
        let mut merged = self.project_level_data.clone();
        for (name, descriptor) in &self.sample_level_data {
            merged.insert(name.clone(), descriptor.clone());
        }
        merged
    }

    /// Descriptor for one declared result, if any.
    pub fn descriptor(&self, pipeline_type: PipelineType, result: &str) -> Option<&JsonValue> {
        self.typed_data(pipeline_type).get(result)
    }

    /// Table (or file section) name for one pipeline level.
    pub fn table_name(&self, pipeline_type: PipelineType) -> String {
        format!("{}__{}", self.pipeline_name, pipeline_type)
    }

    /// Storage columns for one pipeline level.
    ///
    /// Fields with types outside the storage mapping are skipped with a
    /// warning rather than failing the whole schema. Reserved bookkeeping
    /// columns are owned by the storage layer and never appear here.
    pub fn storage_columns(&self, pipeline_type: PipelineType) -> Vec<ColumnSpec> {
        let data = self.typed_data(pipeline_type);
        let mut columns = Vec::with_capacity(data.len());
        for (name, descriptor) in data {
            let declared = descriptor
                .get("type")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            let column_type = match declared {
                "integer" => ColumnType::Integer,
                "number" => ColumnType::Real,
                "string" => ColumnType::Text,
                "boolean" => ColumnType::Boolean,
                "array" | "object" => ColumnType::Json,
                other => {
                    warn!(
                        "Skipping result '{}': no storage mapping for type '{}'",
                        name, other
                    );
                    continue;
                }
            };
            columns.push(ColumnSpec {
                name: name.clone(),
                column_type,
            });
        }
        columns
    }
}

struct CanonicalSpec {
    properties: &'static [(&'static str, &'static str)],
    required: &'static [&'static str],
}

fn canonical_spec(type_name: &str) -> Option<CanonicalSpec> {
    match type_name {
        "image" => Some(CanonicalSpec {
            properties: &[
                ("path", "string"),
                ("thumbnail_path", "string"),
                ("title", "string"),
            ],
            required: &["path", "thumbnail_path", "title"],
        }),
        "file" => Some(CanonicalSpec {
            properties: &[("path", "string"), ("title", "string")],
            required: &["path", "title"],
        }),
        _ => None,
    }
}

/// Replace `image`/`file` pseudo-types with their object definitions,
/// recursing through nested object-typed properties. Every descriptor must
/// carry `type` and `description`.
fn expand_canonical_types(fields: &mut FieldMap) -> Result<(), SchemaError> {
    for (name, descriptor) in fields.iter_mut() {
        let Some(desc) = descriptor.as_object_mut() else {
            return Err(SchemaError::MissingResultKeys {
                result: name.clone(),
                keys: "type, description".to_string(),
            });
        };

        let missing: Vec<&str> = ["type", "description"]
            .into_iter()
            .filter(|key| !desc.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::MissingResultKeys {
                result: name.clone(),
                keys: missing.join(", "),
            });
        }

        let declared = desc
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();

        if declared == "object" {
            if let Some(JsonValue::Object(nested)) = desc.get_mut("properties") {
                expand_canonical_types(nested)?;
            }
        }

        let Some(canonical) = canonical_spec(&declared) else {
            continue;
        };

        let properties = desc
            .entry("properties")
            .or_insert_with(|| JsonValue::Object(FieldMap::new()));
        if let Some(props) = properties.as_object_mut() {
            for (key, prop_type) in canonical.properties {
                props.insert(
                    (*key).to_string(),
                    serde_json::json!({ "type": prop_type }),
                );
            }
        }
        let required = desc
            .entry("required")
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        if let Some(items) = required.as_array_mut() {
            items.extend(
                canonical
                    .required
                    .iter()
                    .map(|key| JsonValue::String((*key).to_string())),
            );
        }
        desc.insert("type".to_string(), JsonValue::String("object".to_string()));
    }
    Ok(())
}
