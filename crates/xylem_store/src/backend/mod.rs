//! Storage backends for reported results.
//!
//! [`ResultsBackend`] is the contract both backends implement. Callers see
//! the same behavior whether results land in a YAML file or in a database;
//! the differences are operational (locking strategy, status storage), never
//! semantic.

pub mod db;
pub mod file;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use xylem_schema::{
    FieldMap, PipelineType, ResultsSchema, StatusSchema, CREATED_TIME_KEY, MODIFIED_TIME_KEY,
    RECORD_ID_KEY, STATUS_KEY,
};

use crate::error::{Result, StoreError};
use crate::filter::{FilterCondition, JsonFilterCondition};

/// One selected row: column name to value.
pub type SelectedRecord = serde_json::Map<String, JsonValue>;

/// A page of record identifiers. `count` is the total number of records in
/// the section, not the page length.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub count: u64,
    pub limit: u64,
    pub offset: u64,
    pub records: Vec<String>,
}

/// Results reported for one record.
#[derive(Debug, Clone)]
pub struct RecordResults {
    pub record_identifier: String,
    pub results: FieldMap,
}

/// Which bookkeeping timestamp a time-windowed query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeField {
    Created,
    #[default]
    Modified,
}

impl TimeField {
    pub fn column(&self) -> &'static str {
        match self {
            TimeField::Created => CREATED_TIME_KEY,
            TimeField::Modified => MODIFIED_TIME_KEY,
        }
    }
}

/// A record paired with the timestamp that put it inside the query window.
#[derive(Debug, Clone)]
pub struct RecentResult {
    pub record_identifier: String,
    pub timestamp: String,
}

/// The backend contract. All operations are keyed by `pipeline_type`;
/// records of the two types never mix.
#[async_trait]
pub trait ResultsBackend: Send + Sync {
    /// Short name for logs and the CLI summary.
    fn backend_kind(&self) -> &'static str;

    /// Write `values` for a record. Returns `Ok(None)` without touching
    /// state when any of the keys already holds a value and `force` is not
    /// set; otherwise writes every key and returns one formatted line per
    /// reported result. Multi-result reports are all-or-nothing.
    async fn report(
        &self,
        record_identifier: &str,
        values: FieldMap,
        pipeline_type: PipelineType,
        force: bool,
    ) -> Result<Option<Vec<String>>>;

    /// A single reported value, or with `None` the full mapping of
    /// schema-defined results for the record.
    async fn retrieve(
        &self,
        record_identifier: &str,
        result_identifier: Option<&str>,
        pipeline_type: PipelineType,
    ) -> Result<JsonValue>;

    /// Filtered projection over the records of one pipeline type. Rows come
    /// back in record-identifier order.
    async fn select(
        &self,
        columns: Option<&[String]>,
        filter_conditions: &[FilterCondition],
        json_filter_conditions: &[JsonFilterCondition],
        offset: Option<u64>,
        limit: Option<u64>,
        pipeline_type: PipelineType,
    ) -> Result<Vec<SelectedRecord>>;

    /// Remove one result, or with `None` the whole record. Removing the last
    /// result removes the record. `Ok(false)` when there was nothing to
    /// remove.
    async fn remove(
        &self,
        record_identifier: &str,
        result_identifier: Option<&str>,
        pipeline_type: PipelineType,
    ) -> Result<bool>;

    async fn get_records(
        &self,
        limit: u64,
        offset: u64,
        pipeline_type: PipelineType,
    ) -> Result<RecordPage>;

    async fn count_records(&self, pipeline_type: PipelineType) -> Result<u64>;

    /// Reported (non-null) result identifiers for a record, restricted to
    /// `restrict_to` when given. Empty when the record is absent.
    async fn list_results(
        &self,
        restrict_to: Option<&[String]>,
        record_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<Vec<String>>;

    /// Records whose timestamp falls in `[end, start]`, newest first.
    /// `start` bounds from above, `end` from below; either may be open.
    async fn list_recent_results(
        &self,
        limit: u64,
        start: Option<&str>,
        end: Option<&str>,
        time_field: TimeField,
        pipeline_type: PipelineType,
    ) -> Result<Vec<RecentResult>>;

    async fn check_record_exists(
        &self,
        record_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<bool>;

    /// Validates against the status schema, then atomically replaces any
    /// previous status.
    async fn set_status(
        &self,
        record_identifier: &str,
        status_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<()>;

    async fn get_status(
        &self,
        record_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<Option<String>>;

    /// Remove the named status markers (all schema-defined ones with
    /// `None`). Returns the identifiers actually removed; missing markers
    /// are not an error.
    async fn clear_status(
        &self,
        record_identifier: &str,
        flag_names: Option<&[String]>,
        pipeline_type: PipelineType,
    ) -> Result<Vec<String>>;

    async fn check_result_exists(
        &self,
        record_identifier: &str,
        result_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<bool> {
        let restrict = [result_identifier.to_string()];
        let found = self
            .list_results(Some(&restrict), record_identifier, pipeline_type)
            .await?;
        Ok(!found.is_empty())
    }

    /// Result mappings for a set of records, filtered to the requested
    /// results. Empty `record_identifiers` or `result_identifiers` mean
    /// "all". Absent records are skipped, not an error.
    async fn retrieve_multiple(
        &self,
        record_identifiers: &[String],
        result_identifiers: &[String],
        limit: u64,
        offset: u64,
        pipeline_type: PipelineType,
    ) -> Result<Vec<RecordResults>> {
        let mut filters = Vec::new();
        if !record_identifiers.is_empty() {
            let ids = record_identifiers
                .iter()
                .map(|id| JsonValue::String(id.clone()))
                .collect();
            filters.push(FilterCondition::new(
                RECORD_ID_KEY,
                "in",
                JsonValue::Array(ids),
            )?);
        }
        let columns: Option<Vec<String>> = if result_identifiers.is_empty() {
            None
        } else {
            let mut cols = vec![RECORD_ID_KEY.to_string()];
            cols.extend(result_identifiers.iter().cloned());
            Some(cols)
        };
        let rows = self
            .select(
                columns.as_deref(),
                &filters,
                &[],
                Some(offset),
                Some(limit),
                pipeline_type,
            )
            .await?;
        let mut pages = Vec::with_capacity(rows.len());
        for mut row in rows {
            let record_identifier = match row.remove(RECORD_ID_KEY) {
                Some(JsonValue::String(id)) => id,
                _ => continue,
            };
            let mut results = FieldMap::new();
            for (key, value) in row {
                if key == CREATED_TIME_KEY || key == MODIFIED_TIME_KEY {
                    continue;
                }
                if value.is_null() {
                    continue;
                }
                results.insert(key, value);
            }
            pages.push(RecordResults {
                record_identifier,
                results,
            });
        }
        Ok(pages)
    }
}

/// Every reported key must be defined by the schema for this pipeline type;
/// the status key is allowed alongside.
pub(crate) fn assert_results_defined(
    schema: &ResultsSchema,
    pipeline_type: PipelineType,
    values: &FieldMap,
) -> Result<()> {
    let known = schema.typed_data(pipeline_type);
    for key in values.keys() {
        if key == STATUS_KEY {
            continue;
        }
        if !known.contains_key(key) {
            return Err(StoreError::UnknownResult {
                result: key.clone(),
                defined: known.keys().cloned().collect::<Vec<_>>().join(", "),
            });
        }
    }
    Ok(())
}

pub(crate) fn assert_status_defined(status_schema: &StatusSchema, status: &str) -> Result<()> {
    if status_schema.contains(status) {
        Ok(())
    } else {
        Err(StoreError::UnrecognizedStatus {
            status: status.to_string(),
            allowed: status_schema.identifiers().join(", "),
        })
    }
}

/// Pull the status key out of a report payload, validating it.
pub(crate) fn take_status(
    values: &mut FieldMap,
    status_schema: &StatusSchema,
) -> Result<Option<String>> {
    match values.remove(STATUS_KEY) {
        None => Ok(None),
        Some(JsonValue::String(status)) => {
            assert_status_defined(status_schema, &status)?;
            Ok(Some(status))
        }
        Some(other) => Err(StoreError::UnrecognizedStatus {
            status: other.to_string(),
            allowed: status_schema.identifiers().join(", "),
        }),
    }
}

pub(crate) fn now_timestamp() -> String {
    chrono::Local::now().format(xylem_schema::TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &str = "\
pipeline_name: rnaseq
samples:
  items:
    properties:
      distance:
        type: number
        description: distance covered
      note:
        type: string
        description: free text
properties:
  collection_note:
    type: string
    description: project-wide note
";

    #[test]
    fn unknown_results_are_rejected_with_the_defined_list() {
        let schema = ResultsSchema::from_yaml(SCHEMA).unwrap();
        let mut values = FieldMap::new();
        values.insert("speed".to_string(), json!(1));
        let err =
            assert_results_defined(&schema, PipelineType::Sample, &values).unwrap_err();
        match err {
            StoreError::UnknownResult { result, defined } => {
                assert_eq!(result, "speed");
                assert_eq!(defined, "distance, note");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn status_is_allowed_alongside_schema_results() {
        let schema = ResultsSchema::from_yaml(SCHEMA).unwrap();
        let mut values = FieldMap::new();
        values.insert("distance".to_string(), json!(4.2));
        values.insert(STATUS_KEY.to_string(), json!("running"));
        assert_results_defined(&schema, PipelineType::Sample, &values).unwrap();
    }

    #[test]
    fn take_status_validates_and_strips() {
        let status_schema = StatusSchema::default();
        let mut values = FieldMap::new();
        values.insert("distance".to_string(), json!(4.2));
        values.insert(STATUS_KEY.to_string(), json!("running"));
        let status = take_status(&mut values, &status_schema).unwrap();
        assert_eq!(status.as_deref(), Some("running"));
        assert!(!values.contains_key(STATUS_KEY));

        values.insert(STATUS_KEY.to_string(), json!("sprinting"));
        assert!(take_status(&mut values, &status_schema).is_err());
    }

    #[test]
    fn project_and_sample_fields_do_not_mix() {
        let schema = ResultsSchema::from_yaml(SCHEMA).unwrap();
        let mut values = FieldMap::new();
        values.insert("collection_note".to_string(), json!("x"));
        assert_results_defined(&schema, PipelineType::Project, &values).unwrap();
        assert!(assert_results_defined(&schema, PipelineType::Sample, &values).is_err());
    }
}
