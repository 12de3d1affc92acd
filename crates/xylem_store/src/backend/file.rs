//! YAML-file backed storage.
//!
//! The results file holds one namespace with a `project` and a `sample`
//! section, each mapping record identifiers to their reported fields plus
//! the bookkeeping timestamps. Statuses live out-of-band as flag files.
//!
//! Nothing read from disk is treated as authoritative for a write: every
//! mutation acquires the exclusive lock, reloads the file, merges, writes
//! and releases. Reads reload under a shared lock, so concurrent reporters
//! in other processes are always observed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, warn};

use xylem_schema::{
    FieldMap, PipelineType, ResultsSchema, StatusSchema, CREATED_TIME_KEY, MODIFIED_TIME_KEY,
    RECORD_ID_KEY,
};

use crate::backend::{
    assert_results_defined, assert_status_defined, now_timestamp, take_status, RecentResult,
    RecordPage, ResultsBackend, SelectedRecord, TimeField,
};
use crate::error::{Result, StoreError};
use crate::filter::{FilterCondition, JsonFilterCondition};
use crate::lock;
use crate::reports::ResultFormatter;

const LOCK_WAIT: Duration = Duration::from_secs(30);

pub struct FileBackend {
    results_path: PathBuf,
    flag_dir: PathBuf,
    schema: Arc<ResultsSchema>,
    status_schema: StatusSchema,
    formatter: ResultFormatter,
}

impl FileBackend {
    /// Open (creating if needed) the results file and fail fast when it is
    /// already in use for a different namespace.
    pub fn new(
        results_path: PathBuf,
        flag_dir: Option<PathBuf>,
        schema: Arc<ResultsSchema>,
        status_schema: StatusSchema,
        formatter: ResultFormatter,
    ) -> Result<Self> {
        let flag_dir = flag_dir.unwrap_or_else(|| {
            results_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        if let Some(parent) = results_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(&flag_dir)?;
        let backend = Self {
            results_path,
            flag_dir,
            schema,
            status_schema,
            formatter,
        };
        backend.initialize()?;
        Ok(backend)
    }

    pub fn results_path(&self) -> &Path {
        &self.results_path
    }

    pub fn flag_dir(&self) -> &Path {
        &self.flag_dir
    }

    fn initialize(&self) -> Result<()> {
        let _guard = lock::lock_exclusive_timeout(&self.results_path, LOCK_WAIT)?;
        let mut tree = self.load_tree()?;
        self.verify_namespace(&tree)?;
        if self.ensure_sections(&mut tree)? {
            self.write_tree(&tree)?;
        }
        info!(
            "Initialized results file for '{}': {}",
            self.schema.pipeline_name(),
            self.results_path.display()
        );
        Ok(())
    }

    fn load_tree(&self) -> Result<JsonValue> {
        if !self.results_path.exists() {
            return Ok(JsonValue::Object(Map::new()));
        }
        let text = std::fs::read_to_string(&self.results_path)?;
        if text.trim().is_empty() {
            return Ok(JsonValue::Object(Map::new()));
        }
        let tree: JsonValue = serde_yaml::from_str(&text)?;
        match tree {
            JsonValue::Null => Ok(JsonValue::Object(Map::new())),
            JsonValue::Object(_) => Ok(tree),
            _ => Err(StoreError::config(format!(
                "Results file is not a mapping: {}",
                self.results_path.display()
            ))),
        }
    }

    fn write_tree(&self, tree: &JsonValue) -> Result<()> {
        let text = serde_yaml::to_string(tree)?;
        std::fs::write(&self.results_path, text)?;
        Ok(())
    }

    fn verify_namespace(&self, tree: &JsonValue) -> Result<()> {
        let root = tree
            .as_object()
            .ok_or_else(|| StoreError::config("Results file is not a mapping"))?;
        let namespace = self.schema.pipeline_name();
        let foreign: Vec<String> = root
            .keys()
            .filter(|k| k.as_str() != namespace)
            .cloned()
            .collect();
        if foreign.is_empty() {
            Ok(())
        } else {
            Err(StoreError::FileInUse {
                path: self.results_path.display().to_string(),
                count: foreign.len(),
                names: foreign.join(", "),
            })
        }
    }

    fn ensure_sections(&self, tree: &mut JsonValue) -> Result<bool> {
        let mut changed = false;
        let root = tree
            .as_object_mut()
            .ok_or_else(|| StoreError::config("Results file is not a mapping"))?;
        let namespace = root
            .entry(self.schema.pipeline_name().to_string())
            .or_insert_with(|| {
                changed = true;
                JsonValue::Object(Map::new())
            });
        let namespace = namespace.as_object_mut().ok_or_else(|| {
            StoreError::config(format!(
                "Namespace section '{}' is not a mapping",
                self.schema.pipeline_name()
            ))
        })?;
        for pipeline_type in [PipelineType::Project, PipelineType::Sample] {
            namespace
                .entry(pipeline_type.as_str().to_string())
                .or_insert_with(|| {
                    changed = true;
                    JsonValue::Object(Map::new())
                });
        }
        Ok(changed)
    }

    fn section<'t>(
        tree: &'t JsonValue,
        namespace: &str,
        pipeline_type: PipelineType,
    ) -> Option<&'t Map<String, JsonValue>> {
        tree.get(namespace)?
            .get(pipeline_type.as_str())?
            .as_object()
    }

    fn section_mut<'t>(
        &self,
        tree: &'t mut JsonValue,
        pipeline_type: PipelineType,
    ) -> Result<&'t mut Map<String, JsonValue>> {
        self.ensure_sections(tree)?;
        let section = tree
            .get_mut(self.schema.pipeline_name())
            .and_then(|ns| ns.get_mut(pipeline_type.as_str()))
            .and_then(JsonValue::as_object_mut)
            .ok_or_else(|| {
                StoreError::config(format!("Section '{pipeline_type}' is not a mapping"))
            })?;
        Ok(section)
    }

    /// Columns a selection may name: the record identifier, the schema
    /// fields of this pipeline type and the bookkeeping timestamps.
    fn selectable_columns(&self, pipeline_type: PipelineType) -> Vec<String> {
        let mut columns = vec![RECORD_ID_KEY.to_string()];
        columns.extend(self.schema.typed_data(pipeline_type).keys().cloned());
        columns.push(CREATED_TIME_KEY.to_string());
        columns.push(MODIFIED_TIME_KEY.to_string());
        columns
    }

    fn flag_path(&self, record_identifier: &str, status: &str) -> PathBuf {
        self.flag_dir.join(format!(
            "{}_{}_{}.flag",
            self.schema.pipeline_name(),
            record_identifier,
            status
        ))
    }

    fn flag_paths(&self, record_identifier: &str) -> Result<Vec<PathBuf>> {
        let prefix = glob::Pattern::escape(&format!(
            "{}_{}_",
            self.schema.pipeline_name(),
            record_identifier
        ));
        let pattern = self.flag_dir.join(format!("{prefix}*.flag"));
        let pattern = pattern.to_string_lossy();
        let mut paths: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| StoreError::config(format!("Bad flag pattern '{pattern}': {e}")))?
            .flatten()
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn status_of_flag(&self, path: &Path, record_identifier: &str) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let prefix = format!("{}_{}_", self.schema.pipeline_name(), record_identifier);
        name.strip_prefix(&prefix)?
            .strip_suffix(".flag")
            .map(str::to_string)
    }

    fn read_statuses(&self, record_identifier: &str) -> Result<Vec<String>> {
        Ok(self
            .flag_paths(record_identifier)?
            .iter()
            .filter_map(|path| self.status_of_flag(path, record_identifier))
            .collect())
    }

    // Caller holds the exclusive lock.
    fn remove_flag_files(&self, record_identifier: &str) -> Result<()> {
        for path in self.flag_paths(record_identifier)? {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed existing flag: {}", path.display()),
                Err(e) => debug!("Could not remove flag {}: {e}", path.display()),
            }
        }
        Ok(())
    }

    // Caller holds the exclusive lock.
    fn swap_status_flag(
        &self,
        record_identifier: &str,
        status: &str,
    ) -> Result<Option<String>> {
        let previous_paths = self.flag_paths(record_identifier)?;
        let mut previous = None;
        for path in &previous_paths {
            if previous.is_none() {
                previous = self.status_of_flag(path, record_identifier);
            }
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed existing flag: {}", path.display()),
                Err(e) => debug!("Could not remove flag {}: {e}", path.display()),
            }
        }
        std::fs::write(self.flag_path(record_identifier, status), status)?;
        Ok(previous)
    }
}

#[async_trait]
impl ResultsBackend for FileBackend {
    fn backend_kind(&self) -> &'static str {
        "file"
    }

    async fn report(
        &self,
        record_identifier: &str,
        values: FieldMap,
        pipeline_type: PipelineType,
        force: bool,
    ) -> Result<Option<Vec<String>>> {
        assert_results_defined(&self.schema, pipeline_type, &values)?;
        let mut results = values;
        let status = take_status(&mut results, &self.status_schema)?;
        let namespace = self.schema.pipeline_name().to_string();

        let _guard = lock::lock_exclusive_timeout(&self.results_path, LOCK_WAIT)?;
        let mut tree = self.load_tree()?;
        self.verify_namespace(&tree)?;
        let section = self.section_mut(&mut tree, pipeline_type)?;
        if !force {
            if let Some(JsonValue::Object(existing)) = section.get(record_identifier) {
                let overlapping: Vec<String> = results
                    .keys()
                    .filter(|key| {
                        existing.get(key.as_str()).is_some_and(|v| !v.is_null())
                    })
                    .cloned()
                    .collect();
                if !overlapping.is_empty() {
                    warn!(
                        "These results exist for '{}': {}",
                        record_identifier,
                        overlapping.join(", ")
                    );
                    return Ok(None);
                }
            }
        }
        let now = now_timestamp();
        let entry = section
            .entry(record_identifier.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        let record = entry.as_object_mut().ok_or_else(|| {
            StoreError::config(format!(
                "Record entry '{record_identifier}' is not a mapping"
            ))
        })?;
        if !record.contains_key(CREATED_TIME_KEY) {
            record.insert(
                CREATED_TIME_KEY.to_string(),
                JsonValue::String(now.clone()),
            );
        }
        record.insert(
            MODIFIED_TIME_KEY.to_string(),
            JsonValue::String(now),
        );
        let mut formatted = Vec::with_capacity(results.len() + 1);
        for (key, value) in &results {
            formatted.push(
                self.formatter
                    .format(&namespace, record_identifier, key, value),
            );
        }
        for (key, value) in results {
            record.insert(key, value);
        }
        self.write_tree(&tree)?;
        if let Some(status) = &status {
            let previous = self.swap_status_flag(record_identifier, status)?;
            if let Some(previous) = previous {
                debug!("Changed status from '{previous}' to '{status}'");
            }
            formatted.push(self.formatter.format(
                &namespace,
                record_identifier,
                xylem_schema::STATUS_KEY,
                &JsonValue::String(status.clone()),
            ));
        }
        info!(
            "Reported {} result(s) for '{}' in '{}' namespace",
            formatted.len(),
            record_identifier,
            namespace
        );
        Ok(Some(formatted))
    }

    async fn retrieve(
        &self,
        record_identifier: &str,
        result_identifier: Option<&str>,
        pipeline_type: PipelineType,
    ) -> Result<JsonValue> {
        let _guard = lock::lock_shared_timeout(&self.results_path, LOCK_WAIT)?;
        let tree = self.load_tree()?;
        let record = Self::section(&tree, self.schema.pipeline_name(), pipeline_type)
            .and_then(|section| section.get(record_identifier))
            .and_then(JsonValue::as_object)
            .ok_or_else(|| StoreError::RecordNotFound(record_identifier.to_string()))?;
        match result_identifier {
            // bookkeeping keys are stored with the record but are not results
            Some(result) => self
                .schema
                .typed_data(pipeline_type)
                .contains_key(result)
                .then(|| record.get(result))
                .flatten()
                .filter(|value| !value.is_null())
                .cloned()
                .ok_or_else(|| StoreError::ResultNotFound {
                    record: record_identifier.to_string(),
                    result: result.to_string(),
                }),
            None => {
                let mut out = Map::new();
                for key in self.schema.typed_data(pipeline_type).keys() {
                    if let Some(value) = record.get(key) {
                        if !value.is_null() {
                            out.insert(key.clone(), value.clone());
                        }
                    }
                }
                Ok(JsonValue::Object(out))
            }
        }
    }

    async fn select(
        &self,
        columns: Option<&[String]>,
        filter_conditions: &[FilterCondition],
        json_filter_conditions: &[JsonFilterCondition],
        offset: Option<u64>,
        limit: Option<u64>,
        pipeline_type: PipelineType,
    ) -> Result<Vec<SelectedRecord>> {
        let known = self.selectable_columns(pipeline_type);
        let selected: Vec<String> = match columns {
            Some(requested) => {
                for column in requested {
                    if !known.contains(column) {
                        return Err(StoreError::invalid_filter(format!(
                            "Selected column does not exist: {column}"
                        )));
                    }
                }
                requested.to_vec()
            }
            None => known.clone(),
        };
        for condition in filter_conditions {
            if !known.contains(&condition.column) {
                return Err(StoreError::invalid_filter(format!(
                    "Selected filter column does not exist: {}",
                    condition.column
                )));
            }
        }
        for condition in json_filter_conditions {
            if !known.contains(&condition.column) {
                return Err(StoreError::invalid_filter(format!(
                    "Selected filter column does not exist: {}",
                    condition.column
                )));
            }
        }

        let _guard = lock::lock_shared_timeout(&self.results_path, LOCK_WAIT)?;
        let tree = self.load_tree()?;
        let Some(section) = Self::section(&tree, self.schema.pipeline_name(), pipeline_type)
        else {
            return Ok(Vec::new());
        };
        let mut rows = Vec::new();
        for (record_identifier, entry) in section {
            let Some(record) = entry.as_object() else {
                continue;
            };
            let mut full = SelectedRecord::new();
            full.insert(
                RECORD_ID_KEY.to_string(),
                JsonValue::String(record_identifier.clone()),
            );
            for column in &known {
                if column == RECORD_ID_KEY {
                    continue;
                }
                full.insert(
                    column.clone(),
                    record.get(column).cloned().unwrap_or(JsonValue::Null),
                );
            }
            let keep = filter_conditions
                .iter()
                .all(|condition| condition.matches(full.get(&condition.column)))
                && json_filter_conditions
                    .iter()
                    .all(|condition| condition.matches(full.get(&condition.column)));
            if keep {
                rows.push(full);
            }
        }
        let mut rows: Vec<SelectedRecord> =
            rows.into_iter().skip(offset.unwrap_or(0) as usize).collect();
        if let Some(limit) = limit {
            rows.truncate(limit as usize);
        }
        Ok(rows
            .into_iter()
            .map(|mut full| {
                let mut row = SelectedRecord::new();
                for column in &selected {
                    if let Some(value) = full.remove(column) {
                        row.insert(column.clone(), value);
                    }
                }
                row
            })
            .collect())
    }

    async fn remove(
        &self,
        record_identifier: &str,
        result_identifier: Option<&str>,
        pipeline_type: PipelineType,
    ) -> Result<bool> {
        let _guard = lock::lock_exclusive_timeout(&self.results_path, LOCK_WAIT)?;
        let mut tree = self.load_tree()?;
        let schema = Arc::clone(&self.schema);
        let Some(section) = tree
            .get_mut(schema.pipeline_name())
            .and_then(|ns| ns.get_mut(pipeline_type.as_str()))
            .and_then(JsonValue::as_object_mut)
        else {
            error!("Record '{record_identifier}' not found");
            return Ok(false);
        };
        match result_identifier {
            None => {
                if section.remove(record_identifier).is_none() {
                    error!("Record '{record_identifier}' not found");
                    return Ok(false);
                }
                self.write_tree(&tree)?;
                self.remove_flag_files(record_identifier)?;
                info!("Removed record '{record_identifier}'");
                Ok(true)
            }
            Some(result) => {
                let Some(record) = section
                    .get_mut(record_identifier)
                    .and_then(JsonValue::as_object_mut)
                else {
                    error!("Record '{record_identifier}' not found");
                    return Ok(false);
                };
                if record.remove(result).is_none() {
                    error!("'{result}' has not been reported for '{record_identifier}'");
                    return Ok(false);
                }
                let has_other_results = schema
                    .typed_data(pipeline_type)
                    .keys()
                    .any(|key| record.get(key).is_some_and(|v| !v.is_null()));
                if !has_other_results {
                    info!(
                        "Last result removed for '{record_identifier}'. Removing the record"
                    );
                    section.remove(record_identifier);
                }
                self.write_tree(&tree)?;
                Ok(true)
            }
        }
    }

    async fn get_records(
        &self,
        limit: u64,
        offset: u64,
        pipeline_type: PipelineType,
    ) -> Result<RecordPage> {
        let _guard = lock::lock_shared_timeout(&self.results_path, LOCK_WAIT)?;
        let tree = self.load_tree()?;
        let ids: Vec<String> = Self::section(&tree, self.schema.pipeline_name(), pipeline_type)
            .map(|section| section.keys().cloned().collect())
            .unwrap_or_default();
        let count = ids.len() as u64;
        let records = ids
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(RecordPage {
            count,
            limit,
            offset,
            records,
        })
    }

    async fn count_records(&self, pipeline_type: PipelineType) -> Result<u64> {
        let _guard = lock::lock_shared_timeout(&self.results_path, LOCK_WAIT)?;
        let tree = self.load_tree()?;
        Ok(Self::section(&tree, self.schema.pipeline_name(), pipeline_type)
            .map(|section| section.len() as u64)
            .unwrap_or(0))
    }

    async fn list_results(
        &self,
        restrict_to: Option<&[String]>,
        record_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<Vec<String>> {
        let _guard = lock::lock_shared_timeout(&self.results_path, LOCK_WAIT)?;
        let tree = self.load_tree()?;
        let Some(record) = Self::section(&tree, self.schema.pipeline_name(), pipeline_type)
            .and_then(|section| section.get(record_identifier))
            .and_then(JsonValue::as_object)
        else {
            return Ok(Vec::new());
        };
        let schema_fields = self.schema.typed_data(pipeline_type);
        let reported = |key: &String| {
            schema_fields.contains_key(key) && record.get(key).is_some_and(|v| !v.is_null())
        };
        match restrict_to {
            Some(keys) => Ok(keys.iter().filter(|k| reported(k)).cloned().collect()),
            None => Ok(schema_fields
                .keys()
                .filter(|k| reported(k))
                .cloned()
                .collect()),
        }
    }

    async fn list_recent_results(
        &self,
        limit: u64,
        start: Option<&str>,
        end: Option<&str>,
        time_field: TimeField,
        pipeline_type: PipelineType,
    ) -> Result<Vec<RecentResult>> {
        let _guard = lock::lock_shared_timeout(&self.results_path, LOCK_WAIT)?;
        let tree = self.load_tree()?;
        let Some(section) = Self::section(&tree, self.schema.pipeline_name(), pipeline_type)
        else {
            return Ok(Vec::new());
        };
        let column = time_field.column();
        let mut hits: Vec<RecentResult> = section
            .iter()
            .filter_map(|(record_identifier, entry)| {
                let timestamp = entry.get(column)?.as_str()?;
                if start.is_some_and(|upper| timestamp > upper) {
                    return None;
                }
                if end.is_some_and(|lower| timestamp < lower) {
                    return None;
                }
                Some(RecentResult {
                    record_identifier: record_identifier.clone(),
                    timestamp: timestamp.to_string(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        hits.truncate(limit as usize);
        Ok(hits)
    }

    async fn check_record_exists(
        &self,
        record_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<bool> {
        let _guard = lock::lock_shared_timeout(&self.results_path, LOCK_WAIT)?;
        let tree = self.load_tree()?;
        Ok(Self::section(&tree, self.schema.pipeline_name(), pipeline_type)
            .is_some_and(|section| section.contains_key(record_identifier)))
    }

    async fn set_status(
        &self,
        record_identifier: &str,
        status_identifier: &str,
        _pipeline_type: PipelineType,
    ) -> Result<()> {
        assert_status_defined(&self.status_schema, status_identifier)?;
        let _guard = lock::lock_exclusive_timeout(&self.results_path, LOCK_WAIT)?;
        let previous = self.swap_status_flag(record_identifier, status_identifier)?;
        match previous {
            Some(previous) => {
                debug!("Changed status from '{previous}' to '{status_identifier}'")
            }
            None => debug!("Set status '{status_identifier}' for '{record_identifier}'"),
        }
        Ok(())
    }

    async fn get_status(
        &self,
        record_identifier: &str,
        _pipeline_type: PipelineType,
    ) -> Result<Option<String>> {
        let _guard = lock::lock_shared_timeout(&self.results_path, LOCK_WAIT)?;
        let mut statuses = self.read_statuses(record_identifier)?;
        if statuses.len() > 1 {
            return Err(StoreError::AmbiguousStatus {
                record: record_identifier.to_string(),
                candidates: statuses,
            });
        }
        Ok(statuses.pop())
    }

    async fn clear_status(
        &self,
        record_identifier: &str,
        flag_names: Option<&[String]>,
        _pipeline_type: PipelineType,
    ) -> Result<Vec<String>> {
        let _guard = lock::lock_exclusive_timeout(&self.results_path, LOCK_WAIT)?;
        let candidates: Vec<String> = match flag_names {
            Some(names) => names.to_vec(),
            None => self
                .status_schema
                .identifiers()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let mut removed = Vec::new();
        for status in candidates {
            let path = self.flag_path(record_identifier, &status);
            if std::fs::remove_file(&path).is_ok() {
                info!("Removed existing flag: {}", path.display());
                removed.push(status);
            }
        }
        Ok(removed)
    }
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
      lap_count:
        type: integer
        description: completed laps
      note:
        type: string
        description: free text
      alignment:
        type: object
        description: aligner summary
properties:
  collection_note:
    type: string
    description: project-wide note
";

    fn backend(dir: &Path) -> FileBackend {
        let schema = Arc::new(ResultsSchema::from_yaml(SCHEMA).unwrap());
        FileBackend::new(
            dir.join("results.yaml"),
            None,
            schema,
            StatusSchema::default(),
            ResultFormatter::Default,
        )
        .unwrap()
    }

    fn fields(pairs: &[(&str, JsonValue)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn reported_values_come_back_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let reported = fields(&[
            ("distance", json!(12.5)),
            ("lap_count", json!(3)),
            ("note", json!("windy")),
        ]);
        let lines = backend
            .report("sample_1", reported.clone(), PipelineType::Sample, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("'sample_1'"));
        assert!(lines[0].contains("'rnaseq'"));

        let all = backend
            .retrieve("sample_1", None, PipelineType::Sample)
            .await
            .unwrap();
        assert_eq!(all, JsonValue::Object(reported));
        let one = backend
            .retrieve("sample_1", Some("distance"), PipelineType::Sample)
            .await
            .unwrap();
        assert_eq!(one, json!(12.5));
    }

    #[tokio::test]
    async fn overwrite_is_gated_until_forced() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend
            .report(
                "sample_1",
                fields(&[("distance", json!(1.0))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap()
            .unwrap();
        let gated = backend
            .report(
                "sample_1",
                fields(&[("distance", json!(2.0)), ("note", json!("x"))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap();
        assert!(gated.is_none());
        // the gated report must not have written the non-overlapping key
        let err = backend
            .retrieve("sample_1", Some("note"), PipelineType::Sample)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ResultNotFound { .. }));

        backend
            .report(
                "sample_1",
                fields(&[("distance", json!(2.0))]),
                PipelineType::Sample,
                true,
            )
            .await
            .unwrap()
            .unwrap();
        let value = backend
            .retrieve("sample_1", Some("distance"), PipelineType::Sample)
            .await
            .unwrap();
        assert_eq!(value, json!(2.0));
    }

    #[tokio::test]
    async fn unknown_results_are_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let err = backend
            .report(
                "sample_1",
                fields(&[("distance", json!(1.0)), ("speed", json!(2.0))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownResult { .. }));
        assert!(!backend
            .check_record_exists("sample_1", PipelineType::Sample)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn removing_the_last_result_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend
            .report(
                "sample_1",
                fields(&[("distance", json!(1.0)), ("note", json!("ok"))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap();
        assert!(backend
            .remove("sample_1", Some("note"), PipelineType::Sample)
            .await
            .unwrap());
        assert!(backend
            .check_record_exists("sample_1", PipelineType::Sample)
            .await
            .unwrap());
        assert!(backend
            .remove("sample_1", Some("distance"), PipelineType::Sample)
            .await
            .unwrap());
        assert!(!backend
            .check_record_exists("sample_1", PipelineType::Sample)
            .await
            .unwrap());
        assert!(!backend
            .remove("sample_1", Some("distance"), PipelineType::Sample)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn a_foreign_namespace_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.yaml");
        std::fs::write(&path, "atacseq:\n  project: {}\n  sample: {}\n").unwrap();
        let schema = Arc::new(ResultsSchema::from_yaml(SCHEMA).unwrap());
        let err = FileBackend::new(
            path,
            None,
            schema,
            StatusSchema::default(),
            ResultFormatter::Default,
        )
        .err()
        .unwrap();
        match err {
            StoreError::FileInUse { count, names, .. } => {
                assert_eq!(count, 1);
                assert_eq!(names, "atacseq");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn status_flags_stay_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        assert_eq!(
            backend
                .get_status("sample_1", PipelineType::Sample)
                .await
                .unwrap(),
            None
        );
        backend
            .set_status("sample_1", "running", PipelineType::Sample)
            .await
            .unwrap();
        backend
            .set_status("sample_1", "completed", PipelineType::Sample)
            .await
            .unwrap();
        assert_eq!(
            backend
                .get_status("sample_1", PipelineType::Sample)
                .await
                .unwrap()
                .as_deref(),
            Some("completed")
        );
        let flag = dir.path().join("rnaseq_sample_1_completed.flag");
        assert_eq!(std::fs::read_to_string(flag).unwrap(), "completed");
        assert!(!dir.path().join("rnaseq_sample_1_running.flag").exists());

        let err = backend
            .set_status("sample_1", "sprinting", PipelineType::Sample)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnrecognizedStatus { .. }));

        let removed = backend
            .clear_status("sample_1", None, PipelineType::Sample)
            .await
            .unwrap();
        assert_eq!(removed, vec!["completed".to_string()]);
        assert_eq!(
            backend
                .get_status("sample_1", PipelineType::Sample)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn bookkeeping_keys_are_not_results() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend
            .report(
                "sample_1",
                fields(&[("distance", json!(5.0))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap();
        for key in ["created_time", "modified_time"] {
            let err = backend
                .retrieve("sample_1", Some(key), PipelineType::Sample)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::ResultNotFound { .. }), "{key}");
            assert!(!backend
                .check_result_exists("sample_1", key, PipelineType::Sample)
                .await
                .unwrap());
        }
        let restrict = ["created_time".to_string(), "distance".to_string()];
        let listed = backend
            .list_results(Some(&restrict), "sample_1", PipelineType::Sample)
            .await
            .unwrap();
        assert_eq!(listed, vec!["distance".to_string()]);
    }

    #[tokio::test]
    async fn conflicting_flags_surface_as_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend
            .set_status("sample_1", "running", PipelineType::Sample)
            .await
            .unwrap();
        std::fs::write(dir.path().join("rnaseq_sample_1_failed.flag"), "failed").unwrap();
        let err = backend
            .get_status("sample_1", PipelineType::Sample)
            .await
            .unwrap_err();
        match err {
            StoreError::AmbiguousStatus { record, candidates } => {
                assert_eq!(record, "sample_1");
                assert_eq!(
                    candidates,
                    vec!["failed".to_string(), "running".to_string()]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn removing_a_record_drops_its_flag() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend
            .report(
                "sample_1",
                fields(&[("distance", json!(1.0))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap();
        backend
            .set_status("sample_1", "completed", PipelineType::Sample)
            .await
            .unwrap();
        assert!(backend
            .remove("sample_1", None, PipelineType::Sample)
            .await
            .unwrap());
        assert!(!dir.path().join("rnaseq_sample_1_completed.flag").exists());
        assert_eq!(
            backend
                .get_status("sample_1", PipelineType::Sample)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn select_filters_projects_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        for (id, distance, genome) in [
            ("sample_1", 5.0, "hg38"),
            ("sample_2", 10.0, "hg38"),
            ("sample_3", 15.0, "mm10"),
        ] {
            backend
                .report(
                    id,
                    fields(&[
                        ("distance", json!(distance)),
                        ("alignment", json!({"genome": genome})),
                    ]),
                    PipelineType::Sample,
                    false,
                )
                .await
                .unwrap();
        }

        let rows = backend
            .select(
                Some(&["record_identifier".to_string(), "distance".to_string()]),
                &[FilterCondition::new("distance", "ge", json!(10)).unwrap()],
                &[],
                None,
                None,
                PipelineType::Sample,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("record_identifier"), Some(&json!("sample_2")));
        assert_eq!(rows[0].len(), 2);

        let rows = backend
            .select(
                None,
                &[],
                &[JsonFilterCondition::new("alignment", "genome", json!("hg38"))],
                Some(1),
                Some(1),
                PipelineType::Sample,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("record_identifier"), Some(&json!("sample_2")));

        let err = backend
            .select(
                None,
                &[FilterCondition::new("speed", "eq", json!(1)).unwrap()],
                &[],
                None,
                None,
                PipelineType::Sample,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn recent_results_window_is_inclusive_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.yaml");
        std::fs::write(
            &path,
            "\
rnaseq:
  project: {}
  sample:
    sample_1:
      created_time: '2026-08-01 08:00:00'
      modified_time: '2026-08-01 09:00:00'
      distance: 1.0
    sample_2:
      created_time: '2026-08-02 08:00:00'
      modified_time: '2026-08-02 09:00:00'
      distance: 2.0
",
        )
        .unwrap();
        let schema = Arc::new(ResultsSchema::from_yaml(SCHEMA).unwrap());
        let backend = FileBackend::new(
            path,
            None,
            schema,
            StatusSchema::default(),
            ResultFormatter::Default,
        )
        .unwrap();

        let recent = backend
            .list_recent_results(10, None, None, TimeField::Modified, PipelineType::Sample)
            .await
            .unwrap();
        let ids: Vec<&str> = recent
            .iter()
            .map(|r| r.record_identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["sample_2", "sample_1"]);

        let recent = backend
            .list_recent_results(
                10,
                Some("2026-08-01 23:59:59"),
                None,
                TimeField::Modified,
                PipelineType::Sample,
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].record_identifier, "sample_1");

        let recent = backend
            .list_recent_results(
                10,
                None,
                Some("2026-08-02 00:00:00"),
                TimeField::Created,
                PipelineType::Sample,
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].record_identifier, "sample_2");
    }

    #[tokio::test]
    async fn project_and_sample_records_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend
            .report(
                "rnaseq",
                fields(&[("collection_note", json!("batch A"))]),
                PipelineType::Project,
                false,
            )
            .await
            .unwrap();
        backend
            .report(
                "sample_1",
                fields(&[("distance", json!(1.0))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap();
        assert_eq!(backend.count_records(PipelineType::Project).await.unwrap(), 1);
        assert_eq!(backend.count_records(PipelineType::Sample).await.unwrap(), 1);
        let page = backend
            .get_records(10, 0, PipelineType::Project)
            .await
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.records, vec!["rnaseq".to_string()]);
        let listed = backend
            .list_results(None, "sample_1", PipelineType::Project)
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn retrieve_multiple_skips_absent_records() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend
            .report(
                "sample_1",
                fields(&[("distance", json!(1.0)), ("note", json!("a"))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap();
        backend
            .report(
                "sample_2",
                fields(&[("distance", json!(2.0))]),
                PipelineType::Sample,
                false,
            )
            .await
            .unwrap();
        let pages = backend
            .retrieve_multiple(
                &[
                    "sample_1".to_string(),
                    "sample_2".to_string(),
                    "ghost".to_string(),
                ],
                &["distance".to_string()],
                100,
                0,
                PipelineType::Sample,
            )
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].record_identifier, "sample_1");
        assert_eq!(pages[0].results.get("distance"), Some(&json!(1.0)));
        assert!(!pages[0].results.contains_key("note"));
    }
}
