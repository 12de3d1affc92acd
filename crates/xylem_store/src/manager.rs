//! The typed entry point over a configured backend.
//!
//! A [`ResultsManager`] owns exactly one backend, chosen from the resolved
//! configuration: a results file means the file backend, otherwise database
//! credentials mean the database backend. Callers talk to the manager; the
//! manager fills in the configured defaults (record identifier, pipeline
//! type), validates values against the schema, and dispatches.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;

use xylem_schema::{
    validate_value, FieldMap, PipelineType, ResultsSchema, StatusSchema, STATUS_KEY,
};

use crate::backend::db::DatabaseBackend;
use crate::backend::file::FileBackend;
use crate::backend::{
    RecentResult, RecordPage, RecordResults, ResultsBackend, SelectedRecord, TimeField,
};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::filter::{FilterCondition, JsonFilterCondition};

pub struct ResultsManager {
    namespace: String,
    record_identifier: Option<String>,
    pipeline_type: PipelineType,
    schema: Arc<ResultsSchema>,
    status_schema: StatusSchema,
    backend: Box<dyn ResultsBackend>,
}

impl ResultsManager {
    /// Build a manager from resolved configuration. Loads the results
    /// schema, picks the status schema and opens the one configured backend.
    pub async fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let schema_path = config
            .schema_path
            .as_ref()
            .ok_or_else(|| StoreError::config("Results schema not found"))?;
        let mut schema = ResultsSchema::from_file(schema_path)?;
        if let Some(namespace) = &config.namespace {
            schema = schema.with_pipeline_name(namespace.clone());
        }
        let schema = Arc::new(schema);
        let namespace = schema.pipeline_name().to_string();

        let status_schema = match &config.status_schema_path {
            Some(path) => StatusSchema::from_file(path)?,
            None if !schema.status_data().is_empty() => {
                StatusSchema::from_fields(schema.status_data())
            }
            None => StatusSchema::default(),
        };

        let backend: Box<dyn ResultsBackend> = match (&config.results_file_path, &config.database)
        {
            (Some(results_path), _) => Box::new(FileBackend::new(
                results_path.clone(),
                config.flag_file_dir.clone(),
                Arc::clone(&schema),
                status_schema.clone(),
                config.formatter,
            )?),
            (None, Some(db)) => Box::new(
                DatabaseBackend::open(
                    db,
                    Arc::clone(&schema),
                    status_schema.clone(),
                    config.formatter,
                )
                .await?,
            ),
            (None, None) => {
                return Err(StoreError::config(
                    "Either a results file path or database credentials are required",
                ))
            }
        };
        info!(
            "Initialized results manager for '{}' over the {} backend",
            namespace,
            backend.backend_kind()
        );

        Ok(Self {
            namespace,
            record_identifier: config.record_identifier,
            pipeline_type: config.pipeline_type.unwrap_or_default(),
            schema,
            status_schema,
            backend,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The configured default record identifier, if any.
    pub fn record_identifier(&self) -> Option<&str> {
        self.record_identifier.as_deref()
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    pub fn schema(&self) -> &ResultsSchema {
        &self.schema
    }

    pub fn status_schema(&self) -> &StatusSchema {
        &self.status_schema
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.backend_kind()
    }

    fn resolve_record<'a>(&'a self, explicit: Option<&'a str>) -> Result<&'a str> {
        explicit
            .or(self.record_identifier.as_deref())
            .ok_or_else(|| {
                StoreError::config("No record identifier provided or configured")
            })
    }

    /// Validate and report `values` for one record. Value validation is
    /// schema-driven; with `try_convert` lenient coercions run first.
    /// Returns `None` when the overwrite gate blocked the write.
    pub async fn report(
        &self,
        values: FieldMap,
        record_identifier: Option<&str>,
        force: bool,
        try_convert: bool,
    ) -> Result<Option<Vec<String>>> {
        let record = self.resolve_record(record_identifier)?;
        let mut validated = FieldMap::new();
        for (key, value) in values {
            let value = match self.schema.descriptor(self.pipeline_type, &key) {
                Some(descriptor) if key != STATUS_KEY => {
                    validate_value(&key, descriptor, value, try_convert)?
                }
                // unknown keys fall through so the backend can name them all
                _ => value,
            };
            validated.insert(key, value);
        }
        self.backend
            .report(record, validated, self.pipeline_type, force)
            .await
    }

    pub async fn retrieve(
        &self,
        record_identifier: Option<&str>,
        result_identifier: Option<&str>,
    ) -> Result<JsonValue> {
        let record = self.resolve_record(record_identifier)?;
        self.backend
            .retrieve(record, result_identifier, self.pipeline_type)
            .await
    }

    pub async fn retrieve_multiple(
        &self,
        record_identifiers: &[String],
        result_identifiers: &[String],
        limit: u64,
        offset: u64,
    ) -> Result<Vec<RecordResults>> {
        self.backend
            .retrieve_multiple(
                record_identifiers,
                result_identifiers,
                limit,
                offset,
                self.pipeline_type,
            )
            .await
    }

    pub async fn select(
        &self,
        columns: Option<&[String]>,
        filter_conditions: &[FilterCondition],
        json_filter_conditions: &[JsonFilterCondition],
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<SelectedRecord>> {
        self.backend
            .select(
                columns,
                filter_conditions,
                json_filter_conditions,
                offset,
                limit,
                self.pipeline_type,
            )
            .await
    }

    pub async fn remove(
        &self,
        record_identifier: Option<&str>,
        result_identifier: Option<&str>,
    ) -> Result<bool> {
        let record = self.resolve_record(record_identifier)?;
        self.backend
            .remove(record, result_identifier, self.pipeline_type)
            .await
    }

    pub async fn get_records(&self, limit: u64, offset: u64) -> Result<RecordPage> {
        self.backend
            .get_records(limit, offset, self.pipeline_type)
            .await
    }

    pub async fn count_records(&self, pipeline_type: PipelineType) -> Result<u64> {
        self.backend.count_records(pipeline_type).await
    }

    pub async fn list_results(
        &self,
        restrict_to: Option<&[String]>,
        record_identifier: Option<&str>,
    ) -> Result<Vec<String>> {
        let record = self.resolve_record(record_identifier)?;
        self.backend
            .list_results(restrict_to, record, self.pipeline_type)
            .await
    }

    pub async fn list_recent_results(
        &self,
        limit: u64,
        start: Option<&str>,
        end: Option<&str>,
        time_field: TimeField,
    ) -> Result<Vec<RecentResult>> {
        self.backend
            .list_recent_results(limit, start, end, time_field, self.pipeline_type)
            .await
    }

    pub async fn check_record_exists(&self, record_identifier: Option<&str>) -> Result<bool> {
        let record = self.resolve_record(record_identifier)?;
        self.backend
            .check_record_exists(record, self.pipeline_type)
            .await
    }

    pub async fn check_result_exists(
        &self,
        record_identifier: Option<&str>,
        result_identifier: &str,
    ) -> Result<bool> {
        let record = self.resolve_record(record_identifier)?;
        self.backend
            .check_result_exists(record, result_identifier, self.pipeline_type)
            .await
    }

    pub async fn set_status(
        &self,
        record_identifier: Option<&str>,
        status_identifier: &str,
    ) -> Result<()> {
        let record = self.resolve_record(record_identifier)?;
        self.backend
            .set_status(record, status_identifier, self.pipeline_type)
            .await
    }

    pub async fn get_status(&self, record_identifier: Option<&str>) -> Result<Option<String>> {
        let record = self.resolve_record(record_identifier)?;
        self.backend.get_status(record, self.pipeline_type).await
    }

    pub async fn clear_status(
        &self,
        record_identifier: Option<&str>,
        flag_names: Option<&[String]>,
    ) -> Result<Vec<String>> {
        let record = self.resolve_record(record_identifier)?;
        self.backend
            .clear_status(record, flag_names, self.pipeline_type)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

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
";

    fn write_schema(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("schema.yaml");
        std::fs::write(&path, SCHEMA).unwrap();
        path
    }

    async fn file_manager(dir: &Path) -> ResultsManager {
        let config = StoreConfig {
            schema_path: Some(write_schema(dir)),
            results_file_path: Some(dir.join("results.yaml")),
            record_identifier: Some("sample_1".to_string()),
            ..StoreConfig::default()
        };
        ResultsManager::new(config).await.unwrap()
    }

    async fn db_manager(dir: &Path) -> ResultsManager {
        let config = StoreConfig {
            schema_path: Some(write_schema(dir)),
            database: Some(crate::config::DatabaseConfig {
                dialect: "sqlite".to_string(),
                name: Some(dir.join("results.db").display().to_string()),
                host: None,
                port: None,
                user: None,
                password: None,
            }),
            database_only: true,
            record_identifier: Some("sample_1".to_string()),
            ..StoreConfig::default()
        };
        ResultsManager::new(config).await.unwrap()
    }

    fn fields(pairs: &[(&str, JsonValue)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn backend_follows_the_configuration() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_manager(dir.path()).await.backend_kind(), "file");
        assert_eq!(db_manager(dir.path()).await.backend_kind(), "database");
    }

    #[tokio::test]
    async fn configured_record_identifier_is_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path()).await;
        manager
            .report(fields(&[("distance", json!(1.5))]), None, false, false)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.check_record_exists(None).await.unwrap());
        assert!(manager.check_record_exists(Some("sample_1")).await.unwrap());
        assert!(!manager.check_record_exists(Some("other")).await.unwrap());
    }

    #[tokio::test]
    async fn missing_record_identifier_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            schema_path: Some(write_schema(dir.path())),
            results_file_path: Some(dir.path().join("results.yaml")),
            ..StoreConfig::default()
        };
        let manager = ResultsManager::new(config).await.unwrap();
        let err = manager.retrieve(None, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test]
    async fn values_are_validated_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = db_manager(dir.path()).await;
        let err = manager
            .report(fields(&[("lap_count", json!("3"))]), None, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));

        manager
            .report(fields(&[("lap_count", json!("3"))]), None, false, true)
            .await
            .unwrap()
            .unwrap();
        let value = manager.retrieve(None, Some("lap_count")).await.unwrap();
        assert_eq!(value, json!(3));
    }

    #[tokio::test]
    async fn namespace_override_renames_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            schema_path: Some(write_schema(dir.path())),
            results_file_path: Some(dir.path().join("results.yaml")),
            namespace: Some("my_run".to_string()),
            record_identifier: Some("sample_1".to_string()),
            ..StoreConfig::default()
        };
        let manager = ResultsManager::new(config).await.unwrap();
        assert_eq!(manager.namespace(), "my_run");
        let lines = manager
            .report(fields(&[("note", json!("ok"))]), None, false, false)
            .await
            .unwrap()
            .unwrap();
        assert!(lines[0].contains("'my_run' namespace"));
    }

    #[tokio::test]
    async fn status_flows_through_both_backends() {
        let dir = tempfile::tempdir().unwrap();
        for manager in [file_manager(dir.path()).await, db_manager(dir.path()).await] {
            manager.set_status(None, "running").await.unwrap();
            assert_eq!(
                manager.get_status(None).await.unwrap().as_deref(),
                Some("running")
            );
            let removed = manager.clear_status(None, None).await.unwrap();
            assert_eq!(removed, vec!["running".to_string()]);
            assert_eq!(manager.get_status(None).await.unwrap(), None);
        }
    }
}
