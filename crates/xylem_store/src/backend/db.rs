//! SQLite-backed storage.
//!
//! One table per pipeline type, created from the schema's storage columns on
//! first use. The status lives in a `status` column on the record row; the
//! bookkeeping timestamps are columns as well. Every multi-step mutation runs
//! inside a transaction that commits promptly; on error the transaction rolls
//! back when dropped, so a failed report never lands partially.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, error, info, warn};

use xylem_schema::{
    ColumnSpec, ColumnType, FieldMap, PipelineType, ResultsSchema, StatusSchema, CREATED_TIME_KEY,
    MODIFIED_TIME_KEY, RECORD_ID_KEY, STATUS_KEY,
};

use crate::backend::{
    assert_results_defined, assert_status_defined, now_timestamp, take_status, RecentResult,
    RecordPage, ResultsBackend, SelectedRecord, TimeField,
};
use crate::config::DatabaseConfig;
use crate::error::{Result, StoreError};
use crate::filter::{FilterCondition, FilterValue, JsonFilterCondition};
use crate::reports::ResultFormatter;

const MAX_CONNECTIONS: u32 = 5;

pub struct DatabaseBackend {
    pool: SqlitePool,
    schema: Arc<ResultsSchema>,
    status_schema: StatusSchema,
    formatter: ResultFormatter,
    project_columns: Vec<ColumnSpec>,
    sample_columns: Vec<ColumnSpec>,
}

impl DatabaseBackend {
    /// Connect and create the per-type tables if they do not exist yet.
    /// A database already holding tables for a different pipeline name is
    /// rejected, mirroring the one-namespace-per-file rule.
    pub async fn open(
        db: &DatabaseConfig,
        schema: Arc<ResultsSchema>,
        status_schema: StatusSchema,
        formatter: ResultFormatter,
    ) -> Result<Self> {
        if db.dialect != "sqlite" {
            return Err(StoreError::config(format!(
                "Unsupported database dialect '{}': this build speaks sqlite",
                db.dialect
            )));
        }
        let url = db.connection_url()?;
        if let Some(name) = &db.name {
            if let Some(parent) = std::path::Path::new(name).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(&url)
            .await?;
        let project_columns = schema.storage_columns(PipelineType::Project);
        let sample_columns = schema.storage_columns(PipelineType::Sample);
        let backend = Self {
            pool,
            schema,
            status_schema,
            formatter,
            project_columns,
            sample_columns,
        };
        backend.verify_namespace(db).await?;
        backend.initialize_tables().await?;
        info!(
            "Initialized database for '{}': {}",
            backend.schema.pipeline_name(),
            url
        );
        Ok(backend)
    }

    async fn verify_namespace(&self, db: &DatabaseConfig) -> Result<()> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND (name LIKE '%__project' OR name LIKE '%__sample')",
        )
        .fetch_all(&self.pool)
        .await?;
        let namespace = self.schema.pipeline_name();
        let mut foreign: Vec<String> = tables
            .iter()
            .filter_map(|table| {
                table
                    .strip_suffix("__project")
                    .or_else(|| table.strip_suffix("__sample"))
            })
            .filter(|prefix| *prefix != namespace)
            .map(str::to_string)
            .collect();
        foreign.sort();
        foreign.dedup();
        if foreign.is_empty() {
            Ok(())
        } else {
            Err(StoreError::FileInUse {
                path: db.name.clone().unwrap_or_else(|| db.dialect.clone()),
                count: foreign.len(),
                names: foreign.join(", "),
            })
        }
    }

    async fn initialize_tables(&self) -> Result<()> {
        for pipeline_type in [PipelineType::Project, PipelineType::Sample] {
            let mut ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    id INTEGER PRIMARY KEY,\n    \
                 {} TEXT NOT NULL UNIQUE,\n    {} TEXT,\n    {} TEXT,\n    {} TEXT",
                quoted(&self.schema.table_name(pipeline_type)),
                quoted(RECORD_ID_KEY),
                quoted(STATUS_KEY),
                quoted(CREATED_TIME_KEY),
                quoted(MODIFIED_TIME_KEY),
            );
            for column in self.columns(pipeline_type) {
                ddl.push_str(&format!(
                    ",\n    {} {}",
                    quoted(&column.name),
                    column.column_type.sql_type()
                ));
            }
            ddl.push_str("\n)");
            sqlx::query(&ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn columns(&self, pipeline_type: PipelineType) -> &[ColumnSpec] {
        match pipeline_type {
            PipelineType::Project => &self.project_columns,
            PipelineType::Sample => &self.sample_columns,
        }
    }

    fn table(&self, pipeline_type: PipelineType) -> String {
        quoted(&self.schema.table_name(pipeline_type))
    }

    fn column_spec(&self, pipeline_type: PipelineType, name: &str) -> Option<&ColumnSpec> {
        self.columns(pipeline_type)
            .iter()
            .find(|column| column.name == name)
    }

    /// Columns a selection may name, with their storage types. Matches the
    /// file backend: the record identifier, the schema fields and the
    /// bookkeeping timestamps.
    fn selectable_columns(&self, pipeline_type: PipelineType) -> Vec<ColumnSpec> {
        let mut columns = vec![ColumnSpec {
            name: RECORD_ID_KEY.to_string(),
            column_type: ColumnType::Text,
        }];
        columns.extend(self.columns(pipeline_type).iter().cloned());
        for name in [CREATED_TIME_KEY, MODIFIED_TIME_KEY] {
            columns.push(ColumnSpec {
                name: name.to_string(),
                column_type: ColumnType::Text,
            });
        }
        columns
    }

    /// Reported keys paired with their storage columns. Schema fields whose
    /// declared type has no storage mapping are dropped with a warning, the
    /// same way the storage model skips them.
    fn storable_values(
        &self,
        pipeline_type: PipelineType,
        values: FieldMap,
    ) -> Vec<(ColumnSpec, JsonValue)> {
        let mut storable = Vec::with_capacity(values.len());
        for (key, value) in values {
            match self.column_spec(pipeline_type, &key) {
                Some(spec) => storable.push((spec.clone(), value)),
                None => warn!("Skipping result '{key}': no storage column for it"),
            }
        }
        storable
    }

    async fn fetch_status(
        &self,
        record_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<Option<String>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quoted(STATUS_KEY),
            self.table(pipeline_type),
            quoted(RECORD_ID_KEY),
        );
        let status: Option<Option<String>> = sqlx::query_scalar(&sql)
            .bind(record_identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.flatten())
    }
}

#[async_trait]
impl ResultsBackend for DatabaseBackend {
    fn backend_kind(&self) -> &'static str {
        "database"
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
        let storable = self.storable_values(pipeline_type, results);
        if storable.is_empty() && status.is_none() {
            return Ok(Some(Vec::new()));
        }
        let namespace = self.schema.pipeline_name().to_string();
        let table = self.table(pipeline_type);

        let mut tx = self.pool.begin().await?;

        let existing = if storable.is_empty() {
            None
        } else {
            let mut query = QueryBuilder::<Sqlite>::new("SELECT ");
            let mut separated = query.separated(", ");
            for (spec, _) in &storable {
                separated.push(quoted(&spec.name));
            }
            query.push(format!(" FROM {table} WHERE {} = ", quoted(RECORD_ID_KEY)));
            query.push_bind(record_identifier);
            query.build().fetch_optional(&mut *tx).await?
        };
        let record_exists = existing.is_some()
            || sqlx::query(&format!(
                "SELECT 1 FROM {table} WHERE {} = ?",
                quoted(RECORD_ID_KEY)
            ))
            .bind(record_identifier)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        if !force {
            if let Some(row) = &existing {
                let overlapping: Vec<String> = storable
                    .iter()
                    .filter(|(spec, _)| {
                        !value_from_row(row, &spec.name, spec.column_type).is_null()
                    })
                    .map(|(spec, _)| spec.name.clone())
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
        if record_exists {
            let mut query = QueryBuilder::<Sqlite>::new(format!("UPDATE {table} SET "));
            query.push(format!("{} = ", quoted(MODIFIED_TIME_KEY)));
            query.push_bind(now.clone());
            for (spec, value) in &storable {
                query.push(format!(", {} = ", quoted(&spec.name)));
                push_value(&mut query, value);
            }
            if let Some(status) = &status {
                query.push(format!(", {} = ", quoted(STATUS_KEY)));
                query.push_bind(status.clone());
            }
            query.push(format!(" WHERE {} = ", quoted(RECORD_ID_KEY)));
            query.push_bind(record_identifier);
            query.build().execute(&mut *tx).await?;
        } else {
            let mut query = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {table} ({}, {}, {}",
                quoted(RECORD_ID_KEY),
                quoted(CREATED_TIME_KEY),
                quoted(MODIFIED_TIME_KEY),
            ));
            for (spec, _) in &storable {
                query.push(format!(", {}", quoted(&spec.name)));
            }
            if status.is_some() {
                query.push(format!(", {}", quoted(STATUS_KEY)));
            }
            query.push(") VALUES (");
            query.push_bind(record_identifier);
            query.push(", ");
            query.push_bind(now.clone());
            query.push(", ");
            query.push_bind(now.clone());
            for (_, value) in &storable {
                query.push(", ");
                push_value(&mut query, value);
            }
            if let Some(status) = &status {
                query.push(", ");
                query.push_bind(status.clone());
            }
            query.push(")");
            query.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        let mut formatted = Vec::with_capacity(storable.len() + 1);
        for (spec, value) in &storable {
            formatted.push(
                self.formatter
                    .format(&namespace, record_identifier, &spec.name, value),
            );
        }
        if let Some(status) = &status {
            formatted.push(self.formatter.format(
                &namespace,
                record_identifier,
                STATUS_KEY,
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
        let columns = self.columns(pipeline_type);
        let mut query = QueryBuilder::<Sqlite>::new("SELECT ");
        let mut separated = query.separated(", ");
        separated.push(quoted(RECORD_ID_KEY));
        for column in columns {
            separated.push(quoted(&column.name));
        }
        query.push(format!(
            " FROM {} WHERE {} = ",
            self.table(pipeline_type),
            quoted(RECORD_ID_KEY)
        ));
        query.push_bind(record_identifier);
        let row = query
            .build()
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::RecordNotFound(record_identifier.to_string()))?;

        match result_identifier {
            Some(result) => {
                let spec = self
                    .column_spec(pipeline_type, result)
                    .ok_or_else(|| StoreError::ResultNotFound {
                        record: record_identifier.to_string(),
                        result: result.to_string(),
                    })?;
                let value = value_from_row(&row, &spec.name, spec.column_type);
                if value.is_null() {
                    Err(StoreError::ResultNotFound {
                        record: record_identifier.to_string(),
                        result: result.to_string(),
                    })
                } else {
                    Ok(value)
                }
            }
            None => {
                let mut out = serde_json::Map::new();
                for column in columns {
                    let value = value_from_row(&row, &column.name, column.column_type);
                    if !value.is_null() {
                        out.insert(column.name.clone(), value);
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
        let lookup = |name: &str| known.iter().find(|spec| spec.name == name);
        let selected: Vec<ColumnSpec> = match columns {
            Some(requested) => requested
                .iter()
                .map(|column| {
                    lookup(column).cloned().ok_or_else(|| {
                        StoreError::invalid_filter(format!(
                            "Selected column does not exist: {column}"
                        ))
                    })
                })
                .collect::<Result<_>>()?,
            None => known.clone(),
        };
        for condition in filter_conditions {
            if lookup(&condition.column).is_none() {
                return Err(StoreError::invalid_filter(format!(
                    "Selected filter column does not exist: {}",
                    condition.column
                )));
            }
        }
        for condition in json_filter_conditions {
            if lookup(&condition.column).is_none() {
                return Err(StoreError::invalid_filter(format!(
                    "Selected filter column does not exist: {}",
                    condition.column
                )));
            }
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT ");
        let mut separated = query.separated(", ");
        for spec in &selected {
            separated.push(quoted(&spec.name));
        }
        query.push(format!(" FROM {} WHERE 1 = 1", self.table(pipeline_type)));
        for condition in filter_conditions {
            push_condition(&mut query, condition);
        }
        for condition in json_filter_conditions {
            query.push(format!(
                " AND json_extract({}, '$.' || ",
                quoted(&condition.column)
            ));
            query.push_bind(condition.key.clone());
            query.push(") = ");
            push_value(&mut query, &condition.value);
        }
        query.push(format!(" ORDER BY {}", quoted(RECORD_ID_KEY)));
        // sqlite accepts OFFSET only after a LIMIT; -1 means unlimited
        query.push(" LIMIT ");
        query.push_bind(limit.map(|n| n as i64).unwrap_or(-1));
        query.push(" OFFSET ");
        query.push_bind(offset.unwrap_or(0) as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let mut record = SelectedRecord::new();
                for spec in &selected {
                    record.insert(
                        spec.name.clone(),
                        value_from_row(row, &spec.name, spec.column_type),
                    );
                }
                record
            })
            .collect())
    }

    async fn remove(
        &self,
        record_identifier: &str,
        result_identifier: Option<&str>,
        pipeline_type: PipelineType,
    ) -> Result<bool> {
        let table = self.table(pipeline_type);
        match result_identifier {
            None => {
                let deleted = sqlx::query(&format!(
                    "DELETE FROM {table} WHERE {} = ?",
                    quoted(RECORD_ID_KEY)
                ))
                .bind(record_identifier)
                .execute(&self.pool)
                .await?
                .rows_affected();
                if deleted == 0 {
                    error!("Record '{record_identifier}' not found");
                    return Ok(false);
                }
                info!("Removed record '{record_identifier}'");
                Ok(true)
            }
            Some(result) => {
                let Some(spec) = self.column_spec(pipeline_type, result).cloned() else {
                    error!("'{result}' has not been reported for '{record_identifier}'");
                    return Ok(false);
                };
                let mut tx = self.pool.begin().await?;
                let mut query = QueryBuilder::<Sqlite>::new("SELECT ");
                let mut separated = query.separated(", ");
                for column in self.columns(pipeline_type) {
                    separated.push(quoted(&column.name));
                }
                query.push(format!(" FROM {table} WHERE {} = ", quoted(RECORD_ID_KEY)));
                query.push_bind(record_identifier);
                let Some(row) = query.build().fetch_optional(&mut *tx).await? else {
                    error!("Record '{record_identifier}' not found");
                    return Ok(false);
                };
                if value_from_row(&row, &spec.name, spec.column_type).is_null() {
                    error!("'{result}' has not been reported for '{record_identifier}'");
                    return Ok(false);
                }
                let has_other_results = self
                    .columns(pipeline_type)
                    .iter()
                    .filter(|column| column.name != spec.name)
                    .any(|column| {
                        !value_from_row(&row, &column.name, column.column_type).is_null()
                    });
                if has_other_results {
                    sqlx::query(&format!(
                        "UPDATE {table} SET {} = NULL, {} = ? WHERE {} = ?",
                        quoted(&spec.name),
                        quoted(MODIFIED_TIME_KEY),
                        quoted(RECORD_ID_KEY),
                    ))
                    .bind(now_timestamp())
                    .bind(record_identifier)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    info!("Last result removed for '{record_identifier}'. Removing the record");
                    sqlx::query(&format!(
                        "DELETE FROM {table} WHERE {} = ?",
                        quoted(RECORD_ID_KEY)
                    ))
                    .bind(record_identifier)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
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
        let table = self.table(pipeline_type);
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let records: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT {} FROM {table} ORDER BY {} LIMIT ? OFFSET ?",
            quoted(RECORD_ID_KEY),
            quoted(RECORD_ID_KEY),
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(RecordPage {
            count: count as u64,
            limit,
            offset,
            records,
        })
    }

    async fn count_records(&self, pipeline_type: PipelineType) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table(pipeline_type)))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn list_results(
        &self,
        restrict_to: Option<&[String]>,
        record_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<Vec<String>> {
        // unknown names in restrict_to are simply not reported
        let candidates: Vec<ColumnSpec> = match restrict_to {
            Some(names) => names
                .iter()
                .filter_map(|name| self.column_spec(pipeline_type, name).cloned())
                .collect(),
            None => self.columns(pipeline_type).to_vec(),
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new("SELECT ");
        let mut separated = query.separated(", ");
        for spec in &candidates {
            separated.push(quoted(&spec.name));
        }
        query.push(format!(
            " FROM {} WHERE {} = ",
            self.table(pipeline_type),
            quoted(RECORD_ID_KEY)
        ));
        query.push_bind(record_identifier);
        let Some(row) = query.build().fetch_optional(&self.pool).await? else {
            return Ok(Vec::new());
        };
        Ok(candidates
            .iter()
            .filter(|spec| !value_from_row(&row, &spec.name, spec.column_type).is_null())
            .map(|spec| spec.name.clone())
            .collect())
    }

    async fn list_recent_results(
        &self,
        limit: u64,
        start: Option<&str>,
        end: Option<&str>,
        time_field: TimeField,
        pipeline_type: PipelineType,
    ) -> Result<Vec<RecentResult>> {
        let column = quoted(time_field.column());
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {}, {column} FROM {} WHERE {column} IS NOT NULL",
            quoted(RECORD_ID_KEY),
            self.table(pipeline_type),
        ));
        if let Some(upper) = start {
            query.push(format!(" AND {column} <= "));
            query.push_bind(upper.to_string());
        }
        if let Some(lower) = end {
            query.push(format!(" AND {column} >= "));
            query.push_bind(lower.to_string());
        }
        query.push(format!(" ORDER BY {column} DESC LIMIT "));
        query.push_bind(limit as i64);
        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| RecentResult {
                record_identifier: row.get::<String, _>(0),
                timestamp: row.get::<String, _>(1),
            })
            .collect())
    }

    async fn check_record_exists(
        &self,
        record_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<bool> {
        let found = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE {} = ?",
            self.table(pipeline_type),
            quoted(RECORD_ID_KEY)
        ))
        .bind(record_identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn set_status(
        &self,
        record_identifier: &str,
        status_identifier: &str,
        pipeline_type: PipelineType,
    ) -> Result<()> {
        assert_status_defined(&self.status_schema, status_identifier)?;
        let previous = self.fetch_status(record_identifier, pipeline_type).await?;
        let mut values = FieldMap::new();
        values.insert(
            STATUS_KEY.to_string(),
            JsonValue::String(status_identifier.to_string()),
        );
        self.report(record_identifier, values, pipeline_type, true)
            .await?;
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
        pipeline_type: PipelineType,
    ) -> Result<Option<String>> {
        self.fetch_status(record_identifier, pipeline_type).await
    }

    async fn clear_status(
        &self,
        record_identifier: &str,
        flag_names: Option<&[String]>,
        pipeline_type: PipelineType,
    ) -> Result<Vec<String>> {
        let Some(current) = self.fetch_status(record_identifier, pipeline_type).await? else {
            return Ok(Vec::new());
        };
        let clearable = match flag_names {
            Some(names) => names.iter().any(|name| *name == current),
            None => true,
        };
        if !clearable {
            return Ok(Vec::new());
        }
        sqlx::query(&format!(
            "UPDATE {} SET {} = NULL WHERE {} = ?",
            self.table(pipeline_type),
            quoted(STATUS_KEY),
            quoted(RECORD_ID_KEY),
        ))
        .bind(record_identifier)
        .execute(&self.pool)
        .await?;
        info!("Cleared status '{current}' for '{record_identifier}'");
        Ok(vec![current])
    }
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Bind a JSON value with the sqlite type matching its kind; arrays and
/// objects land as JSON text.
fn push_value(query: &mut QueryBuilder<'_, Sqlite>, value: &JsonValue) {
    match value {
        JsonValue::Null => {
            query.push_bind(Option::<String>::None);
        }
        JsonValue::Bool(flag) => {
            query.push_bind(*flag);
        }
        JsonValue::Number(number) => {
            if let Some(integer) = number.as_i64() {
                query.push_bind(integer);
            } else {
                query.push_bind(number.as_f64().unwrap_or_default());
            }
        }
        JsonValue::String(text) => {
            query.push_bind(text.clone());
        }
        other => {
            query.push_bind(other.to_string());
        }
    }
}

fn push_condition(query: &mut QueryBuilder<'_, Sqlite>, condition: &FilterCondition) {
    use crate::filter::FilterOp;

    let column = quoted(&condition.column);
    match (&condition.op, &condition.value) {
        (FilterOp::Eq, FilterValue::One(JsonValue::Null)) => {
            query.push(format!(" AND {column} IS NULL"));
        }
        (FilterOp::Eq, FilterValue::One(value)) => {
            query.push(format!(" AND {column} = "));
            push_value(query, value);
        }
        (FilterOp::Lt, FilterValue::One(value)) => {
            query.push(format!(" AND {column} < "));
            push_value(query, value);
        }
        (FilterOp::Ge, FilterValue::One(value)) => {
            query.push(format!(" AND {column} >= "));
            push_value(query, value);
        }
        (FilterOp::Like, FilterValue::One(value)) => {
            query.push(format!(" AND {column} LIKE "));
            push_value(query, value);
        }
        (FilterOp::In, FilterValue::Many(values)) => {
            if values.is_empty() {
                query.push(" AND 1 = 0");
                return;
            }
            query.push(format!(" AND {column} IN ("));
            let mut first = true;
            for value in values {
                if !first {
                    query.push(", ");
                }
                first = false;
                push_value(query, value);
            }
            query.push(")");
        }
        // FilterCondition::new never builds the remaining combinations
        _ => {
            query.push(" AND 1 = 0");
        }
    }
}

fn value_from_row(row: &SqliteRow, column: &str, column_type: ColumnType) -> JsonValue {
    match column_type {
        ColumnType::Integer => match row.try_get::<Option<i64>, _>(column) {
            Ok(Some(value)) => JsonValue::from(value),
            Ok(None) => JsonValue::Null,
            Err(_) => text_fallback(row, column),
        },
        ColumnType::Real => match row.try_get::<Option<f64>, _>(column) {
            Ok(Some(value)) => JsonValue::from(value),
            Ok(None) => JsonValue::Null,
            Err(_) => text_fallback(row, column),
        },
        ColumnType::Boolean => match row.try_get::<Option<bool>, _>(column) {
            Ok(Some(value)) => JsonValue::Bool(value),
            Ok(None) => JsonValue::Null,
            Err(_) => text_fallback(row, column),
        },
        ColumnType::Text => match row.try_get::<Option<String>, _>(column) {
            Ok(Some(value)) => JsonValue::String(value),
            Ok(None) => JsonValue::Null,
            Err(_) => JsonValue::Null,
        },
        ColumnType::Json => match row.try_get::<Option<String>, _>(column) {
            Ok(Some(text)) => {
                serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
            }
            Ok(None) => JsonValue::Null,
            Err(_) => JsonValue::Null,
        },
    }
}

fn text_fallback(row: &SqliteRow, column: &str) -> JsonValue {
    match row.try_get::<Option<String>, _>(column) {
        Ok(Some(value)) => JsonValue::String(value),
        _ => JsonValue::Null,
    }
}
