//! End-to-end checks through the manager, run against both backends.

use std::path::Path;

use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;

use xylem_schema::FieldMap;
use xylem_store::{
    DatabaseConfig, FilterCondition, ResultsManager, StoreConfig, StoreError,
};

const SCHEMA: &str = "\
pipeline_name: test_pipeline
samples:
  items:
    properties:
      number_of_things:
        type: integer
        description: number of things
      name_of_something:
        type: string
        description: name of something
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
        ..StoreConfig::default()
    };
    ResultsManager::new(config).await.unwrap()
}

async fn db_manager(dir: &Path) -> ResultsManager {
    let config = StoreConfig {
        schema_path: Some(write_schema(dir)),
        database: Some(DatabaseConfig {
            dialect: "sqlite".to_string(),
            name: Some(dir.join("results.db").display().to_string()),
            host: None,
            port: None,
            user: None,
            password: None,
        }),
        database_only: true,
        ..StoreConfig::default()
    };
    ResultsManager::new(config).await.unwrap()
}

/// One manager per backend, each over its own state directory.
async fn both_backends() -> Vec<(TempDir, ResultsManager)> {
    let file_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let file = file_manager(file_dir.path()).await;
    let db = db_manager(db_dir.path()).await;
    vec![(file_dir, file), (db_dir, db)]
}

fn one_field(name: &str, value: JsonValue) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(name.to_string(), value);
    fields
}

#[tokio::test]
async fn report_then_retrieve_round_trips() {
    for (_dir, manager) in both_backends().await {
        manager
            .report(one_field("number_of_things", json!(5)), Some("sample1"), false, false)
            .await
            .unwrap()
            .unwrap();
        let value = manager
            .retrieve(Some("sample1"), Some("number_of_things"))
            .await
            .unwrap();
        assert_eq!(value, json!(5), "{} backend", manager.backend_kind());
        let all = manager.retrieve(Some("sample1"), None).await.unwrap();
        assert_eq!(all, json!({"number_of_things": 5}));
    }
}

#[tokio::test]
async fn overwrite_requires_force() {
    for (_dir, manager) in both_backends().await {
        manager
            .report(one_field("number_of_things", json!(5)), Some("sample1"), false, false)
            .await
            .unwrap()
            .unwrap();
        let gated = manager
            .report(one_field("number_of_things", json!(6)), Some("sample1"), false, false)
            .await
            .unwrap();
        assert!(gated.is_none(), "{} backend", manager.backend_kind());
        assert_eq!(
            manager
                .retrieve(Some("sample1"), Some("number_of_things"))
                .await
                .unwrap(),
            json!(5)
        );
        manager
            .report(one_field("number_of_things", json!(7)), Some("sample1"), true, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            manager
                .retrieve(Some("sample1"), Some("number_of_things"))
                .await
                .unwrap(),
            json!(7)
        );
    }
}

#[tokio::test]
async fn status_changes_replace_each_other() {
    for (_dir, manager) in both_backends().await {
        manager.set_status(Some("sample1"), "running").await.unwrap();
        assert_eq!(
            manager.get_status(Some("sample1")).await.unwrap().as_deref(),
            Some("running")
        );
        manager.set_status(Some("sample1"), "completed").await.unwrap();
        assert_eq!(
            manager.get_status(Some("sample1")).await.unwrap().as_deref(),
            Some("completed"),
            "{} backend",
            manager.backend_kind()
        );
    }
}

#[tokio::test]
async fn removing_the_only_result_drops_the_record_from_listings() {
    for (_dir, manager) in both_backends().await {
        manager
            .report(one_field("number_of_things", json!(5)), Some("sample1"), false, false)
            .await
            .unwrap()
            .unwrap();
        assert!(manager
            .remove(Some("sample1"), Some("number_of_things"))
            .await
            .unwrap());
        assert!(!manager.check_record_exists(Some("sample1")).await.unwrap());
        let page = manager.get_records(100, 0).await.unwrap();
        assert!(page.records.is_empty(), "{} backend", manager.backend_kind());
        assert_eq!(manager.list_results(None, Some("sample1")).await.unwrap(), Vec::<String>::new());
    }
}

#[tokio::test]
async fn partial_removal_keeps_the_rest_of_the_record() {
    for (_dir, manager) in both_backends().await {
        let mut fields = FieldMap::new();
        fields.insert("number_of_things".to_string(), json!(5));
        fields.insert("name_of_something".to_string(), json!("thing"));
        manager
            .report(fields, Some("sample1"), false, false)
            .await
            .unwrap()
            .unwrap();
        assert!(manager
            .remove(Some("sample1"), Some("name_of_something"))
            .await
            .unwrap());
        assert!(manager.check_record_exists(Some("sample1")).await.unwrap());
        assert_eq!(
            manager.list_results(None, Some("sample1")).await.unwrap(),
            vec!["number_of_things".to_string()],
            "{} backend",
            manager.backend_kind()
        );
    }
}

#[tokio::test]
async fn select_returns_the_matching_record() {
    for (_dir, manager) in both_backends().await {
        for (record, count) in [("sample1", 7), ("sample2", 9)] {
            manager
                .report(one_field("number_of_things", json!(count)), Some(record), false, false)
                .await
                .unwrap()
                .unwrap();
        }
        let rows = manager
            .select(
                None,
                &[FilterCondition::new("number_of_things", "eq", json!(7)).unwrap()],
                &[],
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1, "{} backend", manager.backend_kind());
        assert_eq!(rows[0].get("record_identifier"), Some(&json!("sample1")));
        assert_eq!(rows[0].get("number_of_things"), Some(&json!(7)));
    }
}

#[tokio::test]
async fn unknown_results_leave_the_record_untouched() {
    for (_dir, manager) in both_backends().await {
        manager
            .report(one_field("number_of_things", json!(5)), Some("sample1"), false, false)
            .await
            .unwrap()
            .unwrap();
        let before = manager.retrieve(Some("sample1"), None).await.unwrap();
        let mut fields = FieldMap::new();
        fields.insert("name_of_something".to_string(), json!("ok"));
        fields.insert("not_in_schema".to_string(), json!(1));
        let err = manager
            .report(fields, Some("sample1"), false, false)
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::UnknownResult { .. }),
            "{} backend",
            manager.backend_kind()
        );
        let after = manager.retrieve(Some("sample1"), None).await.unwrap();
        assert_eq!(before, after);
    }
}

#[tokio::test]
async fn bookkeeping_timestamps_are_not_retrievable_results() {
    for (_dir, manager) in both_backends().await {
        manager
            .report(one_field("number_of_things", json!(5)), Some("sample1"), false, false)
            .await
            .unwrap()
            .unwrap();
        let err = manager
            .retrieve(Some("sample1"), Some("created_time"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::ResultNotFound { .. }),
            "{} backend",
            manager.backend_kind()
        );
        let restrict = ["modified_time".to_string(), "number_of_things".to_string()];
        assert_eq!(
            manager
                .list_results(Some(&restrict), Some("sample1"))
                .await
                .unwrap(),
            vec!["number_of_things".to_string()],
            "{} backend",
            manager.backend_kind()
        );
    }
}

#[tokio::test]
async fn reopening_the_results_file_reads_back_the_same_records() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path()).await;
    for (record, count) in [("sample1", 1), ("sample2", 2)] {
        manager
            .report(one_field("number_of_things", json!(count)), Some(record), false, false)
            .await
            .unwrap()
            .unwrap();
    }
    let first = manager.select(None, &[], &[], None, None).await.unwrap();
    // repeated reads with no intervening writes see identical data
    let again = manager.select(None, &[], &[], None, None).await.unwrap();
    assert_eq!(first, again);

    let reopened = file_manager(dir.path()).await;
    let rows = reopened.select(None, &[], &[], None, None).await.unwrap();
    assert_eq!(first, rows);
    assert_eq!(reopened.get_records(100, 0).await.unwrap().records, vec![
        "sample1".to_string(),
        "sample2".to_string()
    ]);
}

#[tokio::test]
async fn interleaved_writers_on_one_file_keep_each_others_records() {
    let dir = tempfile::tempdir().unwrap();
    let first = file_manager(dir.path()).await;
    let second = file_manager(dir.path()).await;
    first
        .report(one_field("number_of_things", json!(1)), Some("writer1_a"), false, false)
        .await
        .unwrap()
        .unwrap();
    second
        .report(one_field("number_of_things", json!(2)), Some("writer2_a"), false, false)
        .await
        .unwrap()
        .unwrap();
    first
        .report(one_field("number_of_things", json!(3)), Some("writer1_b"), false, false)
        .await
        .unwrap()
        .unwrap();

    let expected = vec![
        "writer1_a".to_string(),
        "writer1_b".to_string(),
        "writer2_a".to_string(),
    ];
    for manager in [&first, &second] {
        let page = manager.get_records(100, 0).await.unwrap();
        assert_eq!(page.records, expected);
        assert_eq!(page.count, 3);
    }
    assert_eq!(
        second
            .retrieve(Some("writer1_b"), Some("number_of_things"))
            .await
            .unwrap(),
        json!(3)
    );
}

#[tokio::test]
async fn a_store_refuses_a_different_namespace() {
    // file backend
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path()).await;
    manager
        .report(one_field("number_of_things", json!(1)), Some("sample1"), false, false)
        .await
        .unwrap()
        .unwrap();
    drop(manager);
    let config = StoreConfig {
        schema_path: Some(write_schema(dir.path())),
        results_file_path: Some(dir.path().join("results.yaml")),
        namespace: Some("other_pipeline".to_string()),
        ..StoreConfig::default()
    };
    let err = ResultsManager::new(config).await.err().unwrap();
    assert!(matches!(err, StoreError::FileInUse { .. }));

    // database backend
    let dir = tempfile::tempdir().unwrap();
    let _manager = db_manager(dir.path()).await;
    let config = StoreConfig {
        schema_path: Some(write_schema(dir.path())),
        namespace: Some("other_pipeline".to_string()),
        database: Some(DatabaseConfig {
            dialect: "sqlite".to_string(),
            name: Some(dir.path().join("results.db").display().to_string()),
            host: None,
            port: None,
            user: None,
            password: None,
        }),
        database_only: true,
        ..StoreConfig::default()
    };
    let err = ResultsManager::new(config).await.err().unwrap();
    assert!(matches!(err, StoreError::FileInUse { .. }));
}
