use std::sync::Arc;

use serde_json::{json, Value};
use sqlflow::connector::MemoryConnector;
use sqlflow::engine::SqlEngine;
use sqlflow::runtime::Runtime;
use sqlflow::state::TaskState;

async fn table_rows(runtime: &Runtime, sql: &str) -> Vec<Value> {
    let batches = runtime.engine().query(sql, Vec::new()).await.unwrap();
    batches
        .iter()
        .flat_map(|batch| serde_arrow::from_record_batch::<Vec<Value>>(batch).unwrap())
        .collect()
}

fn runtime_with_memory(tables: Vec<(&str, Vec<Value>)>) -> Runtime {
    let mut connector = MemoryConnector::new();
    for (name, rows) in tables {
        connector = connector.with_table(name, rows);
    }
    Runtime::new().register_connector("memory", Arc::new(connector))
}

// Scenario C: UPSERT replaces matching keys and inserts new rows.
#[tokio::test]
async fn load_upsert_merges_by_key() {
    let runtime = runtime_with_memory(vec![
        (
            "seed",
            vec![json!({"id": 1, "val": "x"}), json!({"id": 2, "val": "y"})],
        ),
        (
            "delta",
            vec![json!({"id": 2, "val": "Y"}), json!({"id": 3, "val": "z"})],
        ),
    ]);

    let summary = runtime
        .run_script("SOURCE seed TYPE memory PARAMS {};\nLOAD target FROM seed;", None)
        .await
        .unwrap();
    assert!(summary.succeeded(), "{:?}", summary.tasks);

    let summary = runtime
        .run_script(
            "SOURCE delta TYPE memory PARAMS {};\nLOAD target FROM delta MODE UPSERT KEY id;",
            None,
        )
        .await
        .unwrap();
    assert!(summary.succeeded(), "{:?}", summary.tasks);

    let rows = table_rows(&runtime, "SELECT id, val FROM target ORDER BY id").await;
    assert_eq!(
        rows,
        vec![
            json!({"id": 1, "val": "x"}),
            json!({"id": 2, "val": "Y"}),
            json!({"id": 3, "val": "z"}),
        ]
    );
}

#[tokio::test]
async fn transform_upsert_preserves_key_uniqueness() {
    let runtime = Runtime::new();
    runtime
        .run_script(
            "CREATE TABLE target AS SELECT * FROM (VALUES (1, 'x'), (2, 'y')) AS v(id, val);",
            None,
        )
        .await
        .unwrap();
    let summary = runtime
        .run_script(
            "CREATE TABLE target MODE UPSERT KEY id AS \
             SELECT * FROM (VALUES (2, 'Y'), (3, 'z')) AS v(id, val);",
            None,
        )
        .await
        .unwrap();
    assert!(summary.succeeded(), "{:?}", summary.tasks);

    let rows = table_rows(
        &runtime,
        "SELECT COUNT(DISTINCT id) AS uniq, COUNT(*) AS total FROM target",
    )
    .await;
    assert_eq!(rows, vec![json!({"uniq": 3, "total": 3})]);
}

#[tokio::test]
async fn upsert_with_empty_source_is_a_no_op() {
    let runtime = runtime_with_memory(vec![
        ("seed", vec![json!({"id": 1, "val": "x"})]),
        ("empty", vec![]),
    ]);
    runtime
        .run_script("SOURCE seed TYPE memory PARAMS {};\nLOAD target FROM seed;", None)
        .await
        .unwrap();

    let summary = runtime
        .run_script(
            "SOURCE empty TYPE memory PARAMS {};\nLOAD target FROM empty MODE UPSERT KEY id;",
            None,
        )
        .await
        .unwrap();
    assert!(summary.succeeded(), "{:?}", summary.tasks);

    let rows = table_rows(&runtime, "SELECT id, val FROM target").await;
    assert_eq!(rows, vec![json!({"id": 1, "val": "x"})]);
}

#[tokio::test]
async fn upsert_with_non_unique_key_fails_with_schema_error() {
    let runtime = runtime_with_memory(vec![
        ("seed", vec![json!({"id": 1, "val": "x"})]),
        (
            "dups",
            vec![json!({"id": 2, "val": "a"}), json!({"id": 2, "val": "b"})],
        ),
    ]);
    runtime
        .run_script("SOURCE seed TYPE memory PARAMS {};\nLOAD target FROM seed;", None)
        .await
        .unwrap();

    let summary = runtime
        .run_script(
            "SOURCE dups TYPE memory PARAMS {};\nLOAD target FROM dups MODE UPSERT KEY id;",
            None,
        )
        .await
        .unwrap();
    assert!(!summary.succeeded());
    let failed = summary
        .tasks
        .iter()
        .find(|t| t.state == TaskState::Failed)
        .expect("load task failed");
    let error = failed.error.as_deref().unwrap();
    assert!(error.starts_with("SCHEMA"), "{error}");
    assert!(error.contains("not unique"), "{error}");

    // target untouched by the failed merge
    let rows = table_rows(&runtime, "SELECT id FROM target").await;
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn append_creates_missing_target_then_appends() {
    let runtime = runtime_with_memory(vec![(
        "events",
        vec![json!({"id": 1}), json!({"id": 2})],
    )]);
    let script = "SOURCE events TYPE memory PARAMS {};\nLOAD sink FROM events MODE APPEND;";

    runtime.run_script(script, None).await.unwrap();
    let rows = table_rows(&runtime, "SELECT COUNT(*) AS n FROM sink").await;
    assert_eq!(rows, vec![json!({"n": 2})]);

    runtime.run_script(script, None).await.unwrap();
    let rows = table_rows(&runtime, "SELECT COUNT(*) AS n FROM sink").await;
    assert_eq!(rows, vec![json!({"n": 4})]);
}

#[tokio::test]
async fn append_evolves_schema_with_new_nullable_column() {
    let runtime = runtime_with_memory(vec![
        ("v1", vec![json!({"id": 1, "val": "x"})]),
        ("v2", vec![json!({"id": 2, "val": "y", "extra": "new"})]),
    ]);

    runtime
        .run_script("SOURCE v1 TYPE memory PARAMS {};\nLOAD t FROM v1;", None)
        .await
        .unwrap();
    let summary = runtime
        .run_script(
            "SOURCE v2 TYPE memory PARAMS {};\nLOAD t FROM v2 MODE APPEND;",
            None,
        )
        .await
        .unwrap();
    assert!(summary.succeeded(), "{:?}", summary.tasks);

    let rows = table_rows(&runtime, "SELECT id, val, extra FROM t ORDER BY id").await;
    assert_eq!(
        rows,
        vec![
            json!({"id": 1, "val": "x", "extra": null}),
            json!({"id": 2, "val": "y", "extra": "new"}),
        ]
    );
}

#[tokio::test]
async fn replace_rerun_is_idempotent() {
    let runtime = Runtime::new();
    let script = "CREATE TABLE t AS SELECT * FROM (VALUES (1), (2), (3)) AS v(n);";

    runtime.run_script(script, None).await.unwrap();
    let first = table_rows(&runtime, "SELECT n FROM t ORDER BY n").await;
    runtime.run_script(script, None).await.unwrap();
    let second = table_rows(&runtime, "SELECT n FROM t ORDER BY n").await;

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

#[tokio::test]
async fn transform_append_mode_accumulates_query_results() {
    let runtime = Runtime::new();
    let script = "CREATE TABLE log MODE APPEND AS SELECT 1 AS n;";
    runtime.run_script(script, None).await.unwrap();
    runtime.run_script(script, None).await.unwrap();
    let rows = table_rows(&runtime, "SELECT COUNT(*) AS n FROM log").await;
    assert_eq!(rows, vec![json!({"n": 2})]);
}
