use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use serde_json::{json, Value};
use sqlflow::connector::{ChunkStream, Connector, MemoryConnector};
use sqlflow::engine::SqlEngine;
use sqlflow::errors::{Result, SqlFlowError};
use sqlflow::exec::ExecutorOptions;
use sqlflow::runtime::Runtime;
use sqlflow::state::TaskState;

/// Wraps the memory connector and fails the first `failures` reads.
struct FlakyConnector {
    inner: MemoryConnector,
    remaining_failures: AtomicUsize,
}

impl FlakyConnector {
    fn new(inner: MemoryConnector, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
        }
    }

    fn trip(&self) -> Result<()> {
        let left = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if left {
            Err(SqlFlowError::Connector("transient upstream failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn read_all(&self, object: &str, params: &Value) -> Result<ChunkStream> {
        self.trip()?;
        self.inner.read_all(object, params).await
    }

    async fn schema(&self, object: &str, params: &Value) -> Result<SchemaRef> {
        self.inner.schema(object, params).await
    }
}

fn fast_retries(max_attempts: u32) -> ExecutorOptions {
    ExecutorOptions {
        max_attempts,
        backoff_base: std::time::Duration::from_millis(5),
        ..ExecutorOptions::default()
    }
}

#[tokio::test]
async fn transient_failure_is_retried_until_success() {
    let flaky = FlakyConnector::new(
        MemoryConnector::new().with_table("events", vec![json!({"id": 1})]),
        1,
    );
    let runtime = Runtime::new()
        .register_connector("memory", Arc::new(flaky))
        .with_options(fast_retries(3));

    let summary = runtime
        .run_script(
            "SOURCE events TYPE memory PARAMS {};\nLOAD sink FROM events;",
            None,
        )
        .await
        .unwrap();

    assert!(summary.succeeded(), "{:?}", summary.tasks);
    let source_task = summary
        .tasks
        .iter()
        .find(|t| t.task_id == "source_events")
        .unwrap();
    assert_eq!(source_task.attempts, 2);
}

#[tokio::test]
async fn exhausted_retries_fail_the_task_and_skip_descendants() {
    let flaky = FlakyConnector::new(
        MemoryConnector::new().with_table("events", vec![json!({"id": 1})]),
        usize::MAX,
    );
    let runtime = Runtime::new()
        .register_connector("memory", Arc::new(flaky))
        .with_options(fast_retries(2));

    let summary = runtime
        .run_script(
            "SOURCE events TYPE memory PARAMS {};\nLOAD sink FROM events;",
            None,
        )
        .await
        .unwrap();

    assert!(!summary.succeeded());
    let source_task = summary
        .tasks
        .iter()
        .find(|t| t.task_id == "source_events")
        .unwrap();
    assert_eq!(source_task.state, TaskState::Failed);
    assert_eq!(source_task.attempts, 2);
    assert_eq!(summary.skipped, vec!["load_sink".to_string()]);
}

// Scenario F: A succeeds, B fails; resume retries B without re-running A,
// then C runs and the run converges to success.
#[tokio::test]
async fn resume_retries_failed_tasks_and_keeps_success_sticky() {
    let runtime = Runtime::new();
    let script = "CREATE TABLE a AS SELECT 1 AS n;\n\
                  CREATE TABLE b AS SELECT a.n + ext.m AS s FROM a, ext;\n\
                  CREATE TABLE c AS SELECT * FROM b;";

    let summary = runtime.run_script(script, None).await.unwrap();
    assert!(!summary.succeeded());
    let state_of = |summary: &sqlflow::exec::RunSummary, id: &str| {
        summary
            .tasks
            .iter()
            .find(|t| t.task_id == id)
            .map(|t| (t.state, t.attempts))
            .unwrap()
    };
    assert_eq!(state_of(&summary, "transform_a").0, TaskState::Success);
    assert_eq!(state_of(&summary, "transform_b").0, TaskState::Failed);
    assert!(summary.skipped.contains(&"transform_c".to_string()));

    // Provide the missing collaborator table, then resume the same run.
    runtime
        .engine()
        .execute("CREATE TABLE ext AS SELECT 41 AS m", Vec::new())
        .await
        .unwrap();
    let resumed = runtime.resume(&summary.run_id).await.unwrap();

    assert!(resumed.succeeded(), "{:?}", resumed.tasks);
    assert_eq!(resumed.run_id, summary.run_id);
    // A was not re-executed: still on its first attempt.
    assert_eq!(state_of(&resumed, "transform_a"), (TaskState::Success, 1));
    // B ran again under the same run id.
    assert_eq!(state_of(&resumed, "transform_b"), (TaskState::Success, 2));
    assert_eq!(state_of(&resumed, "transform_c").0, TaskState::Success);

    let batches = runtime
        .engine()
        .query("SELECT s FROM c", Vec::new())
        .await
        .unwrap();
    let rows: Vec<Value> = batches
        .iter()
        .flat_map(|b| serde_arrow::from_record_batch::<Vec<Value>>(b).unwrap())
        .collect();
    assert_eq!(rows, vec![json!({"s": 42})]);
}

#[tokio::test]
async fn resume_of_unknown_run_is_a_state_error() {
    let runtime = Runtime::new();
    let err = runtime.resume("run_does_not_exist").await.unwrap_err();
    assert!(matches!(err, SqlFlowError::State(_)));
}

#[tokio::test]
async fn failure_stops_dispatch_of_downstream_tasks_only() {
    let runtime = Runtime::new().with_options(ExecutorOptions {
        max_parallelism: 1,
        ..ExecutorOptions::default()
    });
    let script = "CREATE TABLE broken AS SELECT * FROM missing_table;\n\
                  CREATE TABLE child AS SELECT * FROM broken;";
    let summary = runtime.run_script(script, None).await.unwrap();

    assert!(!summary.succeeded());
    assert_eq!(summary.skipped, vec!["transform_child".to_string()]);
}

#[tokio::test]
async fn independent_tasks_all_run_when_nothing_fails() {
    let runtime = Runtime::new().with_options(ExecutorOptions {
        max_parallelism: 4,
        ..ExecutorOptions::default()
    });
    let script = "CREATE TABLE t1 AS SELECT 1 AS n;\n\
                  CREATE TABLE t2 AS SELECT 2 AS n;\n\
                  CREATE TABLE t3 AS SELECT 3 AS n;\n\
                  CREATE TABLE total AS SELECT * FROM t1 UNION ALL SELECT * FROM t2 UNION ALL SELECT * FROM t3;";
    let summary = runtime.run_script(script, None).await.unwrap();
    assert!(summary.succeeded(), "{:?}", summary.tasks);

    let batches = runtime
        .engine()
        .query("SELECT COUNT(*) AS n FROM total", Vec::new())
        .await
        .unwrap();
    let rows: Vec<Value> = batches
        .iter()
        .flat_map(|b| serde_arrow::from_record_batch::<Vec<Value>>(b).unwrap())
        .collect();
    assert_eq!(rows, vec![json!({"n": 3})]);
}

#[tokio::test]
async fn task_timeout_fails_the_task_with_cancellation() {
    let flaky = SlowConnector;
    let runtime = Runtime::new()
        .register_connector("slow", Arc::new(flaky))
        .with_options(ExecutorOptions {
            task_timeout: Some(std::time::Duration::from_millis(50)),
            ..ExecutorOptions::default()
        });

    let summary = runtime
        .run_script("SOURCE s TYPE slow PARAMS {};", None)
        .await
        .unwrap();
    assert!(!summary.succeeded());
    let task = &summary.tasks[0];
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.error.as_deref().unwrap().starts_with("CANCELLED"));
}

struct SlowConnector;

#[async_trait]
impl Connector for SlowConnector {
    async fn read_all(&self, _object: &str, _params: &Value) -> Result<ChunkStream> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Err(SqlFlowError::Connector("unreachable".into()))
    }

    async fn schema(&self, _object: &str, _params: &Value) -> Result<SchemaRef> {
        Ok(Arc::new(datafusion::arrow::datatypes::Schema::empty()))
    }
}
