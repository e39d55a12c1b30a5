//! Postgres state backend tests. These need a live database and are ignored
//! by default; point `SQLFLOW_TEST_STATE_URL` at a scratch Postgres and run
//! `cargo test -- --ignored` to exercise them.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sqlflow::plan::ExecutionPlan;
use sqlflow::state::{
    PostgresStateBackend, RunRecord, RunStatus, StateBackend, TaskCommit, TaskState,
    TaskStatusRecord, WatermarkUpdate,
};

fn test_url() -> Option<String> {
    std::env::var("SQLFLOW_TEST_STATE_URL").ok()
}

fn run(id: &str) -> RunRecord {
    RunRecord {
        run_id: id.to_string(),
        status: RunStatus::Running,
        started_at: Utc::now(),
        ended_at: None,
        plan_hash: "deadbeef".to_string(),
        metadata: json!({"pipeline": "pg_test"}),
    }
}

#[tokio::test]
#[ignore = "requires SQLFLOW_TEST_STATE_URL"]
async fn postgres_round_trips_runs_tasks_and_watermarks() -> Result<()> {
    let url = test_url().expect("SQLFLOW_TEST_STATE_URL must be set for ignored tests");
    let state = PostgresStateBackend::connect(&url).await?;

    let run_id = format!("run_pg_{}", Utc::now().timestamp_nanos_opt().unwrap());
    let plan = ExecutionPlan {
        pipeline: "pg_test".to_string(),
        steps: Vec::new(),
    };
    state.create_run(&run(&run_id), &plan).await?;

    let commit = TaskCommit {
        status: TaskStatusRecord {
            task_id: "transform_t".to_string(),
            state: TaskState::Success,
            attempt: 1,
            error: None,
            started_at: Some(Utc::now()),
            ended_at: Some(Utc::now()),
        },
        watermark: Some(WatermarkUpdate {
            pipeline: "pg_test".to_string(),
            table: "t".to_string(),
            column: "ts".to_string(),
            value: json!({"type": "int", "value": 7}),
        }),
    };
    state.commit_task(&run_id, &commit).await?;
    state
        .finish_run(&run_id, RunStatus::Success, Utc::now())
        .await?;

    let (loaded, loaded_plan, tasks) = state.load_run(&run_id).await?.expect("run exists");
    assert_eq!(loaded.status, RunStatus::Success);
    assert_eq!(loaded_plan, plan);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Success);

    let wm = state.get_watermark("pg_test", "t", "ts").await?;
    assert_eq!(wm, Some(json!({"type": "int", "value": 7})));

    state.reset_watermark("pg_test", "t", "ts").await?;
    assert!(state.get_watermark("pg_test", "t", "ts").await?.is_none());
    Ok(())
}
