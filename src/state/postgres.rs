use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::errors::{Result, SqlFlowError};
use crate::plan::ExecutionPlan;
use crate::state::{
    RunRecord, RunStatus, StateBackend, TaskCommit, TaskStatusRecord, WatermarkUpdate,
};

/// Schema for the state tables, namespaced `sqlflow_` so they can live in a
/// database that also hosts analytics tables.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sqlflow_runs (
        run_id     TEXT PRIMARY KEY,
        status     TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        ended_at   TIMESTAMPTZ,
        plan_hash  TEXT NOT NULL,
        metadata   JSONB NOT NULL DEFAULT '{}'::jsonb
    )",
    "CREATE TABLE IF NOT EXISTS sqlflow_plans (
        run_id    TEXT PRIMARY KEY REFERENCES sqlflow_runs(run_id),
        plan_json JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sqlflow_task_statuses (
        run_id     TEXT NOT NULL REFERENCES sqlflow_runs(run_id),
        task_id    TEXT NOT NULL,
        state      TEXT NOT NULL,
        attempt    INTEGER NOT NULL DEFAULT 0,
        error      TEXT,
        started_at TIMESTAMPTZ,
        ended_at   TIMESTAMPTZ,
        PRIMARY KEY (run_id, task_id)
    )",
    "CREATE TABLE IF NOT EXISTS sqlflow_watermarks (
        pipeline    TEXT NOT NULL,
        table_name  TEXT NOT NULL,
        column_name TEXT NOT NULL,
        value       JSONB NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (pipeline, table_name, column_name)
    )",
];

/// Postgres-backed state store. One short-lived transaction per logical
/// commit; no transactions held across task boundaries.
pub struct PostgresStateBackend {
    pool: PgPool,
}

impl PostgresStateBackend {
    /// Connect and apply the state schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        for ddl in MIGRATIONS {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_run(row: &PgRow) -> Result<RunRecord> {
        Ok(RunRecord {
            run_id: row.try_get("run_id")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            plan_hash: row.try_get("plan_hash")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn row_to_task(row: &PgRow) -> Result<TaskStatusRecord> {
        Ok(TaskStatusRecord {
            task_id: row.try_get("task_id")?,
            state: row.try_get::<String, _>("state")?.parse()?,
            attempt: row.try_get::<i32, _>("attempt")? as u32,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }
}

#[async_trait]
impl StateBackend for PostgresStateBackend {
    async fn create_run(&self, run: &RunRecord, plan: &ExecutionPlan) -> Result<()> {
        let plan_json = serde_json::to_value(plan)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO sqlflow_runs (run_id, status, started_at, ended_at, plan_hash, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&run.run_id)
        .bind(run.status.to_string())
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(&run.plan_hash)
        .bind(&run.metadata)
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO sqlflow_plans (run_id, plan_json) VALUES ($1, $2)")
            .bind(&run.run_id)
            .bind(plan_json)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let rows = sqlx::query("UPDATE sqlflow_runs SET status = $2, ended_at = $3 WHERE run_id = $1")
            .bind(run_id)
            .bind(status.to_string())
            .bind(ended_at)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(SqlFlowError::State(format!("run {run_id} not found")));
        }
        Ok(())
    }

    async fn set_task_state(&self, run_id: &str, status: &TaskStatusRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sqlflow_task_statuses \
               (run_id, task_id, state, attempt, error, started_at, ended_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (run_id, task_id) DO UPDATE SET \
               state = EXCLUDED.state, attempt = EXCLUDED.attempt, \
               error = EXCLUDED.error, started_at = EXCLUDED.started_at, \
               ended_at = EXCLUDED.ended_at",
        )
        .bind(run_id)
        .bind(&status.task_id)
        .bind(status.state.to_string())
        .bind(status.attempt as i32)
        .bind(&status.error)
        .bind(status.started_at)
        .bind(status.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_task(&self, run_id: &str, commit: &TaskCommit) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let status = &commit.status;
        sqlx::query(
            "INSERT INTO sqlflow_task_statuses \
               (run_id, task_id, state, attempt, error, started_at, ended_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (run_id, task_id) DO UPDATE SET \
               state = EXCLUDED.state, attempt = EXCLUDED.attempt, \
               error = EXCLUDED.error, started_at = EXCLUDED.started_at, \
               ended_at = EXCLUDED.ended_at",
        )
        .bind(run_id)
        .bind(&status.task_id)
        .bind(status.state.to_string())
        .bind(status.attempt as i32)
        .bind(&status.error)
        .bind(status.started_at)
        .bind(status.ended_at)
        .execute(&mut *tx)
        .await?;

        if let Some(wm) = &commit.watermark {
            sqlx::query(
                "INSERT INTO sqlflow_watermarks (pipeline, table_name, column_name, value, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (pipeline, table_name, column_name) DO UPDATE SET \
                   value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
            )
            .bind(&wm.pipeline)
            .bind(&wm.table)
            .bind(&wm.column)
            .bind(&wm.value)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_watermark(
        &self,
        pipeline: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<Value>> {
        let row = sqlx::query(
            "SELECT value FROM sqlflow_watermarks \
             WHERE pipeline = $1 AND table_name = $2 AND column_name = $3",
        )
        .bind(pipeline)
        .bind(table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn update_watermark(&self, update: &WatermarkUpdate) -> Result<()> {
        sqlx::query(
            "INSERT INTO sqlflow_watermarks (pipeline, table_name, column_name, value, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (pipeline, table_name, column_name) DO UPDATE SET \
               value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .bind(&update.pipeline)
        .bind(&update.table)
        .bind(&update.column)
        .bind(&update.value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_watermark(&self, pipeline: &str, table: &str, column: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM sqlflow_watermarks \
             WHERE pipeline = $1 AND table_name = $2 AND column_name = $3",
        )
        .bind(pipeline)
        .bind(table)
        .bind(column)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run(
        &self,
        run_id: &str,
    ) -> Result<Option<(RunRecord, ExecutionPlan, Vec<TaskStatusRecord>)>> {
        let Some(run_row) = sqlx::query("SELECT * FROM sqlflow_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let run = Self::row_to_run(&run_row)?;

        let plan_row = sqlx::query("SELECT plan_json FROM sqlflow_plans WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        let plan_json: Value = plan_row.try_get("plan_json")?;
        let plan: ExecutionPlan = serde_json::from_value(plan_json)?;

        let task_rows = sqlx::query(
            "SELECT * FROM sqlflow_task_statuses WHERE run_id = $1 ORDER BY task_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let tasks = task_rows
            .iter()
            .map(Self::row_to_task)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some((run, plan, tasks)))
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT * FROM sqlflow_runs ORDER BY started_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_run).collect()
    }
}
