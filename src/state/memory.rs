use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

use crate::errors::{Result, SqlFlowError};
use crate::plan::ExecutionPlan;
use crate::state::{
    RunRecord, RunStatus, StateBackend, TaskCommit, TaskStatusRecord, WatermarkUpdate,
};

#[derive(Default)]
struct Inner {
    runs: IndexMap<String, RunRecord>,
    plans: HashMap<String, ExecutionPlan>,
    tasks: HashMap<String, IndexMap<String, TaskStatusRecord>>,
    watermarks: HashMap<(String, String, String), (Value, DateTime<Utc>)>,
}

/// In-memory state backend. The default for ad-hoc runs and the contract
/// reference for tests; state lives only as long as the process.
#[derive(Default)]
pub struct MemoryStateBackend {
    inner: Mutex<Inner>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("state mutex poisoned")
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn create_run(&self, run: &RunRecord, plan: &ExecutionPlan) -> Result<()> {
        let mut inner = self.lock();
        if inner.runs.contains_key(&run.run_id) {
            return Err(SqlFlowError::State(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        inner.runs.insert(run.run_id.clone(), run.clone());
        inner.plans.insert(run.run_id.clone(), plan.clone());
        inner.tasks.insert(run.run_id.clone(), IndexMap::new());
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| SqlFlowError::State(format!("run {run_id} not found")))?;
        run.status = status;
        run.ended_at = Some(ended_at);
        Ok(())
    }

    async fn set_task_state(&self, run_id: &str, status: &TaskStatusRecord) -> Result<()> {
        let mut inner = self.lock();
        let tasks = inner
            .tasks
            .get_mut(run_id)
            .ok_or_else(|| SqlFlowError::State(format!("run {run_id} not found")))?;
        tasks.insert(status.task_id.clone(), status.clone());
        Ok(())
    }

    async fn commit_task(&self, run_id: &str, commit: &TaskCommit) -> Result<()> {
        // Single mutex guard covers both writes, matching the atomic-commit
        // guarantee of the durable backend.
        let mut inner = self.lock();
        let tasks = inner
            .tasks
            .get_mut(run_id)
            .ok_or_else(|| SqlFlowError::State(format!("run {run_id} not found")))?;
        tasks.insert(commit.status.task_id.clone(), commit.status.clone());
        if let Some(wm) = &commit.watermark {
            inner.watermarks.insert(
                (wm.pipeline.clone(), wm.table.clone(), wm.column.clone()),
                (wm.value.clone(), Utc::now()),
            );
        }
        Ok(())
    }

    async fn get_watermark(
        &self,
        pipeline: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<Value>> {
        let inner = self.lock();
        Ok(inner
            .watermarks
            .get(&(pipeline.to_string(), table.to_string(), column.to_string()))
            .map(|(v, _)| v.clone()))
    }

    async fn update_watermark(&self, update: &WatermarkUpdate) -> Result<()> {
        let mut inner = self.lock();
        inner.watermarks.insert(
            (
                update.pipeline.clone(),
                update.table.clone(),
                update.column.clone(),
            ),
            (update.value.clone(), Utc::now()),
        );
        Ok(())
    }

    async fn reset_watermark(&self, pipeline: &str, table: &str, column: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .watermarks
            .remove(&(pipeline.to_string(), table.to_string(), column.to_string()));
        Ok(())
    }

    async fn load_run(
        &self,
        run_id: &str,
    ) -> Result<Option<(RunRecord, ExecutionPlan, Vec<TaskStatusRecord>)>> {
        let inner = self.lock();
        let Some(run) = inner.runs.get(run_id) else {
            return Ok(None);
        };
        let plan = inner
            .plans
            .get(run_id)
            .ok_or_else(|| SqlFlowError::State(format!("run {run_id} has no stored plan")))?;
        let tasks = inner
            .tasks
            .get(run_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        Ok(Some((run.clone(), plan.clone(), tasks)))
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let inner = self.lock();
        let mut runs: Vec<RunRecord> = inner.runs.values().cloned().collect();
        runs.reverse();
        Ok(runs)
    }
}
