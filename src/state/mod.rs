//! Durable run / task / watermark / plan store.
//!
//! Two implementations: [`MemoryStateBackend`] for tests and default runs,
//! and [`PostgresStateBackend`] for durable state. Everything a task commits
//! (status, watermark) goes through [`StateBackend::commit_task`] so the
//! backend can make it one atomic write.

pub mod memory;
pub mod postgres;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, SqlFlowError};
use crate::plan::ExecutionPlan;

pub use memory::MemoryStateBackend;
pub use postgres::PostgresStateBackend;

/// Task lifecycle states.
///
/// ```text
/// PENDING -> ELIGIBLE -> RUNNING -> SUCCESS
///                                -> FAILED  -> ELIGIBLE  (resume, transient)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Eligible,
    Running,
    Success,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Eligible => "ELIGIBLE",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskState {
    type Err = SqlFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "ELIGIBLE" => Ok(TaskState::Eligible),
            "RUNNING" => Ok(TaskState::Running),
            "SUCCESS" => Ok(TaskState::Success),
            "FAILED" => Ok(TaskState::Failed),
            other => Err(SqlFlowError::State(format!("unknown task state {other:?}"))),
        }
    }
}

/// Run lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RunStatus {
    type Err = SqlFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(SqlFlowError::State(format!("unknown run status {other:?}"))),
        }
    }
}

/// One pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub plan_hash: String,
    pub metadata: Value,
}

/// Status of one task within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: String,
    pub state: TaskState,
    pub attempt: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A watermark advance rider on a task commit.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkUpdate {
    pub pipeline: String,
    pub table: String,
    pub column: String,
    pub value: Value,
}

/// Everything a finishing task writes in one logical commit: its terminal
/// status plus any watermark advance.
#[derive(Debug, Clone)]
pub struct TaskCommit {
    pub status: TaskStatusRecord,
    pub watermark: Option<WatermarkUpdate>,
}

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Persist a new run and its immutable plan.
    async fn create_run(&self, run: &RunRecord, plan: &ExecutionPlan) -> Result<()>;

    /// Mark a run finished.
    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Upsert one task's status (non-terminal transitions).
    async fn set_task_state(&self, run_id: &str, status: &TaskStatusRecord) -> Result<()>;

    /// Atomically write a task's terminal status and watermark rider.
    async fn commit_task(&self, run_id: &str, commit: &TaskCommit) -> Result<()>;

    async fn get_watermark(
        &self,
        pipeline: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<Value>>;

    async fn update_watermark(&self, update: &WatermarkUpdate) -> Result<()>;

    async fn reset_watermark(&self, pipeline: &str, table: &str, column: &str) -> Result<()>;

    /// Load a run with its plan and task statuses. `None` if unknown.
    async fn load_run(
        &self,
        run_id: &str,
    ) -> Result<Option<(RunRecord, ExecutionPlan, Vec<TaskStatusRecord>)>>;

    /// All runs, most recent first.
    async fn list_runs(&self) -> Result<Vec<RunRecord>>;
}
