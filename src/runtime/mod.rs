//! The per-run runtime value: engine adapter, state backend, connector
//! registry, variable map, and executor options in one place. There is no
//! global state; callers build one `Runtime` per run (tests build one per
//! test).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use nanoid::nanoid;
use serde_json::json;
use tracing::{info, warn};

use crate::connector::ConnectorRegistry;
use crate::engine::{DataFusionEngine, SqlEngine};
use crate::errors::{Result, SqlFlowError};
use crate::exec::watermark::WatermarkStore;
use crate::exec::{execute_plan, ExecutorOptions, RunSummary, StepContext};
use crate::parser::ast::{Diagnostic, Severity};
use crate::parser::{parse_script, Pipeline};
use crate::plan::{build_plan, ExecutionPlan};
use crate::state::{MemoryStateBackend, RunRecord, RunStatus, StateBackend, TaskStatusRecord};
use crate::vars::VarContext;

/// Everything needed to parse, plan, and execute pipelines.
pub struct Runtime {
    engine: Arc<dyn SqlEngine>,
    state: Arc<dyn StateBackend>,
    connectors: ConnectorRegistry,
    vars: VarContext,
    options: ExecutorOptions,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// In-memory defaults: DataFusion engine, memory state, built-in
    /// connectors, `.env`-aware variables.
    pub fn new() -> Self {
        Self {
            engine: Arc::new(DataFusionEngine::new()),
            state: Arc::new(MemoryStateBackend::new()),
            connectors: ConnectorRegistry::with_builtins(),
            vars: VarContext::with_dotenv(),
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn SqlEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_state(mut self, state: Arc<dyn StateBackend>) -> Self {
        self.state = state;
        self
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn register_connector(
        mut self,
        type_name: impl Into<String>,
        connector: Arc<dyn crate::connector::Connector>,
    ) -> Self {
        self.connectors.register(type_name, connector);
        self
    }

    pub fn with_vars(mut self, vars: VarContext) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn engine(&self) -> &Arc<dyn SqlEngine> {
        &self.engine
    }

    pub fn state(&self) -> &Arc<dyn StateBackend> {
        &self.state
    }

    /// Parse and plan without executing. Returns the plan plus all
    /// diagnostics (parse + plan warnings). Any error diagnostic is fatal.
    pub fn plan_script(
        &self,
        text: &str,
        source: Option<&Path>,
    ) -> Result<(ExecutionPlan, Vec<Diagnostic>)> {
        let mut vars = self.vars.clone();
        let pipeline = parse_script(text, source, &mut vars);
        self.plan_pipeline(&pipeline, &vars)
    }

    fn plan_pipeline(
        &self,
        pipeline: &Pipeline,
        vars: &VarContext,
    ) -> Result<(ExecutionPlan, Vec<Diagnostic>)> {
        if pipeline.has_errors() {
            for diag in pipeline.errors() {
                warn!(%diag, "parse error");
            }
            let first = pipeline
                .errors()
                .next()
                .expect("has_errors implies at least one");
            return Err(SqlFlowError::Syntax {
                line: first.line.unwrap_or(0),
                column: first.column.unwrap_or(0),
                message: format!(
                    "{} ({} error(s) total)",
                    first.message,
                    pipeline.errors().count()
                ),
            });
        }

        let (plan, mut diagnostics) = build_plan(pipeline, vars)?;
        diagnostics.splice(0..0, pipeline.diagnostics.iter().cloned());
        for diag in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
            warn!(%diag, "pipeline warning");
        }
        Ok((plan, diagnostics))
    }

    /// Parse, plan, and execute a script.
    pub async fn run_script(&self, text: &str, source: Option<&Path>) -> Result<RunSummary> {
        let (plan, _) = self.plan_script(text, source)?;
        self.run_plan(plan, source).await
    }

    /// Run a script file from disk.
    pub async fn run_file(&self, path: &Path) -> Result<RunSummary> {
        let text = std::fs::read_to_string(path)?;
        self.run_script(&text, Some(path)).await
    }

    /// Execute an already-built plan as a fresh run.
    pub async fn run_plan(&self, plan: ExecutionPlan, source: Option<&Path>) -> Result<RunSummary> {
        let run_id = format!("run_{}", nanoid!(12));
        let run = RunRecord {
            run_id: run_id.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            plan_hash: plan.hash(),
            metadata: json!({
                "pipeline": plan.pipeline,
                "source_file": source.map(|p| p.display().to_string()),
            }),
        };
        self.state.create_run(&run, &plan).await?;
        info!(run_id = %run_id, pipeline = %plan.pipeline, steps = plan.steps.len(), "run started");

        self.execute(&plan, &run_id, HashMap::new()).await
    }

    /// Resume a previous run: load the persisted plan and task statuses and
    /// re-enter the scheduler under the same run id. Succeeded tasks are not
    /// re-run; the persisted plan is authoritative (plans are immutable once
    /// a run starts).
    pub async fn resume(&self, run_id: &str) -> Result<RunSummary> {
        let (run, plan, statuses) = self
            .state
            .load_run(run_id)
            .await?
            .ok_or_else(|| SqlFlowError::State(format!("run {run_id} not found")))?;
        if run.plan_hash != plan.hash() {
            return Err(SqlFlowError::State(format!(
                "stored plan for run {run_id} does not match its plan hash"
            )));
        }
        let initial: HashMap<String, TaskStatusRecord> = statuses
            .into_iter()
            .map(|s| (s.task_id.clone(), s))
            .collect();
        info!(run_id, pipeline = %plan.pipeline, "resuming run");

        self.execute(&plan, run_id, initial).await
    }

    async fn execute(
        &self,
        plan: &ExecutionPlan,
        run_id: &str,
        initial: HashMap<String, TaskStatusRecord>,
    ) -> Result<RunSummary> {
        let ctx = Arc::new(StepContext {
            pipeline: plan.pipeline.clone(),
            engine: Arc::clone(&self.engine),
            state: Arc::clone(&self.state),
            watermarks: Arc::new(WatermarkStore::new(Arc::clone(&self.state))),
            connectors: self.connectors.clone(),
        });

        let summary = execute_plan(ctx, plan, run_id, initial, &self.options).await?;
        self.state
            .finish_run(run_id, summary.status, Utc::now())
            .await?;
        Ok(summary)
    }

    /// Clear a stored watermark so the next INCREMENTAL run reloads from the
    /// beginning.
    pub async fn reset_watermark(&self, pipeline: &str, table: &str, column: &str) -> Result<()> {
        self.state.reset_watermark(pipeline, table, column).await
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        self.state.list_runs().await
    }
}
