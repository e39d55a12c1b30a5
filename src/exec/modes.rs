//! Per-mode SQL generation for LOAD and CREATE TABLE AS steps.
//!
//! Handlers are chosen by `(step type, mode)` and emit plain SQL against the
//! engine. User-supplied values (time macros, watermark bounds) always bind
//! as parameters; identifiers were validated at plan time. On engines
//! without DML transactions the delete-window and merge patterns are
//! realized as stage → merge → single `CREATE OR REPLACE` swap, so readers
//! observe either the old table or the fully merged one.

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::scalar::ScalarValue;
use regex::Regex;
use tracing::{debug, info};

use crate::engine::{SqlEngine, SqlParams};
use crate::errors::{Result, SqlFlowError};
use crate::exec::evolve::{aligned_projection, evolve_target};
use crate::exec::watermark::WatermarkValue;
use crate::exec::StepContext;
use crate::plan::ExecutionStep;
use crate::state::WatermarkUpdate;
use crate::utils::parse_duration;

/// Named parameter carrying the delete-window lower bound.
const WINDOW_START_PARAM: &str = "sqlflow_window_start";

fn macro_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"@(start_date|end_date|start_dt|end_dt)\b").expect("static regex")
    })
}

/// Rewrite `@start_date` / `@end_date` / `@start_dt` / `@end_dt` macros into
/// engine placeholders (`$start_date`, ...). The values arrive via parameter
/// binding, never as spliced text.
pub fn rewrite_time_macros(sql: &str) -> String {
    macro_regex().replace_all(sql, "$$$1").into_owned()
}

/// The effective processing window for one step execution.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    /// Typed lower bound (watermark minus lookback); `None` on first runs.
    pub start: Option<WatermarkValue>,
    /// Lower bound as a timestamp for the `@start_*` macros; Unix epoch when
    /// there is no watermark or the cursor is not time-shaped.
    pub start_dt: DateTime<Utc>,
    pub end_dt: DateTime<Utc>,
}

impl TimeWindow {
    /// Full window: everything up to `now`. Used for non-incremental modes
    /// so a query written with time macros degrades to a full load.
    pub fn full(now: DateTime<Utc>) -> Self {
        Self {
            start: None,
            start_dt: DateTime::UNIX_EPOCH,
            end_dt: now,
        }
    }

    fn from_watermark(watermark: Option<WatermarkValue>, lookback: Option<&str>, now: DateTime<Utc>) -> Result<Self> {
        let lookback = match lookback {
            Some(raw) => Some(parse_duration(raw)?),
            None => None,
        };
        let start = watermark.map(|wm| match lookback {
            Some(d) => wm.minus(d),
            None => wm,
        });
        let start_dt = match &start {
            Some(WatermarkValue::Timestamp(ts)) => *ts,
            Some(WatermarkValue::Text(raw)) => DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(DateTime::UNIX_EPOCH),
            _ => DateTime::UNIX_EPOCH,
        };
        Ok(Self {
            start,
            start_dt,
            end_dt: now,
        })
    }

    /// The four time-macro parameters, bound for every generated statement.
    pub fn macro_params(&self) -> SqlParams {
        let date = |dt: &DateTime<Utc>| dt.format("%Y-%m-%d").to_string();
        let iso = |dt: &DateTime<Utc>| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        vec![
            ("start_date".to_string(), ScalarValue::Utf8(Some(date(&self.start_dt)))),
            ("end_date".to_string(), ScalarValue::Utf8(Some(date(&self.end_dt)))),
            ("start_dt".to_string(), ScalarValue::Utf8(Some(iso(&self.start_dt)))),
            ("end_dt".to_string(), ScalarValue::Utf8(Some(iso(&self.end_dt)))),
        ]
    }
}

fn stage_table(target: &str) -> String {
    format!("__sqlflow_stage_{target}")
}

fn merge_table(target: &str) -> String {
    format!("__sqlflow_merge_{target}")
}

/// Params for a statement: the time macros plus any extras. Binding unused
/// names is harmless; placeholders the statement lacks are simply not
/// replaced.
fn with_macros(window: &TimeWindow, extra: SqlParams) -> SqlParams {
    let mut params = window.macro_params();
    params.extend(extra);
    params
}

fn step_table(step: &ExecutionStep) -> Result<String> {
    step.meta_str("table")
        .map(str::to_string)
        .ok_or_else(|| SqlFlowError::Execution("transform step has no target table".into()))
}

fn step_sql(step: &ExecutionStep) -> Result<String> {
    step.sql()
        .map(rewrite_time_macros)
        .ok_or_else(|| SqlFlowError::Execution("step has no SQL payload".into()))
}

/// Execute a `CREATE TABLE ... AS` step. Returns the watermark advance for
/// INCREMENTAL mode (committed atomically with the task status).
pub async fn run_transform(
    ctx: &StepContext,
    step: &ExecutionStep,
) -> Result<Option<WatermarkUpdate>> {
    let target = step_table(step)?;
    let sql = step_sql(step)?;
    let engine = ctx.engine.as_ref();
    let now = Utc::now();
    let mode = step.mode.as_deref().unwrap_or("REPLACE");

    match mode {
        "REPLACE" => {
            let window = TimeWindow::full(now);
            engine
                .execute(
                    &format!("CREATE OR REPLACE TABLE {target} AS {sql}"),
                    with_macros(&window, Vec::new()),
                )
                .await?;
            Ok(None)
        }
        "APPEND" => {
            let window = TimeWindow::full(now);
            append_query(engine, &target, &sql, &window).await?;
            Ok(None)
        }
        "UPSERT" => {
            let keys = step
                .upsert_keys
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    SqlFlowError::Validation(format!("UPSERT on {target} requires KEY columns"))
                })?;
            let window = TimeWindow::full(now);
            let stage = stage_table(&target);
            engine
                .execute(
                    &format!("CREATE OR REPLACE TABLE {stage} AS {sql}"),
                    with_macros(&window, Vec::new()),
                )
                .await?;
            let outcome = upsert_from(engine, &target, &stage, &keys).await;
            engine.drop_table(&stage).await?;
            outcome?;
            Ok(None)
        }
        "INCREMENTAL" => {
            let column = step.time_column.clone().ok_or_else(|| {
                SqlFlowError::Validation(format!("INCREMENTAL on {target} requires BY <column>"))
            })?;
            incremental_from_query(ctx, &target, &sql, &column, step.lookback.as_deref(), now).await
        }
        other => Err(SqlFlowError::Planning(format!(
            "unknown transform mode {other:?}"
        ))),
    }
}

/// Execute a `LOAD target FROM source` step.
pub async fn run_load(ctx: &StepContext, step: &ExecutionStep) -> Result<()> {
    let source = step
        .query
        .get("source")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| SqlFlowError::Execution("load step has no source".into()))?
        .to_string();
    let target = step
        .query
        .get("target")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| SqlFlowError::Execution("load step has no target".into()))?
        .to_string();
    let engine = ctx.engine.as_ref();

    if !engine.table_exists(&source).await? {
        return Err(SqlFlowError::Execution(format!(
            "source table '{source}' does not exist in the engine"
        )));
    }

    // A source that read nothing on its first pull registers with an empty
    // schema; there is nothing to write.
    if engine.table_schema(&source).await?.fields().is_empty() {
        info!(%source, %target, "load skipped: source has no columns");
        return Ok(());
    }

    let mode = step.mode.as_deref().unwrap_or("REPLACE");
    debug!(%source, %target, mode, "load");
    match mode {
        "REPLACE" => {
            engine
                .execute(
                    &format!("CREATE OR REPLACE TABLE {target} AS SELECT * FROM {source}"),
                    Vec::new(),
                )
                .await?;
            Ok(())
        }
        "APPEND" => {
            if !engine.table_exists(&target).await? {
                engine
                    .execute(
                        &format!("CREATE TABLE {target} AS SELECT * FROM {source}"),
                        Vec::new(),
                    )
                    .await?;
                return Ok(());
            }
            if engine.count_rows(&source).await? == 0 {
                info!(%source, %target, "append skipped: source is empty");
                return Ok(());
            }
            let source_schema = engine.table_schema(&source).await?;
            let target_schema = evolve_target(engine, &target, &source_schema).await?;
            insert_aligned(engine, &target, &source, &target_schema, &source_schema).await
        }
        "UPSERT" => {
            let keys = step
                .upsert_keys
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    SqlFlowError::Validation(format!("UPSERT on {target} requires KEY columns"))
                })?;
            upsert_from(engine, &target, &source, &keys).await
        }
        other => Err(SqlFlowError::Planning(format!("unknown load mode {other:?}"))),
    }
}

/// APPEND for query-shaped input: materialize to a stage, evolve, insert.
async fn append_query(
    engine: &dyn SqlEngine,
    target: &str,
    sql: &str,
    window: &TimeWindow,
) -> Result<()> {
    if !engine.table_exists(target).await? {
        engine
            .execute(
                &format!("CREATE TABLE {target} AS {sql}"),
                with_macros(window, Vec::new()),
            )
            .await?;
        return Ok(());
    }
    let stage = stage_table(target);
    engine
        .execute(
            &format!("CREATE OR REPLACE TABLE {stage} AS {sql}"),
            with_macros(window, Vec::new()),
        )
        .await?;
    let result = async {
        if engine.count_rows(&stage).await? == 0 {
            return Ok(());
        }
        let stage_schema = engine.table_schema(&stage).await?;
        let target_schema = evolve_target(engine, target, &stage_schema).await?;
        insert_aligned(engine, target, &stage, &target_schema, &stage_schema).await
    }
    .await;
    engine.drop_table(&stage).await?;
    result
}

async fn insert_aligned(
    engine: &dyn SqlEngine,
    target: &str,
    source_rel: &str,
    target_schema: &SchemaRef,
    source_schema: &SchemaRef,
) -> Result<()> {
    let projection = aligned_projection(target_schema, source_schema, source_rel);
    engine
        .execute(
            &format!("INSERT INTO {target} SELECT {projection} FROM {source_rel}"),
            Vec::new(),
        )
        .await?;
    Ok(())
}

/// Merge `source_rel` into `target` by key columns: delete-then-insert
/// semantics realized as an anti-join plus union, swapped in atomically.
/// Non-key columns from the source overwrite target values.
async fn upsert_from(
    engine: &dyn SqlEngine,
    target: &str,
    source_rel: &str,
    keys: &[String],
) -> Result<()> {
    if engine.count_rows(source_rel).await? == 0 {
        info!(%target, "upsert skipped: source is empty");
        return Ok(());
    }

    let source_schema = engine.table_schema(source_rel).await?;
    for key in keys {
        if source_schema.field_with_name(key).is_err() {
            return Err(SqlFlowError::Schema(format!(
                "upsert key '{key}' is missing from the source of {target}"
            )));
        }
    }

    // The key must uniquely identify source rows; report before touching the
    // target.
    let key_list = keys.join(", ");
    let dup_count = engine
        .query_scalar(
            &format!(
                "SELECT COUNT(*) FROM (SELECT {key_list} FROM {source_rel} \
                 GROUP BY {key_list} HAVING COUNT(*) > 1) AS dup"
            ),
            Vec::new(),
        )
        .await?;
    if let Some(ScalarValue::Int64(Some(n))) = dup_count {
        if n > 0 {
            return Err(SqlFlowError::Schema(format!(
                "upsert key ({key_list}) is not unique in the source of {target}: {n} duplicated key value(s)"
            )));
        }
    }

    if !engine.table_exists(target).await? {
        engine
            .execute(
                &format!("CREATE TABLE {target} AS SELECT * FROM {source_rel}"),
                Vec::new(),
            )
            .await?;
        return Ok(());
    }

    let target_schema = evolve_target(engine, target, &source_schema).await?;
    let key_match = keys
        .iter()
        .map(|k| format!("s.{k} = tgt.{k}"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let kept = target_schema
        .fields()
        .iter()
        .map(|f| format!("tgt.{}", f.name()))
        .collect::<Vec<_>>()
        .join(", ");
    let incoming = aligned_projection(&target_schema, &source_schema, "s");

    let merged = merge_table(target);
    engine.begin_tx().await?;
    let result = async {
        engine
            .execute(
                &format!(
                    "CREATE OR REPLACE TABLE {merged} AS \
                     SELECT {kept} FROM {target} AS tgt \
                     WHERE NOT EXISTS (SELECT 1 FROM {source_rel} AS s WHERE {key_match}) \
                     UNION ALL \
                     SELECT {incoming} FROM {source_rel} AS s"
                ),
                Vec::new(),
            )
            .await?;
        engine
            .execute(
                &format!("CREATE OR REPLACE TABLE {target} AS SELECT * FROM {merged}"),
                Vec::new(),
            )
            .await
    }
    .await;
    match &result {
        Ok(_) => engine.commit_tx().await?,
        Err(_) => engine.rollback_tx().await?,
    }
    engine.drop_table(&merged).await?;
    result
}

/// INCREMENTAL BY <col> [LOOKBACK <d>]: stage the windowed query, replace
/// the target's window, and advance the watermark to the max cursor value
/// observed in the staged rows.
async fn incremental_from_query(
    ctx: &StepContext,
    target: &str,
    sql: &str,
    column: &str,
    lookback: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<WatermarkUpdate>> {
    let engine = ctx.engine.as_ref();
    let previous = ctx
        .watermarks
        .get(engine, &ctx.pipeline, target, column)
        .await?;
    let window = TimeWindow::from_watermark(previous.clone(), lookback, now)?;
    debug!(
        %target,
        column,
        window_start = %window.start_dt,
        "incremental window"
    );

    let stage = stage_table(target);
    engine
        .execute(
            &format!("CREATE OR REPLACE TABLE {stage} AS {sql}"),
            with_macros(&window, Vec::new()),
        )
        .await?;

    let result = async {
        let stage_schema = engine.table_schema(&stage).await?;
        if stage_schema.field_with_name(column).is_err() {
            return Err(SqlFlowError::Schema(format!(
                "cursor column '{column}' is missing from the query for {target}"
            )));
        }

        // Max cursor in the staged window; queried before the swap so the
        // advance reflects exactly the inserted rows.
        let observed = engine
            .query_scalar(&format!("SELECT MAX({column}) FROM {stage}"), Vec::new())
            .await?
            .as_ref()
            .and_then(WatermarkValue::from_scalar);

        if !engine.table_exists(target).await? {
            engine
                .execute(
                    &format!("CREATE TABLE {target} AS SELECT * FROM {stage}"),
                    Vec::new(),
                )
                .await?;
        } else {
            let target_schema = evolve_target(engine, target, &stage_schema).await?;
            let kept = target_schema
                .fields()
                .iter()
                .map(|f| format!("tgt.{}", f.name()))
                .collect::<Vec<_>>()
                .join(", ");
            let incoming = aligned_projection(&target_schema, &stage_schema, "s");
            let merged = merge_table(target);

            // Both sides are exclusive at the window start, matching the
            // `> @start_dt` filter the macros are designed for: a row exactly
            // at the boundary is kept, not reprocessed, so a zero-lookback
            // re-run neither loses nor duplicates it.
            let merge_sql = match &window.start {
                Some(_) => format!(
                    "CREATE OR REPLACE TABLE {merged} AS \
                     SELECT {kept} FROM {target} AS tgt WHERE tgt.{column} <= ${WINDOW_START_PARAM} \
                     UNION ALL \
                     SELECT {incoming} FROM {stage} AS s WHERE s.{column} > ${WINDOW_START_PARAM}"
                ),
                None => format!(
                    "CREATE OR REPLACE TABLE {merged} AS SELECT {incoming} FROM {stage} AS s"
                ),
            };
            let params = match &window.start {
                Some(ws) => vec![(WINDOW_START_PARAM.to_string(), ws.to_scalar())],
                None => Vec::new(),
            };
            engine.begin_tx().await?;
            let swap = async {
                engine.execute(&merge_sql, params).await?;
                engine
                    .execute(
                        &format!("CREATE OR REPLACE TABLE {target} AS SELECT * FROM {merged}"),
                        Vec::new(),
                    )
                    .await
            }
            .await;
            match &swap {
                Ok(_) => engine.commit_tx().await?,
                Err(_) => engine.rollback_tx().await?,
            }
            engine.drop_table(&merged).await?;
            swap?;
        }

        // Advance only forward; an all-late window never regresses the mark.
        let advance = match (&previous, &observed) {
            (_, None) => None,
            (None, Some(new)) => Some(new.clone()),
            (Some(old), Some(new)) if new.gt(old) => Some(new.clone()),
            _ => None,
        };
        Ok(advance.map(|value| WatermarkUpdate {
            pipeline: ctx.pipeline.clone(),
            table: target.to_string(),
            column: column.to_string(),
            value: value.to_json(),
        }))
    }
    .await;

    engine.drop_table(&stage).await?;
    result
}
