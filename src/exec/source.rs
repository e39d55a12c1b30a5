use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{Result, SqlFlowError};
use crate::exec::watermark::WatermarkValue;
use crate::exec::StepContext;
use crate::plan::ExecutionStep;
use crate::state::WatermarkUpdate;

/// Execute a SOURCE step: pull chunks from the connector and register them
/// in the engine under the source's name.
///
/// With a cursor field configured, reads are incremental from the stored
/// watermark and the registered table holds only the new rows; the watermark
/// advance rides on the task commit. Without one, the full object is
/// re-registered.
pub async fn run_source(
    ctx: &StepContext,
    step: &ExecutionStep,
) -> Result<Option<WatermarkUpdate>> {
    let name = step
        .meta_str("name")
        .ok_or_else(|| SqlFlowError::Execution("source step has no name".into()))?
        .to_string();
    let connector_type = step
        .query
        .get("connector_type")
        .and_then(Value::as_str)
        .ok_or_else(|| SqlFlowError::Execution("source step has no connector type".into()))?;
    let params = step
        .query
        .get("params")
        .cloned()
        .unwrap_or(Value::Null);
    let cursor = step.meta_str("cursor_field").map(str::to_string);

    let connector = ctx.connectors.get(connector_type)?;
    let engine = ctx.engine.as_ref();

    let previous = match &cursor {
        Some(col) => {
            ctx.watermarks
                .get(engine, &ctx.pipeline, &name, col)
                .await?
        }
        None => None,
    };

    let mut stream = match (&cursor, &previous) {
        (Some(col), _) => {
            debug!(source = %name, cursor = %col, has_watermark = previous.is_some(), "incremental read");
            connector
                .read_incremental(
                    &name,
                    col,
                    previous.as_ref().map(WatermarkValue::to_scalar),
                    &params,
                )
                .await?
        }
        _ => connector.read_all(&name, &params).await?,
    };

    let mut batches = Vec::new();
    while let Some(batch) = stream.next().await {
        batches.push(batch?);
    }

    let schema = match batches.first() {
        Some(batch) => batch.schema(),
        // Keep the object's shape even when nothing was read, so dependent
        // loads still see the right columns.
        None => connector.schema(&name, &params).await?,
    };
    let row_count: usize = batches.iter().map(|b| b.num_rows()).sum();
    engine.register_batches(&name, schema, batches, true).await?;
    info!(source = %name, rows = row_count, "source registered");

    let Some(col) = cursor else {
        return Ok(None);
    };
    if row_count == 0 {
        return Ok(None);
    }
    let observed = engine
        .query_scalar(&format!("SELECT MAX({col}) FROM {name}"), Vec::new())
        .await?
        .as_ref()
        .and_then(WatermarkValue::from_scalar);
    let advance = match (&previous, observed) {
        (_, None) => None,
        (None, Some(new)) => Some(new),
        (Some(old), Some(new)) if new.gt(old) => Some(new),
        _ => None,
    };
    Ok(advance.map(|value| WatermarkUpdate {
        pipeline: ctx.pipeline.clone(),
        table: name.clone(),
        column: col,
        value: value.to_json(),
    }))
}
