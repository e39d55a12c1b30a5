use std::fs::File;
use std::path::Path;

use datafusion::arrow::csv::WriterBuilder as CsvWriterBuilder;
use datafusion::arrow::json::LineDelimitedWriter;
use datafusion::parquet::arrow::ArrowWriter;
use serde_json::Value;
use tracing::info;

use crate::errors::{Result, SqlFlowError};
use crate::exec::modes::{rewrite_time_macros, TimeWindow};
use crate::exec::StepContext;
use crate::plan::ExecutionStep;

/// Execute an EXPORT step: run the query and write the result to the
/// destination URI in the requested format (csv, jsonl, parquet).
pub async fn run_export(ctx: &StepContext, step: &ExecutionStep) -> Result<()> {
    let sql = step
        .sql()
        .map(rewrite_time_macros)
        .ok_or_else(|| SqlFlowError::Execution("export step has no query".into()))?;
    let destination = step
        .meta_str("destination")
        .ok_or_else(|| SqlFlowError::Execution("export step has no destination".into()))?
        .to_string();
    let format = step
        .meta_str("format")
        .unwrap_or("csv")
        .to_ascii_lowercase();
    let options = step
        .metadata
        .get("options")
        .cloned()
        .unwrap_or(Value::Null);

    let window = TimeWindow::full(chrono::Utc::now());
    let batches = ctx
        .engine
        .query(&sql, window.macro_params())
        .await?;
    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();

    let path = Path::new(&destination);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;

    match format.as_str() {
        "csv" => write_csv(file, &batches, &options)?,
        "json" | "jsonl" => write_jsonl(file, &batches)?,
        "parquet" => write_parquet(file, &batches)?,
        other => {
            return Err(SqlFlowError::Validation(format!(
                "unsupported export format {other:?}"
            )))
        }
    }

    info!(destination = %destination, format = %format, rows, "export written");
    Ok(())
}

fn write_csv(
    file: File,
    batches: &[datafusion::arrow::record_batch::RecordBatch],
    options: &Value,
) -> Result<()> {
    let header = options
        .get("header")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let mut builder = CsvWriterBuilder::new().with_header(header);
    if let Some(delim) = options.get("delimiter").and_then(Value::as_str) {
        let byte = delim.as_bytes().first().copied().ok_or_else(|| {
            SqlFlowError::Validation("csv delimiter must be a single character".into())
        })?;
        builder = builder.with_delimiter(byte);
    }
    let mut writer = builder.build(file);
    for batch in batches {
        writer.write(batch)?;
    }
    Ok(())
}

fn write_jsonl(
    file: File,
    batches: &[datafusion::arrow::record_batch::RecordBatch],
) -> Result<()> {
    let mut writer = LineDelimitedWriter::new(file);
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    Ok(())
}

fn write_parquet(
    file: File,
    batches: &[datafusion::arrow::record_batch::RecordBatch],
) -> Result<()> {
    let Some(first) = batches.first() else {
        return Ok(());
    };
    let mut writer = ArrowWriter::try_new(file, first.schema(), None)?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;
    Ok(())
}
