use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use datafusion::arrow::datatypes::{FieldRef, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::scalar::ScalarValue;
use futures::stream;
use serde_arrow::schema::{SchemaLike, TracingOptions};
use serde_json::{json, Value};

use crate::connector::{ChunkStream, Connector, WriteDisposition};
use crate::errors::{Result, SqlFlowError};

/// In-memory connector over JSON rows. Used by tests and demos; also handy
/// as the smallest possible reference for connector authors.
#[derive(Default)]
pub struct MemoryConnector {
    tables: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: impl Into<String>, rows: Vec<Value>) -> Self {
        self.tables
            .lock()
            .expect("memory connector mutex poisoned")
            .insert(name.into(), rows);
        self
    }

    pub fn insert_rows(&self, name: &str, rows: Vec<Value>) {
        self.tables
            .lock()
            .expect("memory connector mutex poisoned")
            .entry(name.to_string())
            .or_default()
            .extend(rows);
    }

    fn rows(&self, object: &str) -> Result<Vec<Value>> {
        self.tables
            .lock()
            .expect("memory connector mutex poisoned")
            .get(object)
            .cloned()
            .ok_or_else(|| {
                SqlFlowError::Connector(format!("memory source has no object '{object}'"))
            })
    }
}

/// Infer an Arrow schema from JSON rows, preserving field order from the
/// samples. Empty inputs get an empty schema.
pub fn infer_fields(rows: &[Value]) -> Result<Vec<FieldRef>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let fields = Vec::<FieldRef>::from_samples(
        rows,
        TracingOptions::default()
            .allow_null_fields(true)
            .coerce_numbers(true)
            .map_as_struct(true),
    )?;
    Ok(fields)
}

fn rows_to_batches(rows: &[Value]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let fields = infer_fields(rows)?;
    let schema = Arc::new(Schema::new(fields.clone()));
    if rows.is_empty() {
        return Ok((schema, Vec::new()));
    }
    let batch = serde_arrow::to_record_batch(&fields, &rows)?;
    Ok((batch.schema(), vec![batch]))
}

/// Lower a scalar into a JSON value for row-level comparison.
fn scalar_to_json(value: &ScalarValue) -> Value {
    match value {
        ScalarValue::Int8(Some(v)) => json!(v),
        ScalarValue::Int16(Some(v)) => json!(v),
        ScalarValue::Int32(Some(v)) => json!(v),
        ScalarValue::Int64(Some(v)) => json!(v),
        ScalarValue::UInt8(Some(v)) => json!(v),
        ScalarValue::UInt16(Some(v)) => json!(v),
        ScalarValue::UInt32(Some(v)) => json!(v),
        ScalarValue::UInt64(Some(v)) => json!(v),
        ScalarValue::Float32(Some(v)) => json!(v),
        ScalarValue::Float64(Some(v)) => json!(v),
        ScalarValue::Utf8(Some(v)) | ScalarValue::LargeUtf8(Some(v)) => json!(v),
        ScalarValue::Boolean(Some(v)) => json!(v),
        ScalarValue::TimestampSecond(Some(v), _) => timestamp_json(*v * 1_000_000_000),
        ScalarValue::TimestampMillisecond(Some(v), _) => timestamp_json(*v * 1_000_000),
        ScalarValue::TimestampMicrosecond(Some(v), _) => timestamp_json(*v * 1_000),
        ScalarValue::TimestampNanosecond(Some(v), _) => timestamp_json(*v),
        _ => Value::Null,
    }
}

fn timestamp_json(nanos: i64) -> Value {
    json!(DateTime::from_timestamp_nanos(nanos)
        .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
}

/// `left > right` over JSON scalars: numeric when both sides are numbers,
/// lexicographic otherwise (ISO timestamps order correctly as strings).
fn json_gt(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l > r,
        _ => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l > r,
            _ => false,
        },
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn discover(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .expect("memory connector mutex poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn read_all(&self, object: &str, _params: &Value) -> Result<ChunkStream> {
        let rows = self.rows(object)?;
        let (_, batches) = rows_to_batches(&rows)?;
        Ok(Box::pin(stream::iter(batches.into_iter().map(Ok))))
    }

    async fn read_incremental(
        &self,
        object: &str,
        cursor_col: &str,
        last_value: Option<ScalarValue>,
        _params: &Value,
    ) -> Result<ChunkStream> {
        let rows = self.rows(object)?;
        let filtered: Vec<Value> = match last_value {
            None => rows,
            Some(scalar) => {
                let floor = scalar_to_json(&scalar);
                rows.into_iter()
                    .filter(|row| {
                        row.get(cursor_col)
                            .map(|v| json_gt(v, &floor))
                            .unwrap_or(false)
                    })
                    .collect()
            }
        };
        let (_, batches) = rows_to_batches(&filtered)?;
        Ok(Box::pin(stream::iter(batches.into_iter().map(Ok))))
    }

    async fn write(
        &self,
        object: &str,
        chunk: RecordBatch,
        disposition: WriteDisposition,
        _keys: Option<&[String]>,
    ) -> Result<()> {
        let rows: Vec<Value> = serde_arrow::from_record_batch(&chunk)?;
        let mut tables = self.tables.lock().expect("memory connector mutex poisoned");
        let entry = tables.entry(object.to_string()).or_default();
        match disposition {
            WriteDisposition::Replace => *entry = rows,
            WriteDisposition::Append => entry.extend(rows),
        }
        Ok(())
    }

    async fn schema(&self, object: &str, _params: &Value) -> Result<SchemaRef> {
        let rows = self.rows(object)?;
        let (schema, _) = rows_to_batches(&rows)?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sample_rows() -> Vec<Value> {
        vec![
            json!({"id": 1, "ts": "2024-01-01T00:00:00Z"}),
            json!({"id": 2, "ts": "2024-01-02T00:00:00Z"}),
            json!({"id": 3, "ts": "2024-01-03T00:00:00Z"}),
        ]
    }

    #[tokio::test]
    async fn read_all_yields_one_batch() {
        let conn = MemoryConnector::new().with_table("events", sample_rows());
        let mut stream = conn.read_all("events", &Value::Null).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn read_incremental_filters_on_string_cursor() {
        let conn = MemoryConnector::new().with_table("events", sample_rows());
        let mut stream = conn
            .read_incremental(
                "events",
                "ts",
                Some(ScalarValue::Utf8(Some("2024-01-01T00:00:00Z".into()))),
                &Value::Null,
            )
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[tokio::test]
    async fn read_incremental_filters_on_numeric_cursor() {
        let conn = MemoryConnector::new().with_table("events", sample_rows());
        let mut stream = conn
            .read_incremental(
                "events",
                "id",
                Some(ScalarValue::Int64(Some(2))),
                &Value::Null,
            )
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.num_rows(), 1);
    }

    #[tokio::test]
    async fn unknown_object_is_a_connector_error() {
        let conn = MemoryConnector::new();
        assert!(conn.read_all("nope", &Value::Null).await.is_err());
    }
}
