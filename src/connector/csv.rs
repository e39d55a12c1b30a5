use std::fs::File;
use std::io::Seek;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::csv::reader::Format;
use datafusion::arrow::csv::ReaderBuilder;
use datafusion::arrow::datatypes::SchemaRef;
use serde_json::Value;

use crate::connector::{ChunkStream, Connector};
use crate::errors::{Result, SqlFlowError};

const SCHEMA_SAMPLE_ROWS: usize = 1000;
const BATCH_SIZE: usize = 4096;

/// Local CSV file connector.
///
/// Params: `path` (required), `has_header` (default true), `delimiter`
/// (single character, default `,`). The `object` argument is unused; the
/// file path identifies the data.
#[derive(Debug, Default, Clone)]
pub struct CsvConnector;

impl CsvConnector {
    pub fn new() -> Self {
        Self
    }

    fn format_of(params: &Value) -> Result<Format> {
        let has_header = params
            .get("has_header")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let mut format = Format::default().with_header(has_header);
        if let Some(delim) = params.get("delimiter").and_then(Value::as_str) {
            let byte = delim.as_bytes().first().copied().ok_or_else(|| {
                SqlFlowError::Connector("csv delimiter must be a single character".to_string())
            })?;
            format = format.with_delimiter(byte);
        }
        Ok(format)
    }

    fn path_of(params: &Value) -> Result<String> {
        params
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SqlFlowError::Connector("csv source requires a 'path' param".to_string()))
    }

    fn open(params: &Value) -> Result<(File, SchemaRef, Format)> {
        let path = Self::path_of(params)?;
        let format = Self::format_of(params)?;
        let mut file = File::open(&path)
            .map_err(|e| SqlFlowError::Connector(format!("cannot open csv {path:?}: {e}")))?;
        let (schema, _) = format
            .infer_schema(&mut file, Some(SCHEMA_SAMPLE_ROWS))
            .map_err(|e| SqlFlowError::Connector(format!("cannot infer csv schema: {e}")))?;
        file.rewind()?;
        Ok((file, Arc::new(schema), format))
    }
}

#[async_trait]
impl Connector for CsvConnector {
    async fn read_all(&self, _object: &str, params: &Value) -> Result<ChunkStream> {
        let (file, schema, format) = Self::open(params)?;
        let stream = async_stream::try_stream! {
            let reader = ReaderBuilder::new(schema)
                .with_format(format)
                .with_batch_size(BATCH_SIZE)
                .build(file)?;
            for batch in reader {
                yield batch?;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn schema(&self, _object: &str, params: &Value) -> Result<SchemaRef> {
        let (_, schema, _) = Self::open(params)?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn reads_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "id,name").unwrap();
        writeln!(f, "1,alpha").unwrap();
        writeln!(f, "2,beta").unwrap();

        let conn = CsvConnector::new();
        let params = json!({"path": path.to_str().unwrap(), "has_header": true});
        let schema = conn.schema("a", &params).await.unwrap();
        assert_eq!(schema.fields().len(), 2);

        let mut stream = conn.read_all("a", &params).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[tokio::test]
    async fn missing_path_param_is_an_error() {
        let conn = CsvConnector::new();
        assert!(conn.read_all("a", &json!({})).await.is_err());
    }
}
