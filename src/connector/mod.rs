//! Source connector seam.
//!
//! `SOURCE` steps resolve a [`Connector`] by type name and materialize its
//! chunks into the engine under the source's name. Production connectors
//! (S3, Postgres, REST, ...) plug in through the registry; in-tree are the
//! two small reference implementations the tests and demos rely on:
//! `memory` (JSON rows) and `csv` (local files).

pub mod csv;
pub mod memory;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::scalar::ScalarValue;
use futures::Stream;
use serde_json::Value;

use crate::errors::{Result, SqlFlowError};

pub use self::csv::CsvConnector;
pub use self::memory::MemoryConnector;

/// A stream of Arrow record batches read from a source.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<RecordBatch>> + Send>>;

/// Write semantics a connector may support for `Connector::write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    Replace,
    Append,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Objects this connector can read (tables, files, endpoints).
    async fn discover(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Full read of one object.
    async fn read_all(&self, object: &str, params: &Value) -> Result<ChunkStream>;

    /// Incremental read: rows with `cursor_col` strictly greater than
    /// `last_value`. Connectors without pushdown fall back to a full read;
    /// the caller still gets correct results, just without the savings.
    async fn read_incremental(
        &self,
        object: &str,
        cursor_col: &str,
        last_value: Option<ScalarValue>,
        params: &Value,
    ) -> Result<ChunkStream> {
        let _ = (cursor_col, last_value);
        self.read_all(object, params).await
    }

    /// Write a chunk back to the source system. Optional; read-only
    /// connectors keep the default.
    async fn write(
        &self,
        object: &str,
        chunk: RecordBatch,
        disposition: WriteDisposition,
        keys: Option<&[String]>,
    ) -> Result<()> {
        let _ = (object, chunk, disposition, keys);
        Err(SqlFlowError::Connector(
            "connector does not support writes".to_string(),
        ))
    }

    /// Schema of one object.
    async fn schema(&self, object: &str, params: &Value) -> Result<SchemaRef>;
}

/// Connector lookup by `SOURCE ... TYPE <name>`.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in reference connectors (`csv`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("csv", Arc::new(CsvConnector::new()));
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(type_name.into().to_ascii_lowercase(), connector);
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<dyn Connector>> {
        self.connectors
            .get(&type_name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                SqlFlowError::Connector(format!("no connector registered for type '{type_name}'"))
            })
    }
}
