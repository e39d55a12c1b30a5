//! The embedded SQL engine seam.
//!
//! Everything the executor needs from the analytic engine goes through
//! [`SqlEngine`]: statement execution with bound parameters, queries, schema
//! introspection, and table registration from Arrow batches. The only
//! implementation in-tree is the DataFusion adapter; the trait keeps the mode
//! engine and executor testable against anything SQL-shaped.

pub mod datafusion;

use async_trait::async_trait;
use ::datafusion::arrow::datatypes::SchemaRef;
use ::datafusion::arrow::record_batch::RecordBatch;
use ::datafusion::scalar::ScalarValue;

use crate::errors::Result;

pub use self::datafusion::DataFusionEngine;

/// Named value parameters bound into a statement (`$name` placeholders).
/// User-supplied values (time macros, watermarks) travel exclusively through
/// these, never through string concatenation.
pub type SqlParams = Vec<(String, ScalarValue)>;

#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Execute a statement for its effects (DDL or DML), discarding output.
    async fn execute(&self, sql: &str, params: SqlParams) -> Result<()>;

    /// Run a query and collect its result batches.
    async fn query(&self, sql: &str, params: SqlParams) -> Result<Vec<RecordBatch>>;

    async fn table_exists(&self, name: &str) -> Result<bool>;

    async fn table_schema(&self, name: &str) -> Result<SchemaRef>;

    /// Register (or overwrite) a table from in-memory batches. The schema is
    /// explicit so empty sources still register with their shape.
    async fn register_batches(
        &self,
        name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        overwrite: bool,
    ) -> Result<()>;

    /// Remove a table from the catalog. Missing tables are not an error.
    async fn drop_table(&self, name: &str) -> Result<()>;

    /// Transaction hooks for engines that have them. The DataFusion adapter
    /// keeps the defaults and gets all-or-nothing visibility from its
    /// stage-and-swap statement shapes instead.
    async fn begin_tx(&self) -> Result<()> {
        Ok(())
    }

    async fn commit_tx(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback_tx(&self) -> Result<()> {
        Ok(())
    }

    /// Convenience: run a query expected to return a single value.
    async fn query_scalar(&self, sql: &str, params: SqlParams) -> Result<Option<ScalarValue>> {
        let batches = self.query(sql, params).await?;
        for batch in &batches {
            if batch.num_rows() > 0 && batch.num_columns() > 0 {
                let value = ScalarValue::try_from_array(batch.column(0), 0)?;
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Total row count across a table.
    async fn count_rows(&self, table: &str) -> Result<i64> {
        let scalar = self
            .query_scalar(&format!("SELECT COUNT(*) FROM {table}"), Vec::new())
            .await?;
        match scalar {
            Some(ScalarValue::Int64(Some(n))) => Ok(n),
            Some(ScalarValue::UInt64(Some(n))) => Ok(n as i64),
            _ => Ok(0),
        }
    }
}

/// Metadata about a registerable user-defined function.
#[derive(Debug, Clone)]
pub struct UdfMeta {
    pub name: String,
    pub description: Option<String>,
}

/// Collaborator seam for UDF discovery and registration. Providers attach to
/// the concrete DataFusion session; the planner only ever *detects* UDF table
/// references, it never executes them.
pub trait UdfProvider: Send + Sync {
    fn list(&self) -> Vec<UdfMeta>;

    /// Register functions (all, or the named subset) against the session.
    fn register(
        &self,
        ctx: &::datafusion::prelude::SessionContext,
        names: Option<&[String]>,
    ) -> Result<()>;
}
