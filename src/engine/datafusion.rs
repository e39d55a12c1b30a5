use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::datasource::MemTable;
use datafusion::prelude::{SessionConfig, SessionContext};
use tracing::debug;

use crate::engine::{SqlEngine, SqlParams, UdfProvider};
use crate::errors::Result;

/// The DataFusion adapter: one shared `SessionContext` across all workers.
/// DataFusion sessions are thread-safe; each statement executes on its own
/// future, and cancellation works by dropping that future (the executor wraps
/// engine calls in its task timeout).
pub struct DataFusionEngine {
    ctx: SessionContext,
}

impl Default for DataFusionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFusionEngine {
    pub fn new() -> Self {
        let config = SessionConfig::new().with_information_schema(true);
        Self {
            ctx: SessionContext::new_with_config(config),
        }
    }

    /// The underlying session, for UDF registration and tests.
    pub fn session(&self) -> &SessionContext {
        &self.ctx
    }

    /// Attach a UDF provider's functions to this session.
    pub fn register_udfs(&self, provider: &dyn UdfProvider, names: Option<&[String]>) -> Result<()> {
        provider.register(&self.ctx, names)
    }
}

#[async_trait]
impl SqlEngine for DataFusionEngine {
    async fn execute(&self, sql: &str, params: SqlParams) -> Result<()> {
        debug!(sql, params = params.len(), "engine execute");
        let mut df = self.ctx.sql(sql).await?;
        // Bind only when the statement has placeholders; extra names in the
        // map are ignored either way.
        if !params.is_empty() && sql.contains('$') {
            df = df.with_param_values(params)?;
        }
        df.collect().await?;
        Ok(())
    }

    async fn query(&self, sql: &str, params: SqlParams) -> Result<Vec<RecordBatch>> {
        debug!(sql, params = params.len(), "engine query");
        let mut df = self.ctx.sql(sql).await?;
        if !params.is_empty() && sql.contains('$') {
            df = df.with_param_values(params)?;
        }
        Ok(df.collect().await?)
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.ctx.table_exist(name)?)
    }

    async fn table_schema(&self, name: &str) -> Result<SchemaRef> {
        let provider = self.ctx.table_provider(name).await?;
        Ok(provider.schema())
    }

    async fn register_batches(
        &self,
        name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        overwrite: bool,
    ) -> Result<()> {
        let table = MemTable::try_new(schema, vec![batches])?;
        if overwrite && self.ctx.table_exist(name)? {
            self.ctx.deregister_table(name)?;
        }
        self.ctx.register_table(name, Arc::new(table))?;
        Ok(())
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        if self.ctx.table_exist(name)? {
            self.ctx.deregister_table(name)?;
        }
        Ok(())
    }
}
