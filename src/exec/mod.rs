//! Plan execution: the concurrent task scheduler, mode handlers, watermark
//! management, and export writers.

pub mod evolve;
pub mod executor;
pub mod export;
pub mod modes;
pub mod source;
pub mod watermark;

use std::sync::Arc;

use crate::connector::ConnectorRegistry;
use crate::engine::SqlEngine;
use crate::exec::watermark::WatermarkStore;
use crate::state::StateBackend;

pub use executor::{execute_plan, ExecutorOptions, RunSummary, TaskOutcome};
pub use watermark::WatermarkValue;

/// Everything a running task needs, shared across workers. One per run;
/// nothing global.
pub struct StepContext {
    /// Logical pipeline name, the first component of watermark keys.
    pub pipeline: String,
    pub engine: Arc<dyn SqlEngine>,
    pub state: Arc<dyn StateBackend>,
    pub watermarks: Arc<WatermarkStore>,
    pub connectors: ConnectorRegistry,
}
