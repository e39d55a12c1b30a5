use thiserror::Error;
use tracing_subscriber::filter::FromEnvError;

/// Main error type for sqlflow operations.
#[derive(Error, Debug)]
pub enum SqlFlowError {
    #[error("DataFusion error: {0}")]
    Datafusion(#[from] datafusion::error::DataFusionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] datafusion::arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] datafusion::parquet::errors::ParquetError),

    #[error("Serde Arrow error: {0}")]
    SerdeArrow(#[from] serde_arrow::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Tracing From Env Error: {0}")]
    FromEnv(#[from] FromEnvError),

    /// Lexer or parser failure. Carries the position of the first offending
    /// token; additional per-statement errors are accumulated as diagnostics
    /// on the parsed pipeline.
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    /// Cycles, duplicate producers, malformed mode clauses. Always fatal.
    #[error("planning error: {0}")]
    Planning(String),

    /// Invalid identifier, invalid JSON params, invalid upsert keys.
    #[error("validation error: {0}")]
    Validation(String),

    /// Incompatible schema change, missing column, non-unique upsert key.
    #[error("schema error: {0}")]
    Schema(String),

    /// SQL engine, connector, or I/O failure during a task. Retried up to
    /// the task's attempt budget before becoming fatal for the step.
    #[error("execution error: {0}")]
    Execution(String),

    /// State backend unreachable or corrupted. Fatal for the run.
    #[error("state backend error: {0}")]
    State(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connector error: {0}")]
    Connector(String),
}

impl SqlFlowError {
    /// Short machine-readable code for each error surface.
    pub fn code(&self) -> &'static str {
        match self {
            SqlFlowError::Syntax { .. } => "SYNTAX",
            SqlFlowError::Planning(_) => "PLANNING",
            SqlFlowError::Validation(_) => "VALIDATION",
            SqlFlowError::Schema(_) => "SCHEMA",
            SqlFlowError::Execution(_) => "EXECUTION",
            SqlFlowError::State(_) | SqlFlowError::Sqlx(_) => "STATE",
            SqlFlowError::Cancelled(_) => "CANCELLED",
            SqlFlowError::Config(_) => "CONFIG",
            SqlFlowError::Connector(_) => "CONNECTOR",
            _ => "INTERNAL",
        }
    }

    /// Whether a task failing with this error may be retried on resume or by
    /// the retry policy. Planning and validation failures are deterministic;
    /// retrying them cannot succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            SqlFlowError::Syntax { .. }
                | SqlFlowError::Planning(_)
                | SqlFlowError::Validation(_)
                | SqlFlowError::Schema(_)
        )
    }
}

/// Convenience Result type that uses SqlFlowError.
pub type Result<T> = std::result::Result<T, SqlFlowError>;
