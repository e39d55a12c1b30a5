//! # SQLFlow
//!
//! SQL-native data pipeline framework powered by Apache DataFusion & Rust.
//!
//! ## Overview
//!
//! SQLFlow executes declarative `.sf` scripts that combine a small DSL
//! (SOURCE / LOAD / CREATE TABLE AS / EXPORT / SET / INCLUDE / IF) with
//! embedded SQL:
//!
//! - **Parse** scripts into an AST with variable and conditional resolution
//! - **Plan** a dependency-correct DAG with cycle detection and stable ids
//! - **Execute** concurrently on an embedded DataFusion engine, with
//!   REPLACE / APPEND / UPSERT / INCREMENTAL write semantics, retries, and
//!   resumable runs
//!
//! ## Quick Start
//!
//! ```no_run
//! use sqlflow::runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> sqlflow::Result<()> {
//!     let runtime = Runtime::new();
//!     let summary = runtime
//!         .run_script(
//!             "CREATE TABLE totals AS SELECT 1 AS n;",
//!             None,
//!         )
//!         .await?;
//!     assert!(summary.succeeded());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Script → Lexer → Parser → AST → Planner (DAG) → Executor → DataFusion
//!                                      ↑                ↓
//!                                state backend (runs, tasks, watermarks)
//! ```
//!
//! - **Parser**: hand-written lexer/parser for the pipeline DSL
//! - **Planner**: producer/consumer resolution, Kahn's topological order
//! - **Executor**: semaphore-bounded workers, per-task retry, resume
//! - **Modes**: per-mode SQL generation with parameter-bound time macros
//! - **State**: in-memory or Postgres run/task/watermark store

// Public API exports
pub use errors::{Result, SqlFlowError};

// Public modules
pub mod cmd;
pub mod connector;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod log;
pub mod parser;
pub mod plan;
pub mod runtime;
pub mod state;
pub mod utils;
pub mod vars;
