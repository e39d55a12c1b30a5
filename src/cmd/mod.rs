//! Command-line interface: a thin shim over [`crate::runtime::Runtime`].
//!
//! All behavior lives in the library; the CLI only assembles a runtime from
//! flags and prints results.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::info;
use walkdir::WalkDir;

use crate::errors::{Result, SqlFlowError};
use crate::exec::ExecutorOptions;
use crate::runtime::Runtime;
use crate::state::{PostgresStateBackend, StateBackend, TaskState};
use crate::vars::VarContext;

/// Command-line interface structure for the sqlflow tool.
#[derive(Parser, Debug)]
#[command(
    name = "sqlflow",
    version,
    about = "SQL-native data pipelines on an embedded engine.",
    long_about = "SQL-native data pipelines on an embedded engine.\n\n\
Resources:\n  • Scripts: .sf files combining SOURCE / LOAD / CREATE TABLE AS / EXPORT with SQL\n  • Execution: parse → plan (DAG) → concurrent, resumable execution on DataFusion\n  • State: runs, task statuses and incremental watermarks in memory or Postgres"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs in JSON format.
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    /// Set log level (overrides env vars like RUST_LOG).
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a script (or every .sf script in a directory).
    Run {
        /// Path to a .sf script or a directory of scripts.
        script: PathBuf,
        /// Variable overrides, highest precedence (repeatable).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Maximum concurrently running tasks (default: cores).
        #[arg(long)]
        max_parallelism: Option<usize>,
        /// Attempt budget per task (1 = no retries).
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Per-task timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Cancel running tasks on the first failure.
        #[arg(long)]
        fail_fast: bool,
        /// Postgres DSN for durable state (default: in-memory).
        #[arg(long)]
        state_url: Option<String>,
    },
    /// Parse and plan a script, printing the execution plan JSON.
    Plan {
        script: PathBuf,
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
    /// Resume a previous run by id, retrying failed tasks.
    Resume {
        run_id: String,
        #[arg(long)]
        state_url: Option<String>,
    },
    /// List recorded runs.
    Runs {
        #[arg(long)]
        state_url: Option<String>,
    },
    /// Clear a stored watermark so the next incremental run starts over.
    ResetWatermark {
        pipeline: String,
        table: String,
        column: String,
        #[arg(long)]
        state_url: Option<String>,
    },
}

/// Entry point used by the binary.
pub async fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            script,
            vars,
            max_parallelism,
            max_attempts,
            timeout_secs,
            fail_fast,
            state_url,
        } => {
            let mut options = ExecutorOptions::default();
            if let Some(n) = max_parallelism {
                options.max_parallelism = n;
            }
            if let Some(n) = max_attempts {
                options.max_attempts = n;
            }
            options.task_timeout = timeout_secs.map(Duration::from_secs);
            options.fail_fast = fail_fast;

            let runtime = Runtime::new()
                .with_state(state_backend(state_url.as_deref()).await?)
                .with_vars(var_context(&vars)?)
                .with_options(options);
            run_path(&runtime, &script).await
        }
        Command::Plan { script, vars } => {
            let runtime = Runtime::new().with_vars(var_context(&vars)?);
            let text = std::fs::read_to_string(&script)?;
            let (plan, _) = runtime.plan_script(&text, Some(&script))?;
            println!("{}", plan.to_json()?);
            Ok(())
        }
        Command::Resume { run_id, state_url } => {
            let runtime = Runtime::new().with_state(state_backend(state_url.as_deref()).await?);
            let summary = runtime.resume(&run_id).await?;
            print_summary(&summary);
            summary_result(&summary)
        }
        Command::Runs { state_url } => {
            let runtime = Runtime::new().with_state(state_backend(state_url.as_deref()).await?);
            for run in runtime.list_runs().await? {
                println!(
                    "{}  {}  started {}  plan {}",
                    run.run_id,
                    run.status,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    &run.plan_hash[..12.min(run.plan_hash.len())],
                );
            }
            Ok(())
        }
        Command::ResetWatermark {
            pipeline,
            table,
            column,
            state_url,
        } => {
            let runtime = Runtime::new().with_state(state_backend(state_url.as_deref()).await?);
            runtime.reset_watermark(&pipeline, &table, &column).await?;
            info!(%pipeline, %table, %column, "watermark reset");
            Ok(())
        }
    }
}

async fn state_backend(url: Option<&str>) -> Result<Arc<dyn StateBackend>> {
    match url {
        Some(url) => Ok(Arc::new(PostgresStateBackend::connect(url).await?)),
        None => Ok(Arc::new(crate::state::MemoryStateBackend::new())),
    }
}

fn var_context(pairs: &[String]) -> Result<VarContext> {
    let mut cli_vars = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            SqlFlowError::Config(format!("--var expects KEY=VALUE, got {pair:?}"))
        })?;
        cli_vars.push((key.to_string(), value.to_string()));
    }
    Ok(VarContext::with_dotenv().with_cli_vars(cli_vars))
}

/// Run one script, or every `.sf` script under a directory in lexicographic
/// order (each file is its own pipeline).
async fn run_path(runtime: &Runtime, script: &Path) -> Result<()> {
    let started = Instant::now();
    let scripts = discover_scripts(script)?;
    if scripts.is_empty() {
        return Err(SqlFlowError::Config(format!(
            "no .sf scripts found at {}",
            script.display()
        )));
    }
    info!("📂 Discovered {} script(s)", scripts.len());

    let mut failed = false;
    for path in &scripts {
        info!("🔄 Running: {}", path.display());
        let summary = runtime.run_file(path).await?;
        print_summary(&summary);
        failed |= !summary.succeeded();
    }
    info!(
        "⏱️  Total execution time: {}ms",
        started.elapsed().as_millis()
    );
    if failed {
        return Err(SqlFlowError::Execution(
            "one or more pipelines failed".to_string(),
        ));
    }
    Ok(())
}

fn discover_scripts(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut scripts = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_sf = entry
            .path()
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("sf"))
            .unwrap_or(false);
        if is_sf {
            scripts.push(entry.path().to_path_buf());
        }
    }
    scripts.sort();
    Ok(scripts)
}

fn print_summary(summary: &crate::exec::RunSummary) {
    let succeeded = summary
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Success)
        .count();
    let failed = summary
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Failed)
        .count();
    info!(
        "{} {} | {} | {} ok, {} failed, {} skipped",
        if summary.succeeded() { "✅" } else { "❌" },
        summary.pipeline,
        summary.run_id,
        succeeded,
        failed,
        summary.skipped.len(),
    );
    for task in &summary.tasks {
        if let Some(error) = &task.error {
            info!("   {} [{}] {}", task.task_id, task.state, error);
        }
    }
}

fn summary_result(summary: &crate::exec::RunSummary) -> Result<()> {
    if summary.succeeded() {
        Ok(())
    } else {
        Err(SqlFlowError::Execution(format!(
            "run {} finished with status {}",
            summary.run_id, summary.status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_context_parses_pairs() {
        let ctx = var_context(&["env=prod".to_string(), "region=eu".to_string()]).unwrap();
        assert_eq!(ctx.resolve("env").map(|(v, _)| v), Some("prod".to_string()));
        assert_eq!(ctx.resolve("region").map(|(v, _)| v), Some("eu".to_string()));
    }

    #[test]
    fn var_context_rejects_malformed_pairs() {
        assert!(var_context(&["oops".to_string()]).is_err());
    }
}
