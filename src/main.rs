use clap::Parser;

use sqlflow::cmd::{run_cli, Cli};
use sqlflow::log::init_tracing_with;

#[tokio::main]
async fn main() -> sqlflow::Result<()> {
    let cli = Cli::parse();
    init_tracing_with(cli.log_level.as_deref(), cli.log_json);
    run_cli(cli).await
}
