use anyhow::Result;
use clap::Parser;

use ferry_control::args::{Cli, Commands};
use ferry_control::{cli, server};

#[tokio::main]
async fn main() -> Result<()> {
    ferry_common::init();

    tracing_subscriber::fmt::init();

    let args = Cli::parse();

    match args.command {
        Commands::Server(args) => {
            ferry_common::metrics::maybe_spawn_metrics_server();
            server::run_server(args).await
        }
        Commands::CreateOrg(args) => cli::run_create_org(args).await,
        Commands::CreateApiKey(args) => cli::run_create_api_key(args).await,
        Commands::Submit(args) => cli::run_submit(args).await,
        Commands::GetExecution(args) => cli::run_get_execution(args).await,
        Commands::Health(args) => cli::run_health(args).await,
    }
}
