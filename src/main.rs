mod args;
mod cmd_host;

use args::Cli;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("statushub=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    cmd_host::cmd_host(cli.command).await
}
