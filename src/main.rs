//! Tollgate binary entry point.

mod cli;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    // Values from .env become visible to clap `env` attributes and config
    // overrides alike.
    dotenvy::dotenv().ok();

    let cli = cli::Cli::parse();
    cli::init_tracing(cli.log_format);
    cli::run(cli).await
}
