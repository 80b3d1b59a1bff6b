//! AutoNews CLI: pull, dedup, score, summarize, rank and push news items.
//!
//! Runs the ingestion pipeline over the configured sources and builds
//! digests from what was pushed.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
