use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod pipeline;

use cli::{Cli, CliCommand};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);
    let config = config::load_config(args.config.as_deref())?;
    match &args.command {
        CliCommand::Run(cmd) => pipeline::run(&config, cmd).await,
        CliCommand::List(cmd) => pipeline::list(&config, cmd),
        CliCommand::Ingest(_) => pipeline::ingest(&config).await,
        CliCommand::Index(_) => pipeline::index(&config).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
