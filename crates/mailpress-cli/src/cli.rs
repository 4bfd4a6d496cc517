use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mailpress", version, about = "Turn mailbox messages into blog articles")]
pub(crate) struct Cli {
    /// Configuration file (default: ./mailpress.toml, then XDG config dir)
    #[arg(short = 'c', long = "config")]
    pub(crate) config: Option<PathBuf>,
    /// Log at debug level
    #[arg(short = 'v', long)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Full pipeline: record mailbox messages, render articles, build the index
    Run(RunCmd),
    /// List mailbox messages without rendering anything
    List(ListCmd),
    /// Read one raw message from stdin, record it and store its raw text
    Ingest(IngestCmd),
    /// Rebuild only index.html from the catalog
    Index(IndexCmd),
}

#[derive(Args, Debug)]
pub(crate) struct RunCmd {
    /// Delete and regenerate articles that already exist on disk
    #[arg(short = 'f', long)]
    pub(crate) force: bool,
    /// Skip gallery generation
    #[arg(long)]
    pub(crate) nopix: bool,
    /// Process only the N-th mailbox message (0-based)
    #[arg(short = 'm', long)]
    pub(crate) message: Option<usize>,
}

#[derive(Args, Debug)]
pub(crate) struct ListCmd {
    #[arg(long)]
    pub(crate) json: bool,
}

#[derive(Args, Debug)]
pub(crate) struct IngestCmd {}

#[derive(Args, Debug)]
pub(crate) struct IndexCmd {}
