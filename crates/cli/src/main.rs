// Mediaflow CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Run workflows in-process against the in-memory index and dispatcher.

mod commands;
mod definitions;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mediaflow")]
#[command(about = "Mediaflow CLI - Validate and run media workflow definitions")]
#[command(version)]
pub struct Cli {
    /// Directory holding workflow definitions (.json, .yaml, .yml)
    #[arg(long, short, env = "MEDIAFLOW_DEFINITIONS", default_value = "definitions")]
    pub definitions: PathBuf,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that every definition parses and has handlers for all operations
    Validate,

    /// List loaded workflow definitions
    Definitions,

    /// Run a workflow to completion
    Run(commands::run::RunArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediaflow_engine=info,mediaflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Validate => commands::validate::run(&cli.definitions, output_format).await,
        Commands::Definitions => commands::definitions::run(&cli.definitions, output_format).await,
        Commands::Run(args) => {
            commands::run::run(&cli.definitions, args, output_format, cli.quiet).await
        }
    }
}
