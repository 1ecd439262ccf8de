use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "warehouse-cli")]
#[command(about = "Warehouse ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one batch file and print the result as JSON
    Ingest {
        path: PathBuf,
        /// Run against an empty in-memory store instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply the bundled schema migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warehouse=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { path, dry_run } => {
            let result = warehouse_sync::run_ingest_once_from_env(&path, dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            warehouse_sync::migrate_from_env().await?;
            eprintln!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}
