//! Operator command surface for a Markr database.
//!
//! Every command prints one pretty JSON document on stdout; logs go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use markr_api::MarkrApi;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "markr")]
#[command(about = "Markr test results CLI")]
pub struct Cli {
    #[arg(long, env = "MARKR_DB", default_value = "./markr.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Database schema management
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Import an mcq-test-results XML document
    Import(ImportArgs),
    /// Print summary statistics for a test
    Aggregate(AggregateArgs),
    /// Inspect stored results
    Results {
        #[command(subcommand)]
        command: ResultsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
    SchemaVersion,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Path to the XML document, or `-` for stdin
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct AggregateArgs {
    test_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ResultsCommand {
    List {
        #[arg(long)]
        test_id: String,
    },
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when input cannot be read, the document is invalid, or
/// the database operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let api = MarkrApi::new(cli.db);
    run_command(&api, cli.command)
}

/// Executes one command against an existing api handle.
///
/// # Errors
/// Returns an error when the command fails.
pub fn run_command(api: &MarkrApi, command: Command) -> Result<()> {
    match command {
        Command::Db { command } => match command {
            DbCommand::Migrate => print_json(&api.migrate()?),
            DbCommand::SchemaVersion => print_json(&api.schema_status()?),
        },
        Command::Import(args) => {
            let document = read_document(&args.file)?;
            print_json(&api.import_xml(&document)?)
        }
        Command::Aggregate(args) => print_json(&api.aggregate(&args.test_id)?),
        Command::Results { command } => match command {
            ResultsCommand::List { test_id } => print_json(&api.list_results(&test_id)?),
        },
    }
}

fn read_document(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buffer = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buffer)
            .context("failed to read document from stdin")?;
        return Ok(buffer);
    }

    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
