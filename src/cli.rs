//! CLI argument parsing for the enrichment workflow.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "sheet-enrich",
    version,
    about = "Fill spreadsheet columns with LM-generated values",
    after_help = "Commands:\n  validate --config <path>  Check config and sheet, count pending cells\n  run --config <path>       Enrich the sheet and save it\n\nExamples:\n  sheet-enrich validate --config enrich.yaml\n  sheet-enrich run --config enrich.yaml --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Validate(ValidateArgs),
}

impl Command {
    pub fn verbose(&self) -> bool {
        match self {
            Command::Run(args) => args.verbose,
            Command::Validate(args) => args.verbose,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Enrich the configured sheet and save the workbook")]
pub struct RunArgs {
    /// YAML config describing the workbook, output columns and service
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Emit the run summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Log every request and skipped cell
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Check the config against the sheet without calling the service")]
pub struct ValidateArgs {
    /// YAML config describing the workbook, output columns and service
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Emit the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Log every request and skipped cell
    #[arg(long)]
    pub verbose: bool,
}
