pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "expensa",
    about = "Expensa operator CLI",
    long_about = "Operate the expense approval engine: migrations, config inspection, readiness \
                  checks, SLA sweeps, and workflow definition validation.",
    after_help = "Examples:\n  expensa doctor --json\n  expensa tick\n  expensa validate travel.json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config and database connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run one SLA scheduler pass against the configured database")]
    Tick,
    #[command(about = "Check a workflow definition JSON file against the definition rules")]
    Validate {
        #[arg(help = "Path to a workflow definition (create-request body) in JSON")]
        file: PathBuf,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Tick => commands::tick::run(),
        Command::Validate { file } => commands::validate::run(&file),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
