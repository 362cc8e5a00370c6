use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap_stdin::FileOrStdin;
use gcode::{changelog::LoggedChange, InterpreterConfig, ParsedProgram, ProgramSummary};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file with interpreter settings. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also print the modal and feedrate change log.
    #[arg(long)]
    changes: bool,

    /// The file to interpret, or - for stdin.
    #[arg()]
    name: FileOrStdin,
}

#[derive(Serialize)]
struct Report<'a> {
    summary: &'a ProgramSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    changes: Option<Vec<LoggedChange>>,
}

fn read_config(path: &Option<PathBuf>) -> anyhow::Result<InterpreterConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text).context("Failed while parsing interpreter settings")
        }
        None => Ok(InterpreterConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = read_config(&args.config)?;
    let program = ParsedProgram::parse_quiet(&args.name, &config);
    let report = Report {
        summary: &program.summary,
        changes: args.changes.then(|| program.changes()),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
