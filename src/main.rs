use std::path::PathBuf;

use clap::{Parser, Subcommand};
use excel_to_xml::{Mode, Result, RunOptions, ToolError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();
    let outcome = init_tracing().and_then(|()| run(cli));
    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(error) => {
            eprintln!("error: {error}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| ToolError::Logging(err.to_string()))
}

/// Returns whether the command succeeded; a completed run with failures
/// returns `false`.
fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Command::Update(args) => execute_update(args),
        Command::DefaultConfig => {
            println!("{}", excel_to_xml::default_config_json()?);
            Ok(true)
        }
        Command::Sheets { workbook } => {
            for name in excel_to_xml::sheet_names(&workbook)? {
                println!("{name}");
            }
            Ok(true)
        }
    }
}

fn execute_update(args: UpdateArgs) -> Result<bool> {
    if !args.config.exists() {
        return Err(ToolError::MissingInput(args.config));
    }
    let cfg_json = std::fs::read_to_string(&args.config)?;
    let mode = if args.quick { Mode::Quick } else { Mode::Normal };
    let options = RunOptions::default();
    let report = excel_to_xml::update_with(&cfg_json, &args.excel, &args.xml_dir, mode, &options)?;

    if let Some(path) = &args.report {
        std::fs::write(path, report.to_json()?)?;
    }
    for file in &report.files {
        for issue in &file.issues {
            eprintln!("{}: {issue}", file.path);
        }
    }
    for issue in &report.workbook_issues {
        eprintln!("{} row {} column {}: {}", issue.sheet, issue.row, issue.column, issue.message);
    }
    println!(
        "{} file(s) updated, {} failed: {} inserted, {} updated, {} deleted, {} skipped",
        report.totals.files_updated,
        report.totals.files_failed,
        report.totals.inserted,
        report.totals.updated,
        report.totals.deleted,
        report.totals.skipped,
    );
    Ok(report.is_success())
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Keep a directory of XML files in sync with a spreadsheet."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Update XML files from the workbook.
    Update(UpdateArgs),

    /// Print the default configuration.
    DefaultConfig,

    /// List the sheets of a workbook.
    Sheets {
        /// Workbook path.
        workbook: PathBuf,
    },
}

#[derive(clap::Args)]
struct UpdateArgs {
    /// Mapping configuration (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Workbook to read rows from.
    #[arg(long)]
    excel: PathBuf,

    /// Directory holding the XML files.
    #[arg(long)]
    xml_dir: PathBuf,

    /// Load all inputs up front and plan files in parallel.
    #[arg(long)]
    quick: bool,

    /// Write the JSON run report to this file.
    #[arg(long)]
    report: Option<PathBuf>,
}
