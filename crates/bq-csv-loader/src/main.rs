//! CLI entry point for the CSV to BigQuery loader.

use anyhow::Result;
use bq_csv_loader::{
    BigQueryClient, BigQueryConfig, CredentialSource, Credentials, FailureReport, LoadConfig,
    Loader, LoaderError, RunMode, RunReport, Stage, StageFailure,
};
use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Environment variables consulted for the client project, in order.
const PROJECT_ENV_VARS: [&str; 2] = ["GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"];

/// CLI-compatible run mode enum
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    /// Only create the table from the CSV header
    Create,
    /// Only append CSV rows to an existing table
    Upload,
    /// Create the table, then append the rows
    Both,
}

impl From<CliMode> for RunMode {
    fn from(cli: CliMode) -> Self {
        match cli {
            CliMode::Create => RunMode::Create,
            CliMode::Upload => RunMode::Upload,
            CliMode::Both => RunMode::Both,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Create BigQuery tables from CSV headers and load CSV rows into them",
    long_about = "Creates an all-STRING BigQuery table from a CSV header and/or appends the \
                  CSV rows to an existing table.\n\n\
                  ENVIRONMENT VARIABLES:\n  \
                  GOOGLE_APPLICATION_CREDENTIALS    credential JSON file (when --credentials is absent)\n  \
                  GOOGLE_CLOUD_PROJECT              client project fallback\n\n\
                  EXAMPLES:\n  \
                  # Create and load in one go\n  \
                  bq-csv-loader -c sales.csv -t my-project.analytics.sales\n\n  \
                  # Only print the CREATE statement\n  \
                  bq-csv-loader -c sales.csv -t analytics.sales --project-id my-project --mode create --print-sql\n\n  \
                  # Append a comma-separated latin1 file to an existing table\n  \
                  bq-csv-loader -c old.csv --dataset analytics --table-name sales --mode upload --sep , --encoding latin1"
)]
struct Args {
    /// Path to the CSV file
    #[arg(short, long)]
    csv: PathBuf,

    /// Destination table as [project.]dataset.table
    #[arg(short, long)]
    table_id: Option<String>,

    /// Project override (default project for short table ids)
    #[arg(long)]
    project_id: Option<String>,

    /// Dataset (with --table-name, or default dataset for a bare table id)
    #[arg(long)]
    dataset: Option<String>,

    /// Table name (when not using --table-id)
    #[arg(long)]
    table_name: Option<String>,

    /// What to do
    #[arg(long, value_enum, default_value = "both")]
    mode: CliMode,

    /// CSV field separator (a single character, or \t)
    #[arg(long, default_value = ";")]
    sep: String,

    /// CSV text encoding
    #[arg(long, default_value = "utf-8-sig")]
    encoding: String,

    /// Service account or authorized user JSON file
    ///
    /// If not specified, GOOGLE_APPLICATION_CREDENTIALS, the gcloud
    /// application-default file and the metadata server are tried in order
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// BigQuery job location (e.g. US, EU)
    #[arg(long)]
    location: Option<String>,

    /// Use CREATE OR REPLACE TABLE
    #[arg(long)]
    replace: bool,

    /// Print the CREATE statement without executing it
    #[arg(long)]
    print_sql: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Output a JSON run report to stdout instead of human-readable text
    ///
    /// Disables all logs. Failures are reported as JSON too.
    #[arg(long)]
    json: bool,
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so stdout only carries SQL and results. When
/// `json_output` is true, logging is disabled entirely.
fn init_logging(level: &str, quiet: bool, json_output: bool) {
    if json_output {
        return;
    }

    use tracing_subscriber::EnvFilter;

    let effective_level = if quiet { "warn" } else { level };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(effective_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    init_logging(&args.log_level, args.quiet, args.json);

    // Load environment variables from .env file
    dotenv().ok();

    match run(&args) {
        Ok(report) => {
            if args.json
                && let Err(e) = print_json(&report)
            {
                error!("{e:#}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            report_failure(&failure, args.json);
            ExitCode::from(failure.exit_code())
        }
    }
}

fn run(args: &Args) -> std::result::Result<RunReport, StageFailure> {
    let config =
        build_config(args).map_err(|e| StageFailure::new(Stage::Arguments, e.into()))?;

    let client = connect(&config, args.location.as_deref())
        .map_err(|e| StageFailure::new(Stage::Client, e))?;
    let project = client.project().to_string();
    info!("BigQuery client ready (project: {})", project);

    let loader = Loader::new(Arc::new(client), config);
    if args.json {
        loader.run(Some(&project), &mut io::sink())
    } else {
        loader.run(Some(&project), &mut io::stdout().lock())
    }
}

fn build_config(args: &Args) -> std::result::Result<LoadConfig, bq_csv_loader::ConfigValidationError> {
    let mut builder = LoadConfig::builder()
        .csv_path(&args.csv)
        .mode(args.mode.into())
        .separator(&args.sep)
        .encoding(&args.encoding)
        .replace(args.replace)
        .print_sql(args.print_sql);

    if let Some(ref table_id) = args.table_id {
        builder = builder.table_id(table_id);
    }
    if let Some(ref dataset) = args.dataset {
        builder = builder.dataset(dataset);
    }
    if let Some(ref table_name) = args.table_name {
        builder = builder.table_name(table_name);
    }
    if let Some(ref project_id) = args.project_id {
        builder = builder.project_id(project_id);
    }
    if let Some(ref path) = args.credentials {
        builder = builder.credentials(CredentialSource::File(path.clone()));
    }

    builder.build()
}

/// Build the BigQuery client.
///
/// The client project is `--project-id`, else the credential file's project,
/// else the first of [`PROJECT_ENV_VARS`] that is set.
fn connect(
    config: &LoadConfig,
    location: Option<&str>,
) -> std::result::Result<BigQueryClient, LoaderError> {
    let credentials = Credentials::load(&config.credentials)?;
    debug!("Using credentials from {}", credentials.origin());

    let project = config
        .project_id
        .clone()
        .filter(|p| !p.is_empty())
        .or_else(|| credentials.project_id().map(str::to_string))
        .or_else(|| {
            PROJECT_ENV_VARS
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|p| !p.is_empty()))
        })
        .ok_or_else(|| {
            LoaderError::ClientConstruction(
                "could not determine a project; pass --project-id or set GOOGLE_CLOUD_PROJECT"
                    .to_string(),
            )
        })?;

    let mut bq_config = BigQueryConfig::builder();
    if let Some(location) = location {
        bq_config = bq_config.location(location);
    }

    BigQueryClient::from_credentials(project, credentials, bq_config.build())
}

/// Print a failure for the user: a JSON report under `--json`, otherwise a
/// message (and hint) on stderr.
fn report_failure(failure: &StageFailure, json: bool) {
    if json {
        if let Err(e) = print_json(&FailureReport::from(failure)) {
            eprintln!("Error: {e:#}");
        }
        return;
    }

    let prefix = match failure.stage() {
        Stage::Arguments => "Invalid arguments",
        Stage::Client => "Error creating BigQuery client",
        Stage::Resolve => "Invalid table",
        Stage::ReadHeader => "Error reading CSV header",
        Stage::CreateTable if failure.exit_code() == 4 => "SQL error creating table",
        Stage::CreateTable => "BigQuery API error creating table",
        Stage::CheckTable if failure.exit_code() == 6 => "Missing table",
        Stage::CheckTable => "BigQuery API error checking table",
        Stage::ReadCsv => "Error reading CSV",
        Stage::Load if failure.exit_code() == 8 => "Load rejected",
        Stage::Load => "BigQuery API error loading data",
    };

    eprintln!("{}: {}", prefix, failure.error());
    if let Some(hint) = failure.hint() {
        eprintln!("Hint: {}", hint);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}
