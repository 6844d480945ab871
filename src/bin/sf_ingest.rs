//! sf-ingest - command-line driver for sensorfabric ingestion
//!
//! Commands:
//! - sync: Ingest every new date folder under a source root
//! - ingest: Ingest a single date folder
//! - inspect: Decode one source file and summarize the tables it yields
//! - doctor: Check whitelist, destination and ledger

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use sensorfabric_ingest::accumulator::BatchAccumulator;
use sensorfabric_ingest::aggregated::read_aggregated_csv;
use sensorfabric_ingest::extractors::ExtractorRegistry;
use sensorfabric_ingest::ledger::{IngestionLedger, JsonFileLedger};
use sensorfabric_ingest::logging::{init_logging, LogFormat};
use sensorfabric_ingest::orchestrator::decode_file;
use sensorfabric_ingest::router::DEFAULT_WHITELIST_FILE;
use sensorfabric_ingest::storage::local_root;
use sensorfabric_ingest::{
    DataCategory, IngestConfig, IngestError, Orchestrator, PublishMode, RetryPolicy, RowSet,
    TableWhitelist, INGEST_VERSION, PRODUCER_NAME,
};

const DEFAULT_LEDGER_FILE: &str = "_ingest_ledger.json";

/// Ingest wearable sensor export bundles into partitioned Parquet datasets
#[derive(Parser)]
#[command(name = "sf-ingest")]
#[command(version = INGEST_VERSION)]
#[command(about = "Ingest biometric export bundles into catalogued Parquet datasets", long_about = None)]
struct Cli {
    /// Log output format (defaults to pretty on a terminal, json otherwise)
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every date folder newer than the last sync
    Sync {
        /// Root holding one folder per date (YYYY-MM-DD)
        source: PathBuf,

        /// Dataset root (path or file:// URL)
        #[arg(env = "SF_DESTINATION")]
        destination: String,

        /// Catalog database name
        #[arg(env = "SF_DATABASE")]
        database: String,

        /// Skip dates on or before this one
        #[arg(long)]
        last_synced: Option<NaiveDate>,

        /// Ledger of ingested dates (default: <destination>/_ingest_ledger.json)
        #[arg(long)]
        ledger: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Ingest a single date folder
    Ingest {
        /// Date folder holding participant folders
        date_dir: PathBuf,

        /// Dataset root (path or file:// URL)
        #[arg(env = "SF_DESTINATION")]
        destination: String,

        /// Catalog database name
        #[arg(env = "SF_DATABASE")]
        database: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Decode one .avro or .csv file and print the tables it yields
    Inspect {
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check whitelist, destination and ledger
    Doctor {
        /// Table whitelist file
        #[arg(long, env = "SF_WHITELIST", default_value = DEFAULT_WHITELIST_FILE)]
        whitelist: PathBuf,

        /// Dataset root to check
        #[arg(long, env = "SF_DESTINATION")]
        destination: Option<String>,

        /// Ledger file to check
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Options shared by the commands that publish data
#[derive(Args)]
struct RunArgs {
    /// Table whitelist file
    #[arg(long, env = "SF_WHITELIST", default_value = DEFAULT_WHITELIST_FILE)]
    whitelist: PathBuf,

    /// Catalog directory (default: <destination>/_catalog)
    #[arg(long)]
    catalog_dir: Option<PathBuf>,

    /// Publish mode
    #[arg(long, value_enum, default_value = "append")]
    mode: ModeArg,

    /// Source data to ingest
    #[arg(long, value_enum, default_value = "all")]
    category: CategoryArg,

    /// Extra partition columns after participant_full_id (comma separated)
    ///
    /// Every listed column must exist in every published table; a table
    /// without it fails to publish. `device_id` is present everywhere.
    #[arg(long, value_delimiter = ',')]
    partition_by: Vec<String>,

    /// Worker threads for decoding and publishing
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Attempts per storage or catalog operation
    #[arg(long, default_value = "3")]
    max_attempts: u32,
}

impl RunArgs {
    fn into_config(self, destination: String, database: String) -> IngestConfig {
        let mut partition_cols = IngestConfig::default().partition_cols;
        partition_cols.extend(self.partition_by.into_iter().filter(|c| !c.is_empty()));

        IngestConfig {
            storage_root: destination,
            catalog_root: self.catalog_dir,
            database,
            partition_cols,
            mode: match self.mode {
                ModeArg::Append => PublishMode::Append,
                ModeArg::Overwrite => PublishMode::Overwrite,
            },
            categories: match self.category {
                CategoryArg::Avro => vec![DataCategory::RawAvro],
                CategoryArg::Csv => vec![DataCategory::AggregatedPerMinute],
                CategoryArg::All => DataCategory::all(),
            },
            max_workers: self.workers,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            whitelist_path: self.whitelist,
        }
    }
}

#[derive(Clone, ValueEnum)]
enum ModeArg {
    /// Keep existing data and table definitions
    Append,
    /// Replace existing data and table definitions
    Overwrite,
}

#[derive(Clone, ValueEnum)]
enum CategoryArg {
    /// Raw Avro records (raw_data/v6)
    Avro,
    /// Aggregated per-minute CSVs (digital_biomarkers/aggregated_per_minute)
    Csv,
    /// Both
    All,
}

#[derive(Clone, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let format = match cli.log_format {
        Some(LogFormatArg::Pretty) => LogFormat::Pretty,
        Some(LogFormatArg::Compact) => LogFormat::Compact,
        Some(LogFormatArg::Json) => LogFormat::Json,
        None if atty::is(atty::Stream::Stderr) => LogFormat::Pretty,
        None => LogFormat::Json,
    };
    init_logging(format, if cli.verbose { "debug" } else { "info" });

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<(), IngestCliError> {
    match command {
        Commands::Sync {
            source,
            destination,
            database,
            last_synced,
            ledger,
            run,
        } => {
            let config = run.into_config(destination, database);
            cmd_sync(config, &source, ledger, last_synced)
        }
        Commands::Ingest {
            date_dir,
            destination,
            database,
            run,
        } => cmd_ingest(run.into_config(destination, database), &date_dir),
        Commands::Inspect { file, json } => cmd_inspect(&file, json),
        Commands::Doctor {
            whitelist,
            destination,
            ledger,
            json,
        } => cmd_doctor(&whitelist, destination.as_deref(), ledger.as_deref(), json),
    }
}

fn cmd_sync(
    config: IngestConfig,
    source: &Path,
    ledger_path: Option<PathBuf>,
    last_synced: Option<NaiveDate>,
) -> Result<(), IngestCliError> {
    let orchestrator = Orchestrator::from_config(config)?;
    let ledger_path = match ledger_path {
        Some(path) => path,
        None => local_root(&orchestrator.config().storage_root)?.join(DEFAULT_LEDGER_FILE),
    };
    let mut ledger = JsonFileLedger::open(ledger_path)?;

    let report = orchestrator.sync_dates(source, &mut ledger, last_synced)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.is_success() {
        Ok(())
    } else {
        Err(IngestCliError::DatesFailed(report.failed.len()))
    }
}

fn cmd_ingest(config: IngestConfig, date_dir: &Path) -> Result<(), IngestCliError> {
    let orchestrator = Orchestrator::from_config(config)?;
    let report = orchestrator.ingest_date_folder(date_dir)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.is_ingested() {
        Ok(())
    } else {
        Err(IngestCliError::DatesFailed(1))
    }
}

fn cmd_inspect(file: &Path, json: bool) -> Result<(), IngestCliError> {
    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let tables: Vec<(String, RowSet)> = match extension.as_str() {
        "avro" => {
            let registry = ExtractorRegistry::builtin();
            let whitelist = Arc::new(TableWhitelist::new(registry.table_names()));
            let extractors: Vec<_> = registry.iter().cloned().collect();
            let mut acc = BatchAccumulator::new(whitelist);
            decode_file(file, DataCategory::RawAvro, "inspect", &extractors, &mut acc)?;
            acc.into_tables().into_iter().collect()
        }
        "csv" => {
            let parsed = read_aggregated_csv(file)?;
            vec![(parsed.table_name, parsed.rows)]
        }
        other => return Err(IngestCliError::UnsupportedFile(other.to_string())),
    };

    let summaries: Vec<TableSummary> = tables
        .iter()
        .map(|(name, rows)| TableSummary {
            table: name.clone(),
            rows: rows.num_rows(),
            columns: rows
                .schema()
                .into_iter()
                .map(|(col, ty)| format!("{}:{}", col, ty))
                .collect(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        println!("{}", file.display());
        for summary in &summaries {
            println!("  {} ({} rows)", summary.table, summary.rows);
            println!("    {}", summary.columns.join(", "));
        }
    }
    Ok(())
}

fn cmd_doctor(
    whitelist: &Path,
    destination: Option<&str>,
    ledger: Option<&Path>,
    json: bool,
) -> Result<(), IngestCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck::ok(
        "version",
        format!("{} {}", PRODUCER_NAME, INGEST_VERSION),
    ));

    checks.push(match TableWhitelist::load(whitelist) {
        Ok(list) if list.is_empty() => DoctorCheck::warning(
            "whitelist",
            format!("{} enables no tables", whitelist.display()),
        ),
        Ok(list) => DoctorCheck::ok(
            "whitelist",
            format!("{} tables enabled: {}", list.len(), list.tables().join(", ")),
        ),
        Err(e) => DoctorCheck::error("whitelist", e.to_string()),
    });

    if let Some(destination) = destination {
        checks.push(match local_root(destination) {
            Ok(root) if root.is_dir() => {
                DoctorCheck::ok("destination", format!("{} exists", root.display()))
            }
            Ok(root) => DoctorCheck::warning(
                "destination",
                format!("{} does not exist yet; it will be created", root.display()),
            ),
            Err(e) => DoctorCheck::error("destination", e.to_string()),
        });
    }

    if let Some(path) = ledger {
        checks.push(match JsonFileLedger::open(path) {
            Ok(ledger) => DoctorCheck::ok(
                "ledger",
                match ledger.last_synced() {
                    Some(last) => format!(
                        "{} dates ingested, last {}",
                        ledger.ingested_dates().len(),
                        last
                    ),
                    None => "no dates ingested yet".to_string(),
                },
            ),
            Err(e) => DoctorCheck::error("ledger", e.to_string()),
        });
    }

    checks.push(if atty::is(atty::Stream::Stderr) {
        DoctorCheck::ok("log_output", "stderr is a TTY (pretty logs)")
    } else {
        DoctorCheck::ok("log_output", "stderr is redirected (JSON logs)")
    });

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: INGEST_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("sf-ingest Doctor Report");
        println!("=======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(IngestCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum IngestCliError {
    Ingest(IngestError),
    Json(serde_json::Error),
    DatesFailed(usize),
    UnsupportedFile(String),
    DoctorFailed,
}

impl From<IngestError> for IngestCliError {
    fn from(e: IngestError) -> Self {
        IngestCliError::Ingest(e)
    }
}

impl From<serde_json::Error> for IngestCliError {
    fn from(e: serde_json::Error) -> Self {
        IngestCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<IngestCliError> for CliError {
    fn from(e: IngestCliError) -> Self {
        match e {
            IngestCliError::Ingest(e @ IngestError::Configuration(_)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check --whitelist, the destination and the database name".to_string()),
            },
            IngestCliError::Ingest(e @ IngestError::Decode { .. }) => CliError {
                code: "DECODE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Ensure the file is an Avro object container or an aggregated CSV".to_string()),
            },
            IngestCliError::Ingest(e @ IngestError::Io(_)) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            IngestCliError::Ingest(e) => CliError {
                code: "INGEST_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            IngestCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            IngestCliError::DatesFailed(count) => CliError {
                code: "INGEST_INCOMPLETE".to_string(),
                message: format!("{} date folder(s) were not fully published", count),
                hint: Some("Review the report and logs, then re-run; finished dates are skipped".to_string()),
            },
            IngestCliError::UnsupportedFile(ext) => CliError {
                code: "UNSUPPORTED_FILE".to_string(),
                message: format!("cannot inspect '.{}' files", ext),
                hint: Some("Pass a .avro or .csv file".to_string()),
            },
            IngestCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct TableSummary {
    table: String,
    rows: usize,
    columns: Vec<String>,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

impl DoctorCheck {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }

    fn ok(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Ok, message)
    }

    fn warning(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warning, message)
    }

    fn error(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Error, message)
    }
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
