//! `xylem` reports, retrieves and inspects pipeline results from the
//! command line. One invocation performs one operation against the store
//! the global flags (or the config file and environment) point at.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use serde_json::Value as JsonValue;
use tracing::debug;

use xylem_logging::LogConfig;
use xylem_schema::{FieldMap, PipelineType};
use xylem_store::{ResultFormatter, ResultsManager, StoreConfig};

#[derive(Parser)]
#[command(
    name = "xylem",
    version,
    about = "Report and inspect pipeline results",
    propagate_version = true
)]
struct Cli {
    /// Path to the xylem configuration file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Namespace overriding the schema's pipeline name
    #[arg(short = 'n', long = "namespace", global = true)]
    namespace: Option<String>,

    /// YAML results file backing the store
    #[arg(short = 'f', long = "results-file", global = true)]
    results_file: Option<PathBuf>,

    /// Results schema file
    #[arg(short = 's', long = "schema", global = true)]
    schema: Option<PathBuf>,

    /// Status schema file
    #[arg(long = "status-schema", global = true)]
    status_schema: Option<PathBuf>,

    /// Directory holding status flag files
    #[arg(long = "flag-dir", global = true)]
    flag_dir: Option<PathBuf>,

    /// Use only the configured database, never a results file
    #[arg(short = 'a', long = "database-only", global = true)]
    database_only: bool,

    /// Pipeline type the operation applies to
    #[arg(
        short = 't',
        long = "pipeline-type",
        global = true,
        default_value = "sample",
        value_parser = parse_pipeline_type
    )]
    pipeline_type: PipelineType,

    /// Log at debug instead of info
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report one result value for a record
    Report {
        /// Record to report for; falls back to the configured default
        #[arg(short = 'r', long = "record-identifier")]
        record: Option<String>,
        /// Name of the result, as declared in the schema
        #[arg(short = 'i', long = "result-identifier")]
        result: String,
        /// Value to report; parsed as JSON, kept as a string otherwise
        #[arg(short = 'v', long = "value")]
        value: String,
        /// Overwrite an already reported value
        #[arg(short = 'o', long = "overwrite")]
        overwrite: bool,
        /// Coerce the value into the schema-declared type
        #[arg(long = "try-convert")]
        try_convert: bool,
    },
    /// Print one reported value, or all results for a record
    Retrieve {
        #[arg(short = 'r', long = "record-identifier")]
        record: Option<String>,
        #[arg(short = 'i', long = "result-identifier")]
        result: Option<String>,
    },
    /// Remove one result, or a whole record
    Remove {
        #[arg(short = 'r', long = "record-identifier")]
        record: Option<String>,
        #[arg(short = 'i', long = "result-identifier")]
        result: Option<String>,
    },
    /// Summarize the configured store
    Inspect {
        /// Also print the stored records
        #[arg(short = 'd', long = "data")]
        data: bool,
    },
    /// Read or change a record's status
    Status {
        #[command(subcommand)]
        command: StatusCommands,
    },
}

#[derive(Subcommand)]
enum StatusCommands {
    /// Print the current status
    Get {
        #[arg(short = 'r', long = "record-identifier")]
        record: Option<String>,
    },
    /// Set the status to one of the schema-defined identifiers
    Set {
        /// Status identifier to set
        status: String,
        #[arg(short = 'r', long = "record-identifier")]
        record: Option<String>,
    },
}

fn parse_pipeline_type(raw: &str) -> std::result::Result<PipelineType, String> {
    raw.parse::<PipelineType>().map_err(|err| err.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_config = LogConfig {
        app_name: "xylem".to_string(),
        verbose: cli.verbose,
    };
    if let Err(err) = xylem_logging::init_logging(&log_config) {
        eprintln!("Failed to initialize logging: {err:#}");
        return ExitCode::from(1);
    }
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;
    runtime.block_on(execute(cli))
}

async fn execute(cli: Cli) -> Result<()> {
    let config = StoreConfig {
        namespace: cli.namespace,
        record_identifier: None,
        schema_path: cli.schema,
        status_schema_path: cli.status_schema,
        results_file_path: cli.results_file,
        flag_file_dir: cli.flag_dir,
        database: None,
        database_only: cli.database_only,
        pipeline_type: Some(cli.pipeline_type),
        formatter: ResultFormatter::Default,
    }
    .resolve(cli.config.as_deref())?;
    let manager = ResultsManager::new(config).await?;
    debug!(
        "Operating on '{}' over the {} backend",
        manager.namespace(),
        manager.backend_kind()
    );

    match cli.command {
        Commands::Report {
            record,
            result,
            value,
            overwrite,
            try_convert,
        } => {
            let declared = manager
                .schema()
                .descriptor(manager.pipeline_type(), &result)
                .and_then(|descriptor| descriptor.get("type"))
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            let value = parse_cli_value(&value, declared.as_deref())?;
            let mut values = FieldMap::new();
            values.insert(result, value);
            match manager
                .report(values, record.as_deref(), overwrite, try_convert)
                .await?
            {
                Some(lines) => {
                    for line in lines {
                        println!("{line}");
                    }
                }
                None => println!("Results not reported. To overwrite, use --overwrite"),
            }
        }
        Commands::Retrieve { record, result } => {
            let value = manager.retrieve(record.as_deref(), result.as_deref()).await?;
            println!("{}", render_value(&value)?);
        }
        Commands::Remove { record, result } => {
            let removed = manager.remove(record.as_deref(), result.as_deref()).await?;
            if removed {
                match result {
                    Some(result) => println!("Removed result '{result}'"),
                    None => println!("Removed record"),
                }
            } else {
                println!("Nothing to remove");
            }
        }
        Commands::Inspect { data } => {
            print_summary(&manager).await?;
            if data {
                print_data(&manager).await?;
            }
        }
        Commands::Status { command } => match command {
            StatusCommands::Get { record } => {
                match manager.get_status(record.as_deref()).await? {
                    Some(status) => println!("{status}"),
                    None => println!("No status set"),
                }
            }
            StatusCommands::Set { status, record } => {
                manager.set_status(record.as_deref(), &status).await?;
                println!("Set status '{status}'");
            }
        },
    }
    Ok(())
}

/// Parse a value argument. Anything that parses as JSON is taken typed; the
/// rest stays a string. For object- and array-typed results the argument
/// may instead name a JSON file to read the value from.
fn parse_cli_value(raw: &str, declared: Option<&str>) -> Result<JsonValue> {
    if matches!(declared, Some("object") | Some("array")) {
        let path = Path::new(raw);
        if path.is_file() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read value file '{}'", path.display()))?;
            return serde_json::from_str(&text)
                .with_context(|| format!("Value file '{}' is not valid JSON", path.display()));
        }
    }
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string())))
}

/// Strings print bare; everything else prints as YAML.
fn render_value(value: &JsonValue) -> Result<String> {
    Ok(match value {
        JsonValue::String(text) => text.clone(),
        other => serde_yaml::to_string(other)
            .context("Failed to render value")?
            .trim_end()
            .to_string(),
    })
}

async fn print_summary(manager: &ResultsManager) -> Result<()> {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Property", "Value"]);
    table.add_row(vec!["Namespace", manager.namespace()]);
    table.add_row(vec!["Backend", manager.backend_kind()]);
    table.add_row(vec!["Pipeline type", manager.pipeline_type().as_str()]);
    table.add_row(vec!["Status schema", manager.status_schema().source()]);
    for pipeline_type in [PipelineType::Project, PipelineType::Sample] {
        let count = manager.count_records(pipeline_type).await?;
        table.add_row(vec![
            format!("{} records", capitalize(pipeline_type.as_str())),
            count.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn print_data(manager: &ResultsManager) -> Result<()> {
    let rows = manager.select(None, &[], &[], None, None).await?;
    if rows.is_empty() {
        println!("No records");
        return Ok(());
    }
    let mut document = serde_json::Map::new();
    for mut row in rows {
        let Some(JsonValue::String(record)) = row.remove("record_identifier") else {
            continue;
        };
        row.retain(|_, value| !value.is_null());
        document.insert(record, JsonValue::Object(row));
    }
    print!(
        "{}",
        serde_yaml::to_string(&JsonValue::Object(document)).context("Failed to render records")?
    );
    Ok(())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
