//! biolog-ingest - Pipeline entry point

use anyhow::{Context, Result};
use biolog_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use biolog_ingest::config::Settings;
use biolog_ingest::state::StateTracker;
use biolog_ingest::{collector, parser, persister, processor, transcode};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "biolog-ingest",
    about = "Collect, parse, persist, and archive biometric quality logs",
    version
)]
struct Cli {
    /// Log debug output to the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new log files from the configured SFTP servers
    Collect,
    /// Parse collected logs, export JSONL, and archive the sources
    Process,
    /// Load exported JSONL into the fact store and archive it
    Persist,
    /// Run collect, process, and persist as one batch
    Run,
    /// Parse a single log file and print its records as JSON lines
    Parse {
        /// Path to the log file
        log_file: PathBuf,
        /// Print a per-record summary instead of JSON
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::Console)
            .log_file_prefix("biolog-ingest".to_string())
            .build()
    } else {
        LogConfig::builder()
            .level(LogLevel::Info)
            .output(LogOutput::Console)
            .log_file_prefix("biolog-ingest".to_string())
            .build()
    };

    // Set LOG_* variables override the flag-derived config; unset ones
    // leave it alone, so --verbose survives an empty environment.
    if let Err(e) = log_config.apply_env() {
        eprintln!("Warning: ignoring invalid LOG_* environment value: {e}");
    }
    let _ = init_logging(&log_config);

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Collect => {
            let settings = Settings::load()?;
            let tracker = StateTracker::new(&settings.state_db_path);
            let downloaded = collector::collect_from_servers(&settings, &tracker).await?;
            info!(downloaded, "Collect finished");
            Ok(())
        }

        Commands::Process => {
            let settings = Settings::load()?;
            let tracker = StateTracker::new(&settings.state_db_path);
            let stats = processor::process_all_logs(&settings, &tracker).await?;
            info!(
                files_processed = stats.files_processed,
                files_failed = stats.files_failed,
                records_exported = stats.records_exported,
                "Process finished"
            );
            Ok(())
        }

        Commands::Persist => {
            let settings = Settings::load()?;
            let tracker = StateTracker::new(&settings.state_db_path);
            let pool = connect_fact_store(&settings).await?;
            let stats = processor::persist_all_jsonl_files(&settings, &tracker, &pool).await?;
            info!(
                files_processed = stats.files_processed,
                files_failed = stats.files_failed,
                rows_inserted = stats.rows_inserted,
                "Persist finished"
            );
            Ok(())
        }

        Commands::Run => {
            let settings = Settings::load()?;
            let tracker = StateTracker::new(&settings.state_db_path);

            let downloaded = collector::collect_from_servers(&settings, &tracker).await?;
            let process_stats = processor::process_all_logs(&settings, &tracker).await?;
            let pool = connect_fact_store(&settings).await?;
            let persist_stats =
                processor::persist_all_jsonl_files(&settings, &tracker, &pool).await?;

            info!(
                downloaded,
                logs_processed = process_stats.files_processed,
                logs_failed = process_stats.files_failed,
                records_exported = process_stats.records_exported,
                jsonl_persisted = persist_stats.files_processed,
                jsonl_failed = persist_stats.files_failed,
                rows_inserted = persist_stats.rows_inserted,
                "Batch finished"
            );
            Ok(())
        }

        Commands::Parse { log_file, dry_run } => parse_one_file(log_file, *dry_run),
    }
}

/// Connect to Postgres and make sure the fact schema exists
async fn connect_fact_store(settings: &Settings) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&settings.db.url())
        .await
        .with_context(|| {
            format!(
                "Failed to connect to Postgres at {}:{}",
                settings.db.host, settings.db.port
            )
        })?;
    persister::ensure_schema(&pool, &settings.db.schema).await?;
    Ok(pool)
}

/// Parse one file without touching the pipeline trees or the ledger
fn parse_one_file(log_file: &PathBuf, dry_run: bool) -> Result<()> {
    let records = parser::parse_file(log_file)?;
    let ip_count = records.iter().filter(|r| r.is_ip()).count();

    for record in &records {
        if dry_run {
            println!(
                "{} re_id={} re_code={} face={} iris={} fingerprints={}",
                record.request_type,
                if record.primary_id.is_empty() {
                    "-"
                } else {
                    &record.primary_id
                },
                record
                    .status_code
                    .map_or_else(|| "-".to_string(), |c| c.to_string()),
                record.has_face(),
                record.has_iris(),
                record.fingerprint_samples.len(),
            );
        } else if record.is_ip() {
            println!(
                "{}",
                serde_json::to_string(&transcode::to_json(record))
                    .context("Failed to encode record")?
            );
        }
    }

    info!(
        path = %log_file.display(),
        records = records.len(),
        ip_records = ip_count,
        "Parsed log file"
    );
    Ok(())
}
