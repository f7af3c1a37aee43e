//! Bulk Import - user CSV ingestion tool

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bulkimport_common::logging::{init_logging, LogConfig, LogLevel};
use bulkimport_ingest::{
    EventChannel, FileOutcome, IngestConfig, IngestionCoordinator, IngestionReport,
    InMemoryUserStore, UploadIntake, UserStore, SAMPLE_CSV,
};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bulkimport")]
#[command(author, version, about = "Bulk user import from CSV files")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one or more user CSV files
    Import {
        /// CSV files to import
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory where uploads are staged before ingestion
        #[arg(long, env = "BULKIMPORT_TEMP_DIR")]
        staging_dir: Option<PathBuf>,

        /// Upper bound on reading one file, in seconds (0 = unbounded)
        #[arg(long, env = "BULKIMPORT_READ_TIMEOUT_SECS")]
        read_timeout: Option<u64>,

        /// Print per-file reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the sample CSV template
    Sample {
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("bulkimport")
        .include_location(cli.verbose)
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Import {
            files,
            staging_dir,
            read_timeout,
            json,
        } => {
            let mut config = IngestConfig::load()?;
            if let Some(dir) = staging_dir {
                config.staging_dir = dir;
            }
            if let Some(secs) = read_timeout {
                config.read_timeout_secs = secs;
            }
            config.validate()?;

            import(&config, &files, json).await
        },
        Command::Sample { output } => sample(output).await,
    }
}

async fn import(config: &IngestConfig, files: &[PathBuf], json: bool) -> Result<()> {
    tokio::fs::create_dir_all(&config.staging_dir)
        .await
        .with_context(|| {
            format!("Failed to create staging directory {}", config.staging_dir.display())
        })?;

    let store = InMemoryUserStore::new();
    let channel = Arc::new(EventChannel::spawn());
    let (coordinator, mut reports) =
        IngestionCoordinator::new(Arc::new(store.clone()), config).with_reports();
    coordinator.register(&channel);

    let intake = UploadIntake::new(channel.clone(), &config.staging_dir);

    let mut rejected = 0;
    for file in files {
        if let Err(e) = intake.accept_path(file).await {
            if e.is_rejection() {
                warn!(file = %file.display(), reason = %e, "Upload rejected");
            } else {
                error!(file = %file.display(), error = %e, "Upload failed");
            }
            println!("{}: {e}", file.display());
            rejected += 1;
        }
    }

    channel.close().await;
    coordinator.wait_idle().await;

    // Every unit of work has finished, so every report is already queued
    let mut collected: Vec<IngestionReport> = Vec::new();
    while let Ok(report) = reports.try_recv() {
        collected.push(report);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&collected)?);
    } else {
        for report in &collected {
            print_report(report);
        }
    }

    info!(
        files = files.len(),
        rejected,
        total_users = store.len(),
        "Import complete"
    );

    if rejected > 0 {
        anyhow::bail!("{rejected} of {} file(s) rejected", files.len());
    }

    Ok(())
}

fn print_report(report: &IngestionReport) {
    let path = report.location.display();
    match &report.outcome {
        FileOutcome::Ingested(result) => {
            println!(
                "{path}: {} stored, {} failed ({} ms)",
                result.records_stored,
                result.failures.len(),
                report.elapsed_ms
            );
            for failure in &result.failures {
                println!("  line {}: {}", failure.line_number, failure.reason);
            }
        },
        FileOutcome::Missing => println!("{path}: file disappeared before processing"),
        FileOutcome::ReadFailed { reason } => println!("{path}: read failed: {reason}"),
    }
}

async fn sample(output: Option<PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            tokio::fs::write(&path, SAMPLE_CSV)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Sample CSV written");
        },
        None => println!("{SAMPLE_CSV}"),
    }

    Ok(())
}
