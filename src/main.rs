//! CLI Entry Point for rfid-ingest
//!
//! Provides command-line interface for:
//! - Running the ingestion pipeline against the configured readers
//! - Rewinding the durable store (printing stored reads in a time range)
//! - Checking a configuration file
//!
//! # Usage
//!
//! ```bash
//! rfid-ingest run --config config/rfid_ingest.toml --start
//! rfid-ingest rewind --from "2024-06-01 09:00:00" --to "2024-06-01 10:00:00"
//! rfid-ingest check-config
//! ```

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use rfid_ingest::config::{Settings, DEFAULT_CONFIG_PATH};
use rfid_ingest::feed::LiveEvent;
use rfid_ingest::readers::ReaderRegistry;
use rfid_ingest::tags::store::replay_dir;
use rfid_ingest::tags::{filter_by_time, sort_by_time, TIMESTAMP_FORMAT};
use rfid_ingest::{logging, Pipeline};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rfid-ingest")]
#[command(about = "RFID tag read ingestion: gating, durable storage and live fan-out", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until Ctrl+C
    Run {
        /// Settings file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Start ingesting immediately
        #[arg(long)]
        start: bool,
    },

    /// Print stored reads, sorted by time
    Rewind {
        /// Settings file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Only reads after this time ("YYYY-MM-DD HH:MM:SS[.mmm]")
        #[arg(long, value_parser = parse_time)]
        from: Option<NaiveDateTime>,

        /// Only reads before this time ("YYYY-MM-DD HH:MM:SS[.mmm]")
        #[arg(long, value_parser = parse_time)]
        to: Option<NaiveDateTime>,
    },

    /// Load, validate and print the effective settings
    CheckConfig {
        /// Settings file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn parse_time(value: &str) -> std::result::Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| format!("invalid time '{value}': {e}"))
}

fn load_settings(path: &PathBuf) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, start } => run(config, start).await,
        Commands::Rewind { config, from, to } => rewind(config, from, to).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

async fn run(config: PathBuf, start: bool) -> Result<()> {
    let settings = load_settings(&config)?;
    logging::init_from_settings(&settings)?;
    tracing::info!(
        unit = %settings.application.unit_id,
        store = %settings.storage.path.display(),
        gating_ms = settings.gating_window().as_millis() as u64,
        style = %settings.reader.gating_style,
        "Starting {}",
        settings.application.name
    );

    let registry = ReaderRegistry::with_builtin();
    let pipeline = Pipeline::build(settings, &registry).await?;
    for failure in pipeline.reader_failures() {
        tracing::warn!(error = %failure, "Reader left out");
    }

    let mut events = pipeline.subscribe("console");
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LiveEvent::Reads(batch) => {
                    for read in batch.iter() {
                        tracing::info!(
                            tag = %read.tag_decimal(),
                            reader = read.reader_id(),
                            antenna = read.antenna(),
                            rssi = read.rssi(),
                            time = %read.formatted_timestamp(),
                            "Read"
                        );
                    }
                }
                LiveEvent::Sighting(read) => {
                    tracing::info!(tag = %read.tag_decimal(), "Tag sighted");
                }
                LiveEvent::Status(snapshot) => {
                    tracing::debug!(
                        reading = snapshot.reading,
                        total_reads = snapshot.total_reads,
                        raw = snapshot.raw_reads_per_interval,
                        "Status"
                    );
                }
            }
        }
    });

    if start {
        pipeline.start_ingestion().await;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received");

    let result = pipeline.shutdown().await;
    printer.abort();
    result?;
    Ok(())
}

async fn rewind(
    config: PathBuf,
    from: Option<NaiveDateTime>,
    to: Option<NaiveDateTime>,
) -> Result<()> {
    let settings = load_settings(&config)?;
    logging::init_from_settings(&settings)?;

    let root = settings.storage.path.clone();
    let (reads, report) = tokio::task::spawn_blocking(move || replay_dir(&root)).await?;
    tracing::info!(
        files = report.files,
        reads = report.reads,
        skipped = report.skipped_lines,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Store replayed"
    );

    let mut selected = filter_by_time(reads, from, to);
    sort_by_time(&mut selected);
    for read in &selected {
        println!("{}", read.to_line());
    }
    Ok(())
}

fn check_config(config: PathBuf) -> Result<()> {
    let settings = load_settings(&config)?;
    let rendered = toml::to_string_pretty(&settings).context("rendering settings")?;
    println!("{rendered}");
    println!(
        "# effective gating: {} ms, style {}",
        settings.gating_window().as_millis(),
        settings.reader.gating_style
    );
    Ok(())
}
