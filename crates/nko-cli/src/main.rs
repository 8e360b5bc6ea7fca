//! NKO CLI - Command-line interface
//!
//! Usage:
//!   nko run [--stage <stage>] [--dry-run] [--test] [--resume]
//!   nko estimate --units <n>
//!   nko schedule [--interval-secs <n>]
//!   nko checkpoint show|clear

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use nko_core::{AppConfig, LoggingConfig};
use nko_pipeline::{
    CheckpointStore, FileDetectionSource, JsonCheckpointStore, Pipeline, RunOptions, Scheduler,
    Stage,
};

#[derive(Parser)]
#[command(name = "nko")]
#[command(about = "N'Ko corpus pipeline: extraction, consolidation and world generation")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables still override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline, or a single stage of it
    Run {
        /// Only run this stage (extraction, consolidation, generation)
        #[arg(long)]
        stage: Option<Stage>,
        /// Discover volumes and estimate cost without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Cap every stage's input at the configured test limit
        #[arg(long)]
        test: bool,
        /// Skip phrases the checkpoint already marks completed
        #[arg(long)]
        resume: bool,
        /// Phrases per checkpointed batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Cap every stage's input
        #[arg(long)]
        limit: Option<usize>,
        /// Similarity threshold for merging phrases
        #[arg(long)]
        threshold: Option<f64>,
        /// Read detections from a JSON file instead of the database
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Estimate pipeline cost for a number of source frames
    Estimate {
        /// Source units (frames)
        #[arg(long)]
        units: usize,
    },
    /// Re-run generation with resume on a fixed interval until interrupted
    Schedule {
        /// Seconds between runs
        #[arg(long, default_value_t = 3600)]
        interval_secs: u64,
        /// Phrases per checkpointed batch
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Inspect or reset the generation checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print checkpoint and last progress
    Show,
    /// Delete checkpoint and progress files
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run {
            stage,
            dry_run,
            test,
            resume,
            batch_size,
            limit,
            threshold,
            input,
        } => {
            let mut pipeline = Pipeline::from_config(config)?;
            if let Some(path) = input {
                pipeline = pipeline.with_source(Arc::new(FileDetectionSource::from_file(&path)?));
            }
            spawn_interrupt_handler(pipeline.cancel_token());

            let options = RunOptions {
                stage,
                dry_run,
                test_mode: test,
                resume,
                limit,
                batch_size,
                similarity_threshold: threshold,
            };
            let report = pipeline.run(&options).await;
            println!("{}", serde_json::to_string_pretty(&report)?);

            for (stage, entry) in &report.stages {
                if let Some(error) = &entry.error {
                    eprintln!("{stage} failed: {error}");
                }
            }
            Ok(ExitCode::from(report.exit_code() as u8))
        }
        Commands::Estimate { units } => {
            let estimate = config.cost.estimate(units);
            println!("{}", serde_json::to_string_pretty(&estimate)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule {
            interval_secs,
            batch_size,
        } => {
            let pipeline = Pipeline::from_config(config)?;
            spawn_interrupt_handler(pipeline.cancel_token());

            let mut scheduler = Scheduler::new(pipeline, Duration::from_secs(interval_secs));
            if let Some(batch_size) = batch_size {
                scheduler = scheduler.with_batch_size(batch_size);
            }
            let state = scheduler.run().await;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Checkpoint { action } => {
            let store = JsonCheckpointStore::new(
                config.pipeline.checkpoint_path(),
                config.pipeline.progress_path(),
            );
            match action {
                CheckpointAction::Show => {
                    let checkpoint = store.load()?;
                    let progress = store.load_progress()?;
                    let view = serde_json::json!({
                        "path": store.checkpoint_path(),
                        "completed": checkpoint.completed_phrases.len(),
                        "failed": checkpoint.failed_phrases,
                        "last_updated": checkpoint.last_updated,
                        "progress": progress,
                    });
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
                CheckpointAction::Clear => {
                    store.clear()?;
                    println!("Checkpoint cleared");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)
            .and_then(AppConfig::with_env_override)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => AppConfig::from_env().context("Invalid environment configuration")?,
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancel the pipeline on Ctrl+C; in-flight batches finish first
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, stopping after the current batch");
                cancel.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });
}
