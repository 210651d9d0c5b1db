//! ephys-sort - spike-sorting job orchestrator
//!
//! Registers recordings and parameter sets, runs sorters for
//! (recording, parameter set) pairs at most once per identity, and reports
//! quality metrics of finished jobs. Results are printed as JSON on stdout;
//! logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ephys_sort::config::{SortConfig, APP_NAME};
use ephys_sort::models::{JobIdentity, JobState, Options, RecordingSpec};
use ephys_sort::services::MetricSet;
use ephys_sort::Pipeline;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for ephys-sort
#[derive(Parser, Debug)]
#[command(name = "ephys-sort")]
#[command(about = "Spike-sorting job orchestration with result deduplication")]
#[command(version)]
struct Args {
    /// Root folder holding the job database and working directories
    #[arg(short, long, env = "EPHYS_ROOT_FOLDER", global = true)]
    root_folder: Option<PathBuf>,

    /// Config file (default: <config_dir>/ephys/ephys-sort.toml)
    #[arg(short, long, env = "EPHYS_SORT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a recording described by a JSON file
    AddRecording { file: PathBuf },

    /// Register a named parameter set from a JSON object of options
    RegisterParams {
        name: String,
        sorter: String,
        options_file: PathBuf,
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Run the sorter for a recording and parameter set unless a result exists
    Submit { recording: String, paramset: String },

    /// Run every PENDING job
    RunPending,

    /// Show one job, or all jobs (optionally filtered by state)
    Status {
        identity: Option<String>,
        #[arg(short, long)]
        state: Option<JobState>,
    },

    /// Make a FAILED job eligible to run again
    Reset { identity: String },

    /// Cancel a PENDING or RUNNING job
    Cancel { identity: String },

    /// Quality metrics of a SUCCEEDED job
    Metrics {
        identity: String,
        /// Comma-separated metric names (default: all)
        #[arg(short, long, value_delimiter = ',')]
        metrics: Vec<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .or_else(|| ephys_common::config::default_config_path(APP_NAME));
    let config = match &config_path {
        Some(path) => SortConfig::load(path).context("Failed to load config")?,
        None => SortConfig::default(),
    };

    // Initialize tracing (RUST_LOG overrides the configured level)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let root = config.resolve_root(args.root_folder.as_deref());
    let pipeline = Pipeline::open(&root, &config)
        .await
        .context("Failed to initialize pipeline")?;

    match args.command {
        Command::AddRecording { file } => {
            let spec: RecordingSpec = read_json(&file)?;
            print_json(&pipeline.recordings().add(spec).await?)?;
        }

        Command::RegisterParams {
            name,
            sorter,
            options_file,
            description,
        } => {
            let options: Options = read_json(&options_file)?;
            let id = pipeline
                .parameters()
                .register(&name, &sorter, options, &description)
                .await?;
            print_json(&pipeline.parameters().get(id).await?)?;
        }

        Command::Submit { recording, paramset } => {
            pipeline.recover().await?;
            let recording = pipeline.recordings().get_by_name(&recording).await?;
            let paramset = pipeline.parameters().get_by_name(&paramset).await?;

            tokio::select! {
                outcome = pipeline.submit(&recording.id, paramset.id) => print_json(&outcome?)?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted; the running job will be requeued on next start");
                }
            }
        }

        Command::RunPending => {
            let recovery = pipeline.recover().await?;
            info!(requeued = recovery.requeued.len(), "Startup recovery complete");

            tokio::select! {
                report = pipeline.run_pending() => {
                    let report = report?;
                    print_json(&report.outcomes)?;
                    for (identity, err) in &report.errors {
                        eprintln!("{}: {}", identity, err);
                    }
                    if !report.errors.is_empty() {
                        anyhow::bail!("{} job(s) failed to execute", report.errors.len());
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted; running jobs will be requeued on next start");
                }
            }
        }

        Command::Status { identity, state } => match identity {
            Some(identity) => print_json(&pipeline.status(&JobIdentity(identity)).await?)?,
            None => print_json(&pipeline.jobs(state).await?)?,
        },

        Command::Reset { identity } => {
            print_json(&pipeline.reset(&JobIdentity(identity)).await?)?;
        }

        Command::Cancel { identity } => {
            print_json(&pipeline.cancel(&JobIdentity(identity)).await?)?;
        }

        Command::Metrics { identity, metrics } => {
            let metric_set = if metrics.is_empty() {
                MetricSet::all()
            } else {
                MetricSet::from_names(&metrics[..])?
            };
            print_json(&pipeline.quality_metrics(&JobIdentity(identity), &metric_set).await?)?;
        }
    }

    Ok(())
}
