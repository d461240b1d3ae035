//! flurry CLI: resumable batch classification against a rate-limited service.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use flurry::config::Config;
use flurry::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use flurry::pipeline::{self, ResumeMode, RunReport, RunStatus};
use flurry::{metrics, run_pipeline};

/// Number of partial rows shown by `status`.
const STATUS_PREVIEW_ROWS: usize = 5;

/// Resumable batch classification tool.
#[derive(Parser, Debug)]
#[command(name = "flurry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process remaining batches, resuming from the checkpoint if present.
    Run {
        /// Discard the checkpoint and partial results and start over.
        #[arg(long)]
        restart: bool,

        /// Validate configuration and input without calling the service.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show checkpoint progress and a preview of partial results.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match execute(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", snafu::Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}

async fn execute(args: &Args) -> Result<ExitCode, PipelineError> {
    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    match args.command {
        Command::Status => {
            let report = pipeline::status(&config, STATUS_PREVIEW_ROWS).await?;
            println!("{report}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { dry_run: true, .. } => {
            info!("Dry run mode - validating configuration and input");
            let plan = pipeline::plan(&config).await?;
            println!("{plan}");
            info!("Configuration is valid");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { restart, .. } => {
            if config.metrics.enabled {
                let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
                metrics::init(addr, &config.stage).context(MetricsSnafu)?;
                debug!(
                    "Metrics endpoint listening on http://{}/metrics",
                    config.metrics.address
                );
            }

            info!(stage = %config.stage, "flurry starting");
            let mode = if restart {
                ResumeMode::Restart
            } else {
                ResumeMode::Resume
            };
            let report = run_pipeline(config, mode).await?;
            log_outcome(&report, &args.config);
            Ok(ExitCode::from(report.status.exit_code()))
        }
    }
}

fn log_outcome(report: &RunReport, config_path: &Path) {
    match report.status {
        RunStatus::Completed => {
            info!("Run completed successfully");
            info!("  Items processed: {}", report.total_items);
            info!("  Batches: {}", report.total_batches);
            info!("  Parse anomalies: {}", report.anomalies);
            if let Some(output) = &report.output_path {
                info!("  Output: {}", output.display());
            }
        }
        status => {
            if let Some(reason) = &report.reason {
                error!("Stopped ({}): {}", status.as_str(), reason);
            }
            warn!(
                "Processed {}/{} items; resume at batch {} with: flurry --config {} run",
                report.items_processed,
                report.total_items,
                report.next_batch,
                config_path.display()
            );
        }
    }
}
