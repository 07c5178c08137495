use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use crate::app_state::AppState;
use crate::config::ForecastConfig;
use crate::config_loader::render_config;
use crate::orchestrator::RetrainRequest;
use crate::run_ledger::{RunLedger, RunQuery, DEFAULT_PAGE_LIMIT};
use crate::sample::Sample;
use crate::sample_store::SampleStore;

/// Top-level CLI interface for Helio
#[derive(Parser)]
#[command(
    name = "helio",
    version,
    about = "Model lifecycle engine for solar tracker forecasting"
)]
pub struct Cli {
    /// TOML configuration file (defaults to ./helio.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Retrain the forecasting model of one device
    Retrain {
        #[arg(long)]
        device: String,
        /// Days of history to train on (1-90)
        #[arg(long)]
        days: Option<u32>,
        /// Forecast horizon in minutes
        #[arg(long)]
        horizon: Option<u32>,
        /// Report what would be trained on without training
        #[arg(long)]
        dry_run: bool,
    },

    /// List recorded training runs, newest first
    Runs {
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: usize,
    },

    /// Show one training run
    Run {
        #[arg(long)]
        run_id: String,
    },

    /// Delete a training run record (model artifacts are kept)
    DeleteRun {
        #[arg(long)]
        run_id: String,
    },

    /// Show the current model pointer of a device
    Current {
        #[arg(long)]
        device: String,
    },

    /// List saved model versions of a device
    Versions {
        #[arg(long)]
        device: String,
    },

    /// Point the device at an existing version (rollback)
    Activate {
        #[arg(long)]
        device: String,
        #[arg(long)]
        version: String,
    },

    /// Import samples from a JSON Lines file
    Import {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Forecast with the current model from the latest stored samples
    Forecast {
        #[arg(long)]
        device: String,
        /// How far back to read recent samples
        #[arg(long, default_value_t = 60)]
        lookback_minutes: u32,
    },

    /// Remove temp files left by an interrupted pointer update
    Sweep,

    /// Print the effective configuration
    Config,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Execute a parsed command against `config`.
///
/// Returns an error for command failures; a failed retrain is reported as
/// its result document and surfaces as an error too.
pub fn dispatch(cli: Cli, config: ForecastConfig) -> anyhow::Result<()> {
    if let Commands::Config = cli.command {
        print!("{}", render_config(&config)?);
        return Ok(());
    }

    let state = AppState::open(config).context("opening engine state")?;

    match cli.command {
        Commands::Retrain {
            device,
            days,
            horizon,
            dry_run,
        } => {
            let request = RetrainRequest::new(
                device,
                days.unwrap_or(state.config.retrain.default_days),
                horizon.unwrap_or(state.config.pipeline.horizon_minutes),
            );
            if dry_run {
                let report = state.orchestrator.dry_run(&request)?;
                return print_json(&report);
            }
            let result = state.supervisor.run_blocking(&request);
            print_json(&result)?;
            if !result.success {
                bail!(
                    "retrain {} failed: {}",
                    result.run_id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        Commands::Runs {
            device,
            skip,
            limit,
        } => {
            let query = RunQuery {
                device_id: device,
                skip,
                limit,
            };
            print_json(&state.ledger.list(&query)?)?;
        }

        Commands::Run { run_id } => match state.ledger.get(&run_id)? {
            Some(run) => print_json(&run)?,
            None => bail!("no training run {run_id}"),
        },

        Commands::DeleteRun { run_id } => {
            if !state.ledger.delete(&run_id)? {
                bail!("no training run {run_id}");
            }
            state.ledger.flush()?;
            println!("deleted run {run_id}");
        }

        Commands::Current { device } => match state.versions.get_current_pointer(&device)? {
            Some(pointer) => print_json(&pointer)?,
            None => bail!("device {device} has no current model"),
        },

        Commands::Versions { device } => {
            print_json(&state.versions.list_versions(&device)?)?;
        }

        Commands::Activate { device, version } => {
            let pointer = state.versions.activate_version(&device, &version)?;
            print_json(&pointer)?;
        }

        Commands::Import { file } => {
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("opening {}", file.display()))?,
            );
            let mut imported = 0usize;
            let mut rejected = 0usize;
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match Sample::from_json(&line).and_then(|s| state.samples.insert(&s)) {
                    Ok(()) => imported += 1,
                    Err(e) => {
                        rejected += 1;
                        warn!(line = n + 1, error = %e, "sample rejected");
                    }
                }
            }
            state.samples.flush()?;
            println!("imported {imported} samples, rejected {rejected}");
        }

        Commands::Forecast {
            device,
            lookback_minutes,
        } => {
            let until = Utc::now();
            let since = until - Duration::minutes(i64::from(lookback_minutes));
            let recent = state.samples.fetch(&device, since, until)?;
            print_json(&state.forecaster.forecast(&device, &recent)?)?;
        }

        Commands::Sweep => {
            let removed = state.versions.sweep_stale_temp_files()?;
            println!("removed {removed} stale temp files");
        }

        Commands::Config => print!("{}", render_config(&state.config)?),
    }
    Ok(())
}
