//! Unattended retraining worker.
//!
//! One-shot by default; with `--schedule` it stays up and retrains once per
//! local day at `--time`. Exit codes: 0 on success, 1 on failure, 130 when
//! interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use helio_forecast::app_state::AppState;
use helio_forecast::config_loader::load_config;
use helio_forecast::log_sink::{init_tracing, parse_level};
use helio_forecast::orchestrator::RetrainRequest;
use helio_forecast::scheduler::{run_scheduler, DailySchedule};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about = "Retrain a device's forecasting model", long_about = None)]
struct Args {
    /// Device to retrain
    #[arg(short, long)]
    device: String,

    /// Days of history (defaults to retrain.default_days)
    #[arg(long)]
    days: Option<u32>,

    /// Forecast horizon in minutes (defaults to pipeline.horizon_minutes)
    #[arg(long)]
    horizon: Option<u32>,

    /// Keep running and retrain once a day
    #[arg(long)]
    schedule: bool,

    /// Local time of day for scheduled runs, HH:MM
    #[arg(long)]
    time: Option<String>,

    /// Seconds between schedule checks
    #[arg(long)]
    check_interval: Option<u64>,

    /// Inspect the training data without training
    #[arg(long)]
    dry_run: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn interrupt_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; cancelling");
            cancel.cancel();
        }
    });
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    let level = if args.verbose {
        Level::DEBUG
    } else {
        parse_level(&config.logging.level).map_err(anyhow::Error::msg)?
    };
    init_tracing(level);

    let schedule = DailySchedule::parse(args.time.as_deref().unwrap_or(config.retrain.retrain_time.as_str()))?;
    let check_interval = Duration::from_secs(args.check_interval.unwrap_or(config.retrain.check_interval_secs).max(1));
    let request = RetrainRequest::new(
        args.device,
        args.days.unwrap_or(config.retrain.default_days),
        args.horizon.unwrap_or(config.pipeline.horizon_minutes),
    );
    request.validate()?;

    let state = AppState::open(config)?;

    if args.dry_run {
        let report = state.orchestrator.dry_run(&request)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    interrupt_on_ctrl_c(cancel.clone());

    if args.schedule {
        let runs = run_scheduler(state.supervisor.clone(), request, schedule, check_interval, cancel.clone()).await;
        info!(runs, "scheduler stopped");
        return Ok(if cancel.is_cancelled() {
            ExitCode::from(EXIT_INTERRUPTED)
        } else {
            ExitCode::SUCCESS
        });
    }

    let handle = state.supervisor.submit(request);
    let token = handle.cancellation_token();
    let forward = cancel.clone();
    tokio::spawn(async move {
        forward.cancelled().await;
        token.cancel();
    });

    let result = handle.wait().await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if cancel.is_cancelled() {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "retrain worker failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
