// scheduler.rs
// Purpose: Once-a-day unattended retraining at a local time of day

use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, NaiveDateTime, NaiveTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{ForecastError, ForecastResult};
use crate::orchestrator::RetrainRequest;
use crate::supervisor::RetrainSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    pub at: NaiveTime,
}

impl DailySchedule {
    /// Parse a 24h `HH:MM` time of day.
    pub fn parse(raw: &str) -> ForecastResult<Self> {
        let at = NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| {
            ForecastError::validation("retrain_time", format!("'{raw}' is not a HH:MM time of day"))
        })?;
        Ok(Self { at })
    }

    pub fn is_due(&self, now_local: NaiveDateTime, last_run_local: Option<NaiveDateTime>) -> bool {
        should_run(now_local, self.at, last_run_local)
    }
}

impl fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.at.format("%H:%M"))
    }
}

/// Due once the time of day reaches `at`, unless a run already happened
/// since local midnight.
pub fn should_run(now_local: NaiveDateTime, at: NaiveTime, last_run_local: Option<NaiveDateTime>) -> bool {
    if now_local.time() < at {
        return false;
    }
    match last_run_local {
        Some(last) => last.date() < now_local.date(),
        None => true,
    }
}

/// Start of the current local day, as an instant.
pub fn local_midnight_utc(now: DateTime<Local>) -> DateTime<Utc> {
    now.date_naive()
        .and_time(NaiveTime::MIN)
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        // midnight skipped by a DST jump
        .unwrap_or_else(|| now.with_timezone(&Utc) - Duration::hours(24))
}

/// Last run of the device today, from the ledger, in local time.
fn seed_last_run(supervisor: &RetrainSupervisor, device_id: &str) -> Option<NaiveDateTime> {
    let since = local_midnight_utc(Local::now());
    match supervisor.orchestrator().ledger().latest_since(device_id, since) {
        Ok(Some(run)) => {
            info!(device_id = %device_id, run_id = %run.run_id, "today's run already recorded");
            Some(run.trained_at.with_timezone(&Local).naive_local())
        }
        Ok(None) => None,
        Err(e) => {
            warn!(device_id = %device_id, error = %e, "could not read ledger; assuming no run today");
            None
        }
    }
}

/// Check every `check_interval` and retrain once per day until cancelled.
///
/// Failed runs count as the day's run. Returns the number of runs started.
pub async fn run_scheduler(
    supervisor: RetrainSupervisor,
    request: RetrainRequest,
    schedule: DailySchedule,
    check_interval: StdDuration,
    cancel: CancellationToken,
) -> usize {
    let mut last_run = seed_last_run(&supervisor, &request.device_id);
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut started = 0usize;

    info!(
        device_id = %request.device_id,
        at = %schedule,
        check_interval_secs = check_interval.as_secs(),
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Local::now().naive_local();
                if !schedule.is_due(now, last_run) {
                    continue;
                }
                started += 1;
                last_run = Some(now);
                let handle = supervisor.submit(request.clone());
                let token = handle.cancellation_token();
                let waiting = handle.wait();
                tokio::pin!(waiting);
                let result = tokio::select! {
                    result = &mut waiting => result,
                    _ = cancel.cancelled() => {
                        token.cancel();
                        waiting.await
                    }
                };
                if result.success {
                    info!(run_id = %result.run_id, promoted = ?result.promoted, "scheduled retrain succeeded");
                } else {
                    warn!(run_id = %result.run_id, error = ?result.error, "scheduled retrain failed");
                }
            }
            _ = cancel.cancelled() => {
                info!("scheduler shutting down");
                break;
            }
        }
    }
    started
}
