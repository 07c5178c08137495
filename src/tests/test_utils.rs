// src/tests/test_utils.rs
// Shared fixtures for the in-crate test modules

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::{ForecastConfig, ModelKind};
use crate::device_lease::DeviceLeases;
use crate::orchestrator::RetrainOrchestrator;
use crate::run_ledger::{MemoryRunLedger, RunLedger};
use crate::sample::{DeviceStatus, FanStatus, Sample};
use crate::sample_store::{MemorySampleStore, SampleStore};
use crate::version_store::VersionStore;

/// `n` online samples one minute apart, the last at `end`.
///
/// Power follows a slow daily-like curve so every model has signal to fit.
pub fn minute_series(device: &str, n: usize, end: DateTime<Utc>) -> Vec<Sample> {
    let start = end - Duration::minutes(n as i64 - 1);
    (0..n)
        .map(|i| {
            let phase = i as f64 / 30.0;
            let power = 20.0 + 8.0 * phase.sin();
            Sample {
                device_id: device.to_string(),
                timestamp: start + Duration::minutes(i as i64),
                servo_angle: 45.0 + 20.0 * phase.cos(),
                temperature: 30.0 + phase.sin(),
                humidity: 50.0,
                lux: power * 2000.0,
                voltage: 12.0,
                current: power / 12.0,
                power,
                fan_status: if i % 10 < 5 { FanStatus::On } else { FanStatus::Off },
                status: DeviceStatus::Online,
            }
        })
        .collect()
}

/// Whole-second "now" so stored timestamps equal the fixture's.
pub fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// Defaults rooted at `dir`, with a small forest and a short lease wait.
pub fn test_config(dir: &Path) -> ForecastConfig {
    let mut cfg = ForecastConfig::with_data_dir(dir);
    cfg.training.model_kind = ModelKind::Forest;
    cfg.training.forest.n_trees = 12;
    cfg.training.forest.max_depth = 6;
    cfg.retrain.lease_timeout_ms = 200;
    cfg
}

pub struct Harness {
    pub orchestrator: Arc<RetrainOrchestrator>,
    pub ledger: Arc<MemoryRunLedger>,
    pub versions: VersionStore,
}

pub fn harness(cfg: ForecastConfig, samples: Vec<Sample>) -> Harness {
    let store = MemorySampleStore::with_samples(samples).expect("fixture samples are valid");
    let versions = VersionStore::new(&cfg.storage).expect("version store");
    let ledger = Arc::new(MemoryRunLedger::new());
    let orchestrator = Arc::new(RetrainOrchestrator::new(
        Arc::new(store) as Arc<dyn SampleStore>,
        versions.clone(),
        Arc::clone(&ledger) as Arc<dyn RunLedger>,
        DeviceLeases::new(),
        cfg,
    ));
    Harness {
        orchestrator,
        ledger,
        versions,
    }
}
