// tests/common/mod.rs
#![allow(dead_code)]

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use helio_forecast::config::{ForecastConfig, ModelKind};
use helio_forecast::sample::{DeviceStatus, FanStatus, Sample};
use helio_forecast::sample_store::SampleStore;
use helio_forecast::AppState;

pub fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// `n` online samples one minute apart, the last one minute ago.
pub fn recent_series(device: &str, n: usize) -> Vec<Sample> {
    let end = now_seconds() - Duration::minutes(1);
    let start = end - Duration::minutes(n as i64 - 1);
    (0..n)
        .map(|i| {
            let phase = i as f64 / 25.0;
            let power = 18.0 + 6.0 * phase.sin() + (i % 7) as f64 * 0.1;
            Sample {
                device_id: device.to_string(),
                timestamp: start + Duration::minutes(i as i64),
                servo_angle: 90.0 - 30.0 * phase.cos(),
                temperature: 32.0,
                humidity: 40.0 + phase.sin(),
                lux: power * 2500.0,
                voltage: 12.2,
                current: power / 12.2,
                power,
                fan_status: if power > 20.0 { FanStatus::On } else { FanStatus::Off },
                status: DeviceStatus::Online,
            }
        })
        .collect()
}

pub fn config(dir: &Path) -> ForecastConfig {
    let mut cfg = ForecastConfig::with_data_dir(dir);
    cfg.training.model_kind = ModelKind::Forest;
    cfg.training.forest.n_trees = 10;
    cfg.training.forest.max_depth = 6;
    cfg.retrain.lease_timeout_ms = 200;
    cfg
}

/// Sled-backed engine under `dir`, seeded with `samples`.
pub fn engine(dir: &Path, samples: &[Sample]) -> AppState {
    let state = AppState::open(config(dir)).expect("engine opens");
    for sample in samples {
        state.samples.insert(sample).expect("insert sample");
    }
    state
}
