//! Feature derivation over one device's ordered sample series.
//!
//! Every derived field of vector `i` is computed from samples `0..=i` only:
//! temporal fields from the sample's own timestamp, first differences against
//! sample `i - 1` (zero for the first sample), and trailing rolling means over
//! at most `window` samples ending at `i`.

use std::collections::VecDeque;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ForecastError, ForecastResult};
use crate::sample::{FanStatus, Sample, SensorField};

/// Column order used for training and prediction.
pub const FEATURE_NAMES: [&str; 15] = [
    "hour",
    "minute",
    "day_of_week",
    "servo_angle",
    "temperature",
    "humidity",
    "lux",
    "voltage",
    "current",
    "power",
    "fan_on",
    "power_diff",
    "lux_diff",
    "rolling_mean_power_5",
    "rolling_mean_lux_5",
];

pub const DEFAULT_ROLLING_WINDOW: usize = 5;

/// Raw sensor fields plus causal derived fields for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub timestamp: DateTime<Utc>,
    pub hour: u32,
    pub minute: u32,
    /// Monday = 0.
    pub day_of_week: u32,
    pub servo_angle: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub lux: f64,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub fan_on: f64,
    pub power_diff: f64,
    pub lux_diff: f64,
    pub rolling_mean_power: f64,
    pub rolling_mean_lux: f64,
}

impl FeatureVector {
    /// Values in [`FEATURE_NAMES`] order.
    pub fn values(&self) -> Vec<f64> {
        vec![
            f64::from(self.hour),
            f64::from(self.minute),
            f64::from(self.day_of_week),
            self.servo_angle,
            self.temperature,
            self.humidity,
            self.lux,
            self.voltage,
            self.current,
            self.power,
            self.fan_on,
            self.power_diff,
            self.lux_diff,
            self.rolling_mean_power,
            self.rolling_mean_lux,
        ]
    }

    /// Raw sensor reading carried by this vector.
    pub fn value(&self, field: SensorField) -> f64 {
        match field {
            SensorField::ServoAngle => self.servo_angle,
            SensorField::Temperature => self.temperature,
            SensorField::Humidity => self.humidity,
            SensorField::Lux => self.lux,
            SensorField::Voltage => self.voltage,
            SensorField::Current => self.current,
            SensorField::Power => self.power,
        }
    }
}

pub fn feature_names() -> Vec<String> {
    FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Trailing mean over a fixed-size window, updated one value at a time.
struct TrailingMean {
    window: usize,
    values: VecDeque<f64>,
}

impl TrailingMean {
    fn new(window: usize) -> Self {
        Self {
            window,
            values: VecDeque::with_capacity(window),
        }
    }

    fn push(&mut self, value: f64) -> f64 {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
        // summed from the window each time so long series do not drift
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// Derive one feature vector per sample, in input order.
///
/// Fails with `UnorderedInput` at the first timestamp decrease. Equal
/// timestamps are accepted.
pub fn build_features(samples: &[Sample], window: usize) -> ForecastResult<Vec<FeatureVector>> {
    if window == 0 {
        return Err(ForecastError::validation("rolling_window", "must be at least 1"));
    }

    let mut out = Vec::with_capacity(samples.len());
    let mut power_mean = TrailingMean::new(window);
    let mut lux_mean = TrailingMean::new(window);
    let mut previous: Option<&Sample> = None;

    for (index, sample) in samples.iter().enumerate() {
        if let Some(prev) = previous {
            if sample.timestamp < prev.timestamp {
                return Err(ForecastError::UnorderedInput {
                    index,
                    previous: prev.timestamp,
                    current: sample.timestamp,
                });
            }
        }

        let (power_diff, lux_diff) = match previous {
            Some(prev) => (sample.power - prev.power, sample.lux - prev.lux),
            None => (0.0, 0.0),
        };

        let ts = sample.timestamp;
        out.push(FeatureVector {
            timestamp: ts,
            hour: ts.hour(),
            minute: ts.minute(),
            day_of_week: ts.weekday().num_days_from_monday(),
            servo_angle: sample.servo_angle,
            temperature: sample.temperature,
            humidity: sample.humidity,
            lux: sample.lux,
            voltage: sample.voltage,
            current: sample.current,
            power: sample.power,
            fan_on: match sample.fan_status {
                FanStatus::On => 1.0,
                FanStatus::Off => 0.0,
            },
            power_diff,
            lux_diff,
            rolling_mean_power: power_mean.push(sample.power),
            rolling_mean_lux: lux_mean.push(sample.lux),
        });
        previous = Some(sample);
    }

    Ok(out)
}
