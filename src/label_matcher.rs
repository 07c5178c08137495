//! Forward-looking label attachment for supervised training.
//!
//! For a vector at time `t` the label is the target reading of the vector
//! whose timestamp lies in `[t + horizon - tolerance, t + horizon + tolerance]`
//! and is closest to `t + horizon`. Ties go to the earlier timestamp. Vectors
//! with no candidate in the window are dropped, never interpolated.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::errors::{ForecastError, ForecastResult};
use crate::feature_pipeline::FeatureVector;
use crate::sample::SensorField;

#[derive(Debug, Clone, PartialEq)]
pub struct LabelConfig {
    pub horizon: Duration,
    pub tolerance: Duration,
    pub target: SensorField,
    pub min_samples: usize,
}

impl LabelConfig {
    pub fn from_pipeline(cfg: &PipelineConfig, horizon_minutes: u32) -> Self {
        Self {
            horizon: Duration::minutes(i64::from(horizon_minutes)),
            tolerance: cfg.tolerance(),
            target: cfg.target,
            min_samples: cfg.min_labeled_samples,
        }
    }

    /// A tolerance as wide as the horizon would let a vector label itself.
    pub fn validate(&self) -> ForecastResult<()> {
        if self.horizon <= Duration::zero() {
            return Err(ForecastError::validation("horizon", "must be positive"));
        }
        if self.tolerance < Duration::zero() {
            return Err(ForecastError::validation("tolerance", "must not be negative"));
        }
        if self.tolerance >= self.horizon {
            return Err(ForecastError::validation(
                "tolerance",
                "must be shorter than the horizon",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedSample {
    pub features: FeatureVector,
    pub target: f64,
    pub target_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledDataset {
    pub samples: Vec<SupervisedSample>,
    pub match_failures: usize,
}

impl LabeledDataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Index of the vector closest to `goal` within `[goal - tolerance, goal + tolerance]`.
fn closest_in_window(
    timestamps: &[DateTime<Utc>],
    goal: DateTime<Utc>,
    tolerance: Duration,
) -> Option<usize> {
    let lo = timestamps.partition_point(|ts| *ts < goal - tolerance);
    let hi = timestamps.partition_point(|ts| *ts <= goal + tolerance);

    let mut best: Option<(usize, Duration)> = None;
    for (offset, ts) in timestamps[lo..hi].iter().enumerate() {
        let distance = (*ts - goal).abs();
        match best {
            // not strictly closer: the earlier candidate wins the tie
            Some((_, d)) if distance >= d => {}
            _ => best = Some((lo + offset, distance)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Pair every vector with its future target value.
///
/// The input must be ascending by timestamp (as produced by
/// `build_features`). Fails with `InsufficientLabeledSamples` when fewer than
/// `cfg.min_samples` vectors can be labeled.
pub fn match_labels(features: &[FeatureVector], cfg: &LabelConfig) -> ForecastResult<LabeledDataset> {
    cfg.validate()?;

    let timestamps: Vec<DateTime<Utc>> = features.iter().map(|f| f.timestamp).collect();
    if let Some(index) = timestamps.windows(2).position(|w| w[1] < w[0]) {
        return Err(ForecastError::UnorderedInput {
            index: index + 1,
            previous: timestamps[index],
            current: timestamps[index + 1],
        });
    }

    let mut samples = Vec::with_capacity(features.len());
    let mut match_failures = 0usize;

    for vector in features {
        let goal = vector.timestamp + cfg.horizon;
        match closest_in_window(&timestamps, goal, cfg.tolerance) {
            Some(idx) => {
                let matched = &features[idx];
                samples.push(SupervisedSample {
                    features: vector.clone(),
                    target: matched.value(cfg.target),
                    target_timestamp: matched.timestamp,
                });
            }
            None => match_failures += 1,
        }
    }

    debug!(
        labeled = samples.len(),
        match_failures,
        target = %cfg.target,
        "labels matched"
    );

    if samples.len() < cfg.min_samples {
        return Err(ForecastError::InsufficientLabeledSamples {
            found: samples.len(),
            required: cfg.min_samples,
            match_failures,
        });
    }

    Ok(LabeledDataset {
        samples,
        match_failures,
    })
}
