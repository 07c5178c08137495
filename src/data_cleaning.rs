//! Pre-feature cleaning of fetched samples.
//!
//! Cleaning only removes samples; it never reorders them. Ordering defects
//! are left for the feature pipeline to report.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CleaningConfig;
use crate::sample::{DeviceStatus, Sample};

/// Per-stage drop counters for one cleaning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningStats {
    pub fetched: usize,
    pub dropped_status: usize,
    pub dropped_duplicates: usize,
    pub dropped_ranges: usize,
    pub retained: usize,
}

pub fn clean_samples(samples: Vec<Sample>, cfg: &CleaningConfig) -> (Vec<Sample>, CleaningStats) {
    let mut stats = CleaningStats {
        fetched: samples.len(),
        ..CleaningStats::default()
    };

    if !cfg.enabled {
        stats.retained = samples.len();
        return (samples, stats);
    }

    let mut seen = HashSet::with_capacity(samples.len());
    let mut retained = Vec::with_capacity(samples.len());

    for sample in samples {
        if cfg.online_only && sample.status != DeviceStatus::Online {
            stats.dropped_status += 1;
            continue;
        }
        // keep first
        if !seen.insert(sample.timestamp) {
            stats.dropped_duplicates += 1;
            continue;
        }
        if !within_ranges(&sample, cfg) {
            stats.dropped_ranges += 1;
            continue;
        }
        retained.push(sample);
    }

    stats.retained = retained.len();
    debug!(
        fetched = stats.fetched,
        dropped_status = stats.dropped_status,
        dropped_duplicates = stats.dropped_duplicates,
        dropped_ranges = stats.dropped_ranges,
        retained = stats.retained,
        "samples cleaned"
    );
    (retained, stats)
}

fn within_ranges(sample: &Sample, cfg: &CleaningConfig) -> bool {
    sample.lux >= cfg.min_lux
        && sample.voltage >= cfg.min_voltage
        && sample.current >= cfg.min_current
        && sample.power >= cfg.min_power
        && sample.temperature >= cfg.min_temperature
        && sample.temperature <= cfg.max_temperature
}
