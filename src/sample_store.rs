use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::errors::{ForecastError, ForecastResult, SafeReadLock, SafeWriteLock};
use crate::sample::Sample;

/// Read access to the time-ordered per-device sample collection.
///
/// `fetch` returns samples with `since <= timestamp <= until`, ascending by
/// timestamp, and fails with `NoData` when the range is empty.
pub trait SampleStore: Send + Sync {
    fn fetch(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> ForecastResult<Vec<Sample>>;

    fn insert(&self, sample: &Sample) -> ForecastResult<()>;
}

pub(crate) fn no_data(device_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> ForecastError {
    ForecastError::NoData {
        device_id: device_id.to_string(),
        since,
        until,
    }
}

/// In-process store, one ordered map per device.
#[derive(Default)]
pub struct MemorySampleStore {
    devices: RwLock<BTreeMap<String, BTreeMap<DateTime<Utc>, Sample>>>,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_samples(samples: impl IntoIterator<Item = Sample>) -> ForecastResult<Self> {
        let store = Self::new();
        for sample in samples {
            store.insert(&sample)?;
        }
        Ok(store)
    }
}

impl SampleStore for MemorySampleStore {
    fn fetch(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> ForecastResult<Vec<Sample>> {
        let devices = self.devices.safe_read()?;
        let samples: Vec<Sample> = match devices.get(device_id) {
            Some(series) if since <= until => series.range(since..=until).map(|(_, s)| s.clone()).collect(),
            _ => Vec::new(),
        };

        if samples.is_empty() {
            return Err(no_data(device_id, since, until));
        }
        Ok(samples)
    }

    fn insert(&self, sample: &Sample) -> ForecastResult<()> {
        let sample = sample.clone().validate()?;
        let mut devices = self.devices.safe_write()?;
        devices
            .entry(sample.device_id.clone())
            .or_default()
            .insert(sample.timestamp, sample);
        Ok(())
    }
}
