use chrono::{DateTime, Utc};
use sled::Db;

use crate::errors::{ForecastError, ForecastResult};
use crate::sample::{validate_device_id, Sample};
use crate::sample_store::{no_data, SampleStore};

/// A sled-backed implementation of SampleStore.
///
/// Keys are `device_id 0x00 ts` where `ts` is the epoch second with the sign
/// bit flipped and stored big-endian, so a key range scan walks one device's
/// samples in timestamp order.
pub struct SampleStoreSled {
    db: Db,
}

impl SampleStoreSled {
    /// Opens (or creates) the sample database at `path`.
    pub fn new(path: &str) -> ForecastResult<Self> {
        let db = sled::open(path).map_err(|e| ForecastError::database("open samples db", e))?;
        Ok(Self { db })
    }

    fn tree(&self) -> ForecastResult<sled::Tree> {
        self.db
            .open_tree("samples")
            .map_err(|e| ForecastError::database("open samples tree", e))
    }

    fn key(device_id: &str, timestamp: DateTime<Utc>) -> Vec<u8> {
        let ordered = (timestamp.timestamp() as u64) ^ (1u64 << 63);
        let mut key = Vec::with_capacity(device_id.len() + 9);
        key.extend_from_slice(device_id.as_bytes());
        key.push(0);
        key.extend_from_slice(&ordered.to_be_bytes());
        key
    }

    /// Number of stored samples across all devices.
    pub fn len(&self) -> ForecastResult<usize> {
        Ok(self.tree()?.len())
    }

    pub fn is_empty(&self) -> ForecastResult<bool> {
        Ok(self.tree()?.is_empty())
    }

    pub fn flush(&self) -> ForecastResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SampleStore for SampleStoreSled {
    fn fetch(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> ForecastResult<Vec<Sample>> {
        validate_device_id(device_id)?;
        if since > until {
            return Err(no_data(device_id, since, until));
        }

        let tree = self.tree()?;
        let start = Self::key(device_id, since);
        let end = Self::key(device_id, until);

        let mut samples = Vec::new();
        for item in tree.range(start..=end) {
            let (_, bytes) = item?;
            let sample: Sample = serde_json::from_slice(&bytes)
                .map_err(|e| ForecastError::serialization("stored sample", e))?;
            // Sub-second bounds are narrower than the key resolution.
            if sample.timestamp >= since && sample.timestamp <= until {
                samples.push(sample);
            }
        }

        if samples.is_empty() {
            return Err(no_data(device_id, since, until));
        }
        Ok(samples)
    }

    fn insert(&self, sample: &Sample) -> ForecastResult<()> {
        let sample = sample.clone().validate()?;
        let bytes = serde_json::to_vec(&sample)?;
        let tree = self.tree()?;
        tree.insert(Self::key(&sample.device_id, sample.timestamp), bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{DeviceStatus, FanStatus};
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn sample(device: &str, ts: DateTime<Utc>, power: f64) -> Sample {
        Sample {
            device_id: device.to_string(),
            timestamp: ts,
            servo_angle: 45.0,
            temperature: 30.0,
            humidity: 50.0,
            lux: 1000.0,
            voltage: 12.0,
            current: 1.0,
            power,
            fan_status: FanStatus::Off,
            status: DeviceStatus::Online,
        }
    }

    #[test]
    fn fetch_returns_ascending_range_for_one_device() {
        let temp_dir = tempdir().expect("failed to create temp dir");
        let store = SampleStoreSled::new(temp_dir.path().to_str().unwrap()).expect("open store");
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();

        // Inserted out of order, and interleaved with another device.
        for i in [4i64, 0, 3, 1, 2] {
            store.insert(&sample("tracker01", base + Duration::minutes(i), i as f64)).unwrap();
            store.insert(&sample("tracker02", base + Duration::minutes(i), -1.0)).unwrap();
        }

        let got = store
            .fetch("tracker01", base + Duration::minutes(1), base + Duration::minutes(3))
            .expect("fetch");
        let powers: Vec<f64> = got.iter().map(|s| s.power).collect();
        assert_eq!(powers, vec![1.0, 2.0, 3.0]);
        assert!(got.iter().all(|s| s.device_id == "tracker01"));
    }

    #[test]
    fn empty_range_is_no_data() {
        let temp_dir = tempdir().expect("failed to create temp dir");
        let store = SampleStoreSled::new(temp_dir.path().to_str().unwrap()).expect("open store");
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
        store.insert(&sample("tracker01", base, 1.0)).unwrap();

        let err = store
            .fetch("tracker01", base + Duration::hours(1), base + Duration::hours(2))
            .unwrap_err();
        assert_eq!(err.kind(), "no_data");
    }

    #[test]
    fn device_prefix_does_not_leak_into_longer_ids() {
        let temp_dir = tempdir().expect("failed to create temp dir");
        let store = SampleStoreSled::new(temp_dir.path().to_str().unwrap()).expect("open store");
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
        store.insert(&sample("tracker1", base, 1.0)).unwrap();
        store.insert(&sample("tracker10", base, 2.0)).unwrap();

        let got = store.fetch("tracker1", base - Duration::days(1), base + Duration::days(1)).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].power, 1.0);
    }
}
