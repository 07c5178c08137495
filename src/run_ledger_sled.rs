use chrono::{DateTime, Utc};
use sled::Db;
use tracing::warn;

use crate::errors::{ForecastError, ForecastResult};
use crate::run_ledger::{duplicate_run, RunLedger, RunPage, RunQuery, TrainingRun};

/// A sled-backed implementation of RunLedger.
///
/// `runs` maps run_id to the JSON record. `runs_by_time` maps
/// `ts ++ run_id` to run_id, where `ts` is the microsecond timestamp with the
/// sign bit flipped, big-endian, so a reverse scan is newest first.
pub struct RunLedgerSled {
    db: Db,
}

impl RunLedgerSled {
    pub fn new(path: &str) -> ForecastResult<Self> {
        let db = sled::open(path).map_err(|e| ForecastError::database("open run ledger", e))?;
        Ok(Self { db })
    }

    fn runs(&self) -> ForecastResult<sled::Tree> {
        self.db
            .open_tree("runs")
            .map_err(|e| ForecastError::database("open runs tree", e))
    }

    fn by_time(&self) -> ForecastResult<sled::Tree> {
        self.db
            .open_tree("runs_by_time")
            .map_err(|e| ForecastError::database("open runs_by_time tree", e))
    }

    fn time_key(trained_at: DateTime<Utc>, run_id: &str) -> Vec<u8> {
        let ordered = (trained_at.timestamp_micros() as u64) ^ (1u64 << 63);
        let mut key = Vec::with_capacity(8 + run_id.len());
        key.extend_from_slice(&ordered.to_be_bytes());
        key.extend_from_slice(run_id.as_bytes());
        key
    }

    fn decode(bytes: &[u8]) -> ForecastResult<TrainingRun> {
        serde_json::from_slice(bytes).map_err(|e| ForecastError::serialization("stored training run", e))
    }

    /// Walk runs newest first, stopping when `visit` returns false.
    fn scan_newest_first<F>(&self, mut visit: F) -> ForecastResult<()>
    where
        F: FnMut(TrainingRun) -> bool,
    {
        let runs = self.runs()?;
        for item in self.by_time()?.iter().rev() {
            let (_, run_id) = item?;
            let Some(bytes) = runs.get(&run_id)? else {
                // index entry outlived its record
                warn!(run_id = %String::from_utf8_lossy(&run_id), "dangling ledger index entry");
                continue;
            };
            if !visit(Self::decode(&bytes)?) {
                break;
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> ForecastResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl RunLedger for RunLedgerSled {
    fn append(&self, run: &TrainingRun) -> ForecastResult<()> {
        let bytes = serde_json::to_vec(run)?;
        let runs = self.runs()?;
        // insert only if absent
        if runs
            .compare_and_swap(run.run_id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .is_err()
        {
            return Err(duplicate_run(&run.run_id));
        }
        self.by_time()?
            .insert(Self::time_key(run.trained_at, &run.run_id), run.run_id.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn list(&self, query: &RunQuery) -> ForecastResult<RunPage> {
        let mut total = 0usize;
        let mut page = Vec::new();
        self.scan_newest_first(|run| {
            let wanted = query.device_id.as_deref().map_or(true, |d| d == run.device_id);
            if wanted {
                if total >= query.skip && page.len() < query.limit {
                    page.push(run);
                }
                total += 1;
            }
            true
        })?;
        Ok(RunPage { total, runs: page })
    }

    fn get(&self, run_id: &str) -> ForecastResult<Option<TrainingRun>> {
        match self.runs()?.get(run_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, run_id: &str) -> ForecastResult<bool> {
        let Some(bytes) = self.runs()?.remove(run_id.as_bytes())? else {
            return Ok(false);
        };
        let run = Self::decode(&bytes)?;
        self.by_time()?.remove(Self::time_key(run.trained_at, &run.run_id))?;
        self.db.flush()?;
        Ok(true)
    }

    fn latest_since(&self, device_id: &str, since: DateTime<Utc>) -> ForecastResult<Option<TrainingRun>> {
        let mut found = None;
        self.scan_newest_first(|run| {
            if run.trained_at < since {
                return false;
            }
            if run.device_id == device_id {
                found = Some(run);
                return false;
            }
            true
        })?;
        Ok(found)
    }
}
