//! Append-only audit trail of training attempts.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data_cleaning::CleaningStats;
use crate::errors::{ForecastError, ForecastResult, SafeReadLock, SafeWriteLock};
use crate::trainer::Metrics;

pub const DEFAULT_PAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::Failed => f.write_str("failed"),
        }
    }
}

/// One retraining attempt. Never updated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: String,
    pub device_id: String,
    pub days_requested: u32,
    pub horizon_minutes: u32,
    pub rows_used: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    pub features: Vec<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub promoted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaning: Option<CleaningStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_failures: Option<usize>,
    pub trained_at: DateTime<Utc>,
}

impl TrainingRun {
    /// Newest first; run id breaks ties so the order is total.
    pub fn newest_first(a: &TrainingRun, b: &TrainingRun) -> Ordering {
        b.trained_at
            .cmp(&a.trained_at)
            .then_with(|| b.run_id.cmp(&a.run_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunQuery {
    pub device_id: Option<String>,
    pub skip: usize,
    pub limit: usize,
}

impl Default for RunQuery {
    fn default() -> Self {
        Self {
            device_id: None,
            skip: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl RunQuery {
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, run: &TrainingRun) -> bool {
        self.device_id.as_deref().map_or(true, |d| d == run.device_id)
    }
}

/// One page of runs plus the number of runs matching the filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPage {
    pub total: usize,
    pub runs: Vec<TrainingRun>,
}

pub trait RunLedger: Send + Sync {
    /// Insert a new record; an existing `run_id` is never overwritten.
    fn append(&self, run: &TrainingRun) -> ForecastResult<()>;

    /// Matching runs sorted newest first, paginated.
    fn list(&self, query: &RunQuery) -> ForecastResult<RunPage>;

    fn get(&self, run_id: &str) -> ForecastResult<Option<TrainingRun>>;

    /// Remove a record. Model artifacts are not touched. Returns whether a
    /// record existed.
    fn delete(&self, run_id: &str) -> ForecastResult<bool>;

    /// Most recent run of `device_id` trained at or after `since`.
    fn latest_since(&self, device_id: &str, since: DateTime<Utc>) -> ForecastResult<Option<TrainingRun>>;
}

pub(crate) fn duplicate_run(run_id: &str) -> ForecastError {
    ForecastError::validation("run_id", format!("run {run_id} is already recorded"))
}

/// In-process ledger for tests and dry runs.
#[derive(Default)]
pub struct MemoryRunLedger {
    runs: RwLock<Vec<TrainingRun>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RunLedger for MemoryRunLedger {
    fn append(&self, run: &TrainingRun) -> ForecastResult<()> {
        let mut runs = self.runs.safe_write()?;
        if runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(duplicate_run(&run.run_id));
        }
        runs.push(run.clone());
        Ok(())
    }

    fn list(&self, query: &RunQuery) -> ForecastResult<RunPage> {
        let runs = self.runs.safe_read()?;
        let mut matching: Vec<&TrainingRun> = runs.iter().filter(|r| query.matches(r)).collect();
        matching.sort_by(|a, b| TrainingRun::newest_first(a, b));
        Ok(RunPage {
            total: matching.len(),
            runs: matching
                .into_iter()
                .skip(query.skip)
                .take(query.limit)
                .cloned()
                .collect(),
        })
    }

    fn get(&self, run_id: &str) -> ForecastResult<Option<TrainingRun>> {
        let runs = self.runs.safe_read()?;
        Ok(runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    fn delete(&self, run_id: &str) -> ForecastResult<bool> {
        let mut runs = self.runs.safe_write()?;
        let before = runs.len();
        runs.retain(|r| r.run_id != run_id);
        Ok(runs.len() != before)
    }

    fn latest_since(&self, device_id: &str, since: DateTime<Utc>) -> ForecastResult<Option<TrainingRun>> {
        let runs = self.runs.safe_read()?;
        Ok(runs
            .iter()
            .filter(|r| r.device_id == device_id && r.trained_at >= since)
            .min_by(|a, b| TrainingRun::newest_first(a, b))
            .cloned())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::run;
    use super::*;

    #[test]
    fn list_is_newest_first_and_paginated() {
        let ledger = MemoryRunLedger::new();
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            ledger.append(&run("tracker01", id, i as i64 * 10, RunStatus::Success)).unwrap();
        }
        ledger.append(&run("tracker02", "z", 0, RunStatus::Failed)).unwrap();

        let page = ledger
            .list(&RunQuery {
                device_id: Some("tracker01".into()),
                skip: 1,
                limit: 2,
            })
            .unwrap();
        assert_eq!(page.total, 4);
        let ids: Vec<&str> = page.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        assert_eq!(ledger.list(&RunQuery::default()).unwrap().total, 5);
    }

    #[test]
    fn append_refuses_duplicates_and_delete_reports_presence() {
        let ledger = MemoryRunLedger::new();
        let r = run("tracker01", "a", 0, RunStatus::Success);
        ledger.append(&r).unwrap();
        assert!(ledger.append(&r).is_err());
        assert_eq!(ledger.get("a").unwrap(), Some(r));
        assert!(ledger.delete("a").unwrap());
        assert!(!ledger.delete("a").unwrap());
        assert!(ledger.get("a").unwrap().is_none());
    }

    #[test]
    fn latest_since_respects_cutoff() {
        let ledger = MemoryRunLedger::new();
        ledger.append(&run("tracker01", "old", 600, RunStatus::Success)).unwrap();
        ledger.append(&run("tracker01", "new", 5, RunStatus::Failed)).unwrap();
        let cutoff = run("x", "x", 60, RunStatus::Success).trained_at;

        let latest = ledger.latest_since("tracker01", cutoff).unwrap().unwrap();
        assert_eq!(latest.run_id, "new");
        let none = ledger.latest_since("tracker01", cutoff + chrono::Duration::hours(2)).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn optional_fields_are_omitted_from_json() {
        let json = serde_json::to_value(run("tracker01", "a", 0, RunStatus::Failed)).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json.get("error").is_none());
        assert!(json.get("model_path").is_none());
    }

    #[test]
    fn features_are_required_on_read() {
        let mut json = serde_json::to_value(run("tracker01", "a", 0, RunStatus::Success)).unwrap();
        assert!(serde_json::from_value::<TrainingRun>(json.clone()).is_ok());

        json.as_object_mut().unwrap().remove("features");
        assert!(serde_json::from_value::<TrainingRun>(json).is_err());
    }
}
