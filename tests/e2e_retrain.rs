// tests/e2e_retrain.rs
mod common;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use helio_forecast::device_lease::DeviceLeases;
use helio_forecast::errors::{ForecastError, ForecastResult};
use helio_forecast::orchestrator::{RetrainOrchestrator, RetrainRequest};
use helio_forecast::run_ledger::{RunLedger, RunPage, RunQuery, RunStatus, TrainingRun};
use helio_forecast::sample_store::{MemorySampleStore, SampleStore};
use helio_forecast::version_store::{MetricsSnapshot, SavedVersion, VersionStore};

use common::{config, engine, recent_series};

fn request() -> RetrainRequest {
    RetrainRequest::new("tracker01", 7, 15)
}

#[test]
fn first_retrain_trains_promotes_and_logs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 200));

    let result = state.orchestrator.retrain(&request());
    assert!(result.success, "retrain failed: {:?}", result.error);
    assert_eq!(result.rows_used, Some(185));
    let metrics = result.metrics.clone().expect("metrics");
    assert_eq!((metrics.train_samples, metrics.test_samples), (148, 37));
    assert!(metrics.mae.is_finite() && metrics.mae >= 0.0);
    assert_eq!(result.promoted, Some(true));
    assert_eq!(
        result.promotion_reason.as_deref(),
        Some("no baseline: no current model exists")
    );

    let version = result.version.clone().expect("version");
    let model_path = result.model_path.clone().expect("model path");
    assert!(model_path.exists());

    let pointer = state
        .versions
        .get_current_pointer("tracker01")
        .expect("pointer read")
        .expect("pointer written");
    assert_eq!(pointer.version, version);
    assert_eq!(pointer.metrics.mae, Some(metrics.mae));

    let run = state.ledger.get(&result.run_id).expect("ledger read").expect("run recorded");
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.promoted);
    assert_eq!(run.rows_used, 185);
    assert_eq!(run.match_failures, Some(15));
    assert_eq!(run.features.len(), 15);
    assert_eq!(run.cleaning.as_ref().map(|c| c.retained), Some(200));
    assert_eq!(run.version.as_deref(), Some(version.as_str()));
}

#[test]
fn identical_retrain_is_within_threshold() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 200));

    let first = state.orchestrator.retrain(&request());
    assert!(first.success, "first retrain failed: {:?}", first.error);
    let second = state.orchestrator.retrain(&request());
    assert!(second.success, "second retrain failed: {:?}", second.error);

    assert_eq!(second.promoted, Some(true));
    let reason = second.promotion_reason.expect("reason");
    assert!(reason.contains("within 5% threshold"), "unexpected reason: {reason}");

    let pointer = state.versions.get_current_pointer("tracker01").expect("read").expect("pointer");
    assert_eq!(Some(pointer.version), second.version);
    assert_eq!(state.versions.list_versions("tracker01").expect("list").len(), 2);
}

#[test]
fn worse_candidate_keeps_the_current_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 200));

    let first = state.orchestrator.retrain(&request());
    assert!(first.success, "first retrain failed: {:?}", first.error);
    let v1 = first.version.clone().expect("version");

    // pretend the active model was nearly perfect
    let saved = SavedVersion {
        version: v1.clone(),
        model_path: state.versions.model_path("tracker01", &v1),
        metadata_path: state.versions.metadata_path("tracker01", &v1),
        sha256: String::new(),
    };
    let snapshot = MetricsSnapshot {
        mae: Some(1e-9),
        ..MetricsSnapshot::default()
    };
    state
        .versions
        .update_current_pointer("tracker01", &saved, snapshot)
        .expect("rewrite pointer");

    let second = state.orchestrator.retrain(&request());
    assert!(second.success, "second retrain failed: {:?}", second.error);
    assert_eq!(second.promoted, Some(false));
    assert!(second
        .promotion_reason
        .as_deref()
        .is_some_and(|r| r.starts_with("new model is worse (mae increased by")));

    let pointer = state.versions.get_current_pointer("tracker01").expect("read").expect("pointer");
    assert_eq!(pointer.version, v1);
    // the rejected candidate is still kept on disk
    assert!(second.model_path.expect("candidate path").exists());
}

#[test]
fn missing_data_fails_and_is_still_recorded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 200));

    let result = state.orchestrator.retrain(&RetrainRequest::new("tracker09", 7, 15));
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("no_data"));
    assert_eq!(result.promoted, Some(false));

    let run = state.ledger.get(&result.run_id).expect("ledger read").expect("run recorded");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_kind.as_deref(), Some("no_data"));
    assert!(run.version.is_none());
    assert!(state.versions.get_current_pointer("tracker09").expect("read").is_none());
}

#[test]
fn too_few_samples_report_the_shortfall() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 60));

    let result = state.orchestrator.retrain(&request());
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("insufficient_labeled_samples"));
    let error = result.error.expect("error message");
    assert!(error.contains("45"), "unexpected error: {error}");

    let page = state.ledger.list(&RunQuery::for_device("tracker01")).expect("list");
    assert_eq!(page.total, 1);
    assert_eq!(page.runs[0].match_failures, Some(15));
    assert_eq!(page.runs[0].cleaning.as_ref().map(|c| c.retained), Some(60));
}

#[test]
fn invalid_requests_are_rejected_but_logged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 200));

    let result = state.orchestrator.retrain(&RetrainRequest::new("tracker01", 91, 15));
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("validation"));
    assert!(state.ledger.get(&result.run_id).expect("read").is_some());
}

#[test]
fn dry_run_writes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 200));

    let report = state.orchestrator.dry_run(&request()).expect("dry run");
    assert_eq!(report.labeled, 185);
    assert_eq!((report.train_samples, report.test_samples), (148, 37));
    assert_eq!(report.match_failures, 15);

    assert_eq!(state.ledger.list(&RunQuery::default()).expect("list").total, 0);
    assert!(state.versions.list_versions("tracker01").expect("list").is_empty());
}

#[test]
fn deleting_a_run_keeps_its_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 200));

    let result = state.orchestrator.retrain(&request());
    assert!(result.success, "retrain failed: {:?}", result.error);

    assert!(state.ledger.delete(&result.run_id).expect("delete"));
    assert!(!state.ledger.delete(&result.run_id).expect("second delete"));
    assert!(state.ledger.get(&result.run_id).expect("read").is_none());
    assert!(result.model_path.expect("path").exists());
}

struct BrokenLedger;

impl RunLedger for BrokenLedger {
    fn append(&self, _run: &TrainingRun) -> ForecastResult<()> {
        Err(ForecastError::internal("ledger offline"))
    }

    fn list(&self, _query: &RunQuery) -> ForecastResult<RunPage> {
        Err(ForecastError::internal("ledger offline"))
    }

    fn get(&self, _run_id: &str) -> ForecastResult<Option<TrainingRun>> {
        Err(ForecastError::internal("ledger offline"))
    }

    fn delete(&self, _run_id: &str) -> ForecastResult<bool> {
        Err(ForecastError::internal("ledger offline"))
    }

    fn latest_since(&self, _device_id: &str, _since: DateTime<Utc>) -> ForecastResult<Option<TrainingRun>> {
        Err(ForecastError::internal("ledger offline"))
    }
}

#[test]
fn ledger_outage_does_not_fail_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let samples = MemorySampleStore::with_samples(recent_series("tracker01", 200)).expect("samples");
    let versions = VersionStore::new(&cfg.storage).expect("versions");
    let orchestrator = RetrainOrchestrator::new(
        Arc::new(samples) as Arc<dyn SampleStore>,
        versions.clone(),
        Arc::new(BrokenLedger) as Arc<dyn RunLedger>,
        DeviceLeases::new(),
        cfg,
    );

    let result = orchestrator.retrain(&request());
    assert!(result.success, "retrain failed: {:?}", result.error);
    assert!(versions.get_current_pointer("tracker01").expect("read").is_some());
}
