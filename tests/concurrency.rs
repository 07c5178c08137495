// tests/concurrency.rs
mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use helio_forecast::config::PointerScope;
use helio_forecast::device_lease::DeviceLeases;
use helio_forecast::orchestrator::{RetrainOrchestrator, RetrainRequest};
use helio_forecast::run_ledger::{MemoryRunLedger, RunLedger};
use helio_forecast::sample_store::{MemorySampleStore, SampleStore};
use helio_forecast::version_store::VersionStore;

use common::{config, engine, recent_series};

/// Orchestrator sharing one pointer across devices, with its lease table exposed.
fn global_orchestrator(dir: &std::path::Path) -> (Arc<RetrainOrchestrator>, VersionStore, DeviceLeases) {
    let mut cfg = config(dir);
    cfg.storage.pointer_scope = PointerScope::Global;
    let mut samples = recent_series("tracker01", 200);
    samples.extend(recent_series("tracker02", 200));
    let samples = MemorySampleStore::with_samples(samples).expect("samples");
    let versions = VersionStore::new(&cfg.storage).expect("versions");
    let leases = DeviceLeases::new();
    let orchestrator = RetrainOrchestrator::new(
        Arc::new(samples) as Arc<dyn SampleStore>,
        versions.clone(),
        Arc::new(MemoryRunLedger::new()) as Arc<dyn RunLedger>,
        leases.clone(),
        cfg,
    );
    (Arc::new(orchestrator), versions, leases)
}

#[test]
fn same_device_runs_never_overlap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = engine(dir.path(), &recent_series("tracker01", 200));
    let orchestrator = Arc::clone(&state.orchestrator);

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            thread::spawn(move || orchestrator.retrain(&RetrainRequest::new("tracker01", 7, 15)))
        })
        .collect();
    let results: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().expect("worker thread"))
        .collect();

    for result in &results {
        assert!(
            result.success || result.error_kind.as_deref() == Some("retrain_in_progress"),
            "unexpected outcome: {result:?}"
        );
    }
    let winners: Vec<_> = results.iter().filter(|r| r.success).collect();
    assert!(!winners.is_empty());

    // the pointer names one of the successful versions and parses whole
    let pointer = state
        .versions
        .get_current_pointer("tracker01")
        .expect("read")
        .expect("pointer");
    assert!(winners.iter().any(|r| r.version.as_deref() == Some(pointer.version.as_str())));
    assert_eq!(state.versions.sweep_stale_temp_files().expect("sweep"), 0);
}

#[test]
fn different_devices_train_in_parallel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut samples = recent_series("tracker01", 200);
    samples.extend(recent_series("tracker02", 200));
    let state = engine(dir.path(), &samples);

    let workers: Vec<_> = ["tracker01", "tracker02"]
        .into_iter()
        .map(|device| {
            let orchestrator = Arc::clone(&state.orchestrator);
            thread::spawn(move || orchestrator.retrain(&RetrainRequest::new(device, 7, 15)))
        })
        .collect();

    for worker in workers {
        let result = worker.join().expect("worker thread");
        assert!(result.success, "{} failed: {:?}", result.device_id, result.error);
        assert!(state
            .versions
            .get_current_pointer(&result.device_id)
            .expect("read")
            .is_some());
    }
}

#[test]
fn lease_wait_times_out_with_retrain_in_progress() {
    let leases = DeviceLeases::new();
    let held = leases.acquire("tracker01", Duration::from_millis(10)).expect("first lease");

    let contender = leases.clone();
    let err = thread::spawn(move || contender.acquire("tracker01", Duration::from_millis(50)).map(|_| ()))
        .join()
        .expect("contender thread")
        .unwrap_err();
    assert_eq!(err.kind(), "retrain_in_progress");
    assert!(err.is_retryable());

    drop(held);
    assert!(!leases.is_held("tracker01"));
    assert!(leases.acquire("tracker01", Duration::from_millis(10)).is_ok());
}

#[test]
fn global_pointer_serialises_runs_across_devices() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (orchestrator, versions, leases) = global_orchestrator(dir.path());

    // a run for tracker01 holds the shared pointer
    let held = leases
        .acquire(&versions.lease_key("tracker01"), Duration::from_millis(10))
        .expect("lease");
    let blocked = orchestrator.retrain(&RetrainRequest::new("tracker02", 7, 15));
    assert!(!blocked.success);
    assert_eq!(blocked.error_kind.as_deref(), Some("retrain_in_progress"));
    assert!(blocked.error.as_deref().is_some_and(|e| e.contains("tracker02")));
    assert!(versions.get_current_pointer("tracker02").expect("read").is_none());

    drop(held);
    let result = orchestrator.retrain(&RetrainRequest::new("tracker02", 7, 15));
    assert!(result.success, "retrain failed: {:?}", result.error);
}

#[test]
fn global_pointer_names_a_winner_when_devices_race() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (orchestrator, versions, _leases) = global_orchestrator(dir.path());

    let workers: Vec<_> = ["tracker01", "tracker02"]
        .into_iter()
        .map(|device| {
            let orchestrator = Arc::clone(&orchestrator);
            thread::spawn(move || orchestrator.retrain(&RetrainRequest::new(device, 7, 15)))
        })
        .collect();
    let results: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().expect("worker thread"))
        .collect();

    for result in &results {
        assert!(
            result.success || result.error_kind.as_deref() == Some("retrain_in_progress"),
            "unexpected outcome: {result:?}"
        );
    }
    let promoted: Vec<_> = results
        .iter()
        .filter(|r| r.success && r.promoted == Some(true))
        .collect();
    assert!(!promoted.is_empty());

    let pointer = versions
        .get_current_pointer("tracker01")
        .expect("read")
        .expect("pointer");
    assert!(promoted.iter().any(|r| {
        r.device_id == pointer.device_id && r.version.as_deref() == Some(pointer.version.as_str())
    }));
    assert_eq!(versions.sweep_stale_temp_files().expect("sweep"), 0);
}
