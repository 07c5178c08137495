use std::sync::Arc;

use tracing::info;

use crate::config::ForecastConfig;
use crate::device_lease::DeviceLeases;
use crate::errors::{ForecastError, ForecastResult};
use crate::forecaster::Forecaster;
use crate::orchestrator::RetrainOrchestrator;
use crate::run_ledger::RunLedger;
use crate::run_ledger_sled::RunLedgerSled;
use crate::sample_store::SampleStore;
use crate::sample_store_sled::SampleStoreSled;
use crate::supervisor::RetrainSupervisor;
use crate::version_store::VersionStore;

/// Wired-up engine shared by the binaries.
pub struct AppState {
    pub config: ForecastConfig,
    pub samples: Arc<SampleStoreSled>,
    pub ledger: Arc<RunLedgerSled>,
    pub versions: VersionStore,
    pub orchestrator: Arc<RetrainOrchestrator>,
    pub supervisor: RetrainSupervisor,
    pub forecaster: Forecaster,
}

fn path_str(path: &std::path::Path) -> ForecastResult<&str> {
    path.to_str()
        .ok_or_else(|| ForecastError::config(format!("path {} is not valid UTF-8", path.display())))
}

impl AppState {
    /// Open the sled stores and version directory named by `config.storage`.
    pub fn open(config: ForecastConfig) -> ForecastResult<Self> {
        let storage = &config.storage;
        std::fs::create_dir_all(&storage.data_dir)
            .map_err(|e| ForecastError::io(format!("creating {}", storage.data_dir.display()), e))?;

        let samples = Arc::new(SampleStoreSled::new(path_str(&storage.samples_db)?)?);
        let ledger = Arc::new(RunLedgerSled::new(path_str(&storage.ledger_db)?)?);
        let versions = VersionStore::new(storage)?;

        let swept = versions.sweep_stale_temp_files()?;
        if swept > 0 {
            info!(swept, "recovered from an interrupted pointer update");
        }

        let orchestrator = Arc::new(RetrainOrchestrator::new(
            Arc::clone(&samples) as Arc<dyn SampleStore>,
            versions.clone(),
            Arc::clone(&ledger) as Arc<dyn RunLedger>,
            DeviceLeases::new(),
            config.clone(),
        ));
        let supervisor = RetrainSupervisor::with_completions(Arc::clone(&orchestrator), 16);
        let forecaster = Forecaster::new(versions.clone(), &config.pipeline);

        Ok(Self {
            config,
            samples,
            ledger,
            versions,
            orchestrator,
            supervisor,
            forecaster,
        })
    }
}
