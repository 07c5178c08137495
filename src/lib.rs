//! Library root for the `helio_forecast` crate
//! Model lifecycle engine for solar tracker forecasting

// Core error handling
pub mod errors;

// Configuration & CLI
pub mod cli;
pub mod config;
pub mod config_loader;

// Logging
pub mod log_sink;

// Telemetry samples & storage
pub mod sample;
pub mod sample_store;
pub mod sample_store_sled;

// Dataset preparation
pub mod data_cleaning;
pub mod feature_pipeline;
pub mod label_matcher;

// Model fitting & evaluation
pub mod regressor;
pub mod trainer;

// Versioning & promotion
pub mod promotion;
pub mod version_store;

// Run history
pub mod run_ledger;
pub mod run_ledger_sled;

// Retrain execution
pub mod device_lease;
pub mod orchestrator;
pub mod scheduler;
pub mod supervisor;

// Serving
pub mod forecaster;

// Wiring
pub mod app_state;


pub use app_state::AppState;
pub use config::ForecastConfig;
pub use errors::{ForecastError, ForecastResult};
pub use forecaster::{Forecast, Forecaster};
pub use orchestrator::{RetrainOrchestrator, RetrainRequest, RetrainResult};
pub use run_ledger::{RunLedger, TrainingRun};
pub use sample::Sample;
pub use sample_store::SampleStore;
pub use supervisor::{RetrainHandle, RetrainSupervisor};
pub use version_store::{CurrentPointer, VersionStore};
