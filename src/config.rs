// config.rs
// Purpose: Centralized runtime configuration for the forecasting lifecycle engine

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{ForecastError, ForecastResult};
use crate::sample::SensorField;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForecastConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub promotion: PromotionConfig,
    #[serde(default)]
    pub retrain: RetrainConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Whether the current pointer is shared by the whole deployment or kept per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerScope {
    Global,
    PerDevice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub versions_dir: PathBuf,
    pub current_pointer: PathBuf,
    pub pointer_scope: PointerScope,
    pub samples_db: PathBuf,
    pub ledger_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            versions_dir: data_dir.join("models").join("versions"),
            current_pointer: data_dir.join("models").join("current.json"),
            pointer_scope: PointerScope::PerDevice,
            samples_db: data_dir.join("samples.sled"),
            ledger_db: data_dir.join("runs.sled"),
            data_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub horizon_minutes: u32,
    pub tolerance_seconds: u32,
    pub rolling_window: usize,
    pub min_labeled_samples: usize,
    pub target: SensorField,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            horizon_minutes: 15,
            tolerance_seconds: 30,
            rolling_window: 5,
            min_labeled_samples: 100,
            target: SensorField::Power,
        }
    }
}

impl PipelineConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::seconds(i64::from(self.tolerance_seconds))
    }
}

/// Plausibility ranges applied before feature engineering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningConfig {
    pub enabled: bool,
    pub online_only: bool,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub min_lux: f64,
    pub min_voltage: f64,
    pub min_current: f64,
    pub min_power: f64,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            online_only: true,
            min_temperature: 0.0,
            max_temperature: 60.0,
            min_lux: 0.0,
            min_voltage: 0.0,
            min_current: 0.0,
            min_power: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Forest,
    Linear,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Forest => "forest",
            ModelKind::Linear => "linear",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 15,
            min_samples_split: 10,
            min_samples_leaf: 4,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub train_fraction: f64,
    pub model_kind: ModelKind,
    pub ridge: f64,
    #[serde(default)]
    pub forest: ForestParams,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_fraction: 0.8,
            model_kind: ModelKind::Forest,
            ridge: 1e-6,
            forest: ForestParams::default(),
        }
    }
}

/// Which error metric gates promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMetric {
    Mae,
    Rmse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    pub mae_threshold_percent: f64,
    pub gate_metric: GateMetric,
    pub min_r2: Option<f64>,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            mae_threshold_percent: 5.0,
            gate_metric: GateMetric::Mae,
            min_r2: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainConfig {
    pub default_days: u32,
    pub lease_timeout_ms: u64,
    pub retrain_time: String,
    pub check_interval_secs: u64,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            default_days: 7,
            lease_timeout_ms: 2_000,
            retrain_time: "18:30".to_string(),
            check_interval_secs: 60,
        }
    }
}

impl RetrainConfig {
    pub fn lease_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lease_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ForecastConfig {
    /// Root all relative storage paths under `data_dir`.
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            storage: StorageConfig {
                versions_dir: data_dir.join("models").join("versions"),
                current_pointer: data_dir.join("models").join("current.json"),
                pointer_scope: PointerScope::PerDevice,
                samples_db: data_dir.join("samples.sled"),
                ledger_db: data_dir.join("runs.sled"),
                data_dir,
            },
            ..Self::default()
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ForecastResult<()> {
        let p = &self.pipeline;
        if p.horizon_minutes == 0 {
            return Err(ForecastError::config("pipeline.horizon_minutes must be positive"));
        }
        if i64::from(p.tolerance_seconds) >= i64::from(p.horizon_minutes) * 60 {
            return Err(ForecastError::config(
                "pipeline.tolerance_seconds must be shorter than the horizon",
            ));
        }
        if p.rolling_window == 0 {
            return Err(ForecastError::config("pipeline.rolling_window must be at least 1"));
        }
        if p.min_labeled_samples < 2 {
            return Err(ForecastError::config(
                "pipeline.min_labeled_samples must be at least 2",
            ));
        }

        let t = &self.training;
        if !(t.train_fraction > 0.0 && t.train_fraction < 1.0) {
            return Err(ForecastError::config(
                "training.train_fraction must be strictly between 0 and 1",
            ));
        }
        if t.forest.n_trees == 0 || t.forest.max_depth == 0 {
            return Err(ForecastError::config(
                "training.forest needs at least one tree of depth 1",
            ));
        }
        if t.forest.min_samples_leaf == 0 {
            return Err(ForecastError::config("training.forest.min_samples_leaf must be at least 1"));
        }
        if !(t.ridge.is_finite() && t.ridge >= 0.0) {
            return Err(ForecastError::config("training.ridge must be a non-negative number"));
        }

        let promo = &self.promotion;
        if !promo.mae_threshold_percent.is_finite() {
            return Err(ForecastError::config(
                "promotion.mae_threshold_percent must be finite",
            ));
        }
        if let Some(min_r2) = promo.min_r2 {
            if !min_r2.is_finite() {
                return Err(ForecastError::config("promotion.min_r2 must be finite"));
            }
        }

        crate::scheduler::DailySchedule::parse(&self.retrain.retrain_time)
            .map_err(|e| ForecastError::config(format!("retrain.retrain_time: {e}")))?;
        if self.retrain.check_interval_secs == 0 {
            return Err(ForecastError::config("retrain.check_interval_secs must be positive"));
        }
        if self.retrain.default_days == 0 {
            return Err(ForecastError::config("retrain.default_days must be positive"));
        }

        crate::log_sink::parse_level(&self.logging.level)
            .map_err(|e| ForecastError::config(format!("logging.level: {e}")))?;
        Ok(())
    }
}
