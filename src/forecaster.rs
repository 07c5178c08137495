//! Serving-side predictions from each device's current model.
//!
//! The current pointer is consulted on every request. Loaded models are
//! cached per device and reused only while the pointer still names the same
//! version, so a promotion or rollback takes effect on the next call.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::errors::{ForecastError, ForecastResult, SafeReadLock, SafeWriteLock};
use crate::feature_pipeline::{build_features, feature_names};
use crate::regressor::FittedModel;
use crate::sample::{Sample, SensorField};
use crate::version_store::{ModelMetadata, VersionStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub device_id: String,
    pub target: SensorField,
    pub current_value: f64,
    pub predicted_value: f64,
    pub confidence: f64,
    pub model_version: String,
    pub horizon_minutes: u32,
    pub predicted_at: DateTime<Utc>,
}

#[derive(Clone)]
struct CachedModel {
    version: String,
    model: Arc<FittedModel>,
    metadata: Arc<ModelMetadata>,
}

pub struct Forecaster {
    versions: VersionStore,
    rolling_window: usize,
    target: SensorField,
    cache: RwLock<HashMap<String, CachedModel>>,
}

impl Forecaster {
    pub fn new(versions: VersionStore, pipeline: &PipelineConfig) -> Self {
        Self {
            versions,
            rolling_window: pipeline.rolling_window,
            target: pipeline.target,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Version currently held in the cache for `device_id`, if any.
    pub fn cached_version(&self, device_id: &str) -> ForecastResult<Option<String>> {
        Ok(self.cache.safe_read()?.get(device_id).map(|c| c.version.clone()))
    }

    pub fn invalidate(&self, device_id: &str) -> ForecastResult<()> {
        self.cache.safe_write()?.remove(device_id);
        Ok(())
    }

    fn model_for(&self, device_id: &str) -> ForecastResult<CachedModel> {
        let pointer = self
            .versions
            .get_current_pointer(device_id)?
            .ok_or_else(|| ForecastError::not_found("current_model", device_id))?;

        if let Some(hit) = self.cache.safe_read()?.get(device_id) {
            if hit.version == pointer.version {
                return Ok(hit.clone());
            }
        }

        let owner = if pointer.device_id.is_empty() {
            device_id
        } else {
            pointer.device_id.as_str()
        };
        let (model, metadata) = self.versions.load_version(owner, &pointer.version)?;
        if metadata.features != feature_names() {
            return Err(ForecastError::validation(
                "features",
                format!("model {} was trained on a different feature layout", pointer.version),
            ));
        }

        let entry = CachedModel {
            version: pointer.version.clone(),
            model: Arc::new(model),
            metadata: Arc::new(metadata),
        };
        self.cache
            .safe_write()?
            .insert(device_id.to_string(), entry.clone());
        debug!(device_id = %device_id, version = %entry.version, "model loaded into cache");
        Ok(entry)
    }

    /// Predict the target `horizon` ahead of the newest of `recent`.
    ///
    /// `recent` must be ascending by timestamp; the trailing rolling window
    /// is computed over it, so pass at least the window length of samples.
    pub fn forecast(&self, device_id: &str, recent: &[Sample]) -> ForecastResult<Forecast> {
        let Some(last) = recent.last() else {
            return Err(ForecastError::validation("samples", "at least one recent sample is required"));
        };
        if let Some(other) = recent.iter().find(|s| s.device_id != device_id) {
            return Err(ForecastError::validation(
                "samples",
                format!("sample from device {} in request for {device_id}", other.device_id),
            ));
        }

        let cached = self.model_for(device_id)?;
        let features = build_features(recent, self.rolling_window)?;
        let row = features
            .last()
            .map(|f| f.values())
            .ok_or_else(|| ForecastError::internal("feature pipeline returned no vectors"))?;
        let predicted_value = cached.model.predict(&row)?;

        let current_value = last.value(self.target);
        let mae = cached.metadata.metrics.mae;
        let confidence = (1.0 - mae / (current_value + 1e-6)).clamp(0.0, 1.0);

        Ok(Forecast {
            device_id: device_id.to_string(),
            target: self.target,
            current_value,
            predicted_value,
            confidence: if confidence.is_finite() { confidence } else { 0.0 },
            model_version: cached.version.clone(),
            horizon_minutes: cached.metadata.horizon_minutes,
            predicted_at: Utc::now(),
        })
    }
}
