// version_store.rs
// Purpose: Immutable model versions on disk plus the atomically replaced current pointer

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{GateMetric, ModelKind, PointerScope, StorageConfig};
use crate::errors::{ForecastError, ForecastResult};
use crate::regressor::FittedModel;
use crate::sample::validate_device_id;
use crate::trainer::Metrics;

const MODEL_SUFFIX: &str = ".model.json";
const META_SUFFIX: &str = ".meta.json";
const TEMP_SUFFIX: &str = ".tmp";
/// Never a valid device id, so it cannot collide with a per-device key.
const GLOBAL_LEASE_KEY: &str = "*global*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub version: String,
    pub device_id: String,
    pub model_kind: ModelKind,
    pub features: Vec<String>,
    pub metrics: Metrics,
    pub trained_at: DateTime<Utc>,
    pub rows_used: usize,
    pub days_used: u32,
    pub horizon_minutes: u32,
    pub run_id: String,
    /// Filled in by the store when the artifact is written.
    #[serde(default)]
    pub artifact_sha256: String,
}

/// Metric snapshot carried by the pointer.
///
/// Fields are optional so a pointer written without a metric can still be
/// read; promotion then treats the baseline as lacking that metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mae: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmse: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_samples: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_samples: Option<usize>,
}

impl MetricsSnapshot {
    pub fn get(&self, metric: GateMetric) -> Option<f64> {
        match metric {
            GateMetric::Mae => self.mae,
            GateMetric::Rmse => self.rmse,
        }
    }
}

impl From<&Metrics> for MetricsSnapshot {
    fn from(m: &Metrics) -> Self {
        Self {
            mae: Some(m.mae),
            rmse: Some(m.rmse),
            r2: Some(m.r2),
            train_samples: Some(m.train_samples),
            test_samples: Some(m.test_samples),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub model_path: PathBuf,
    pub metadata_path: PathBuf,
    pub version: String,
    pub device_id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metrics: MetricsSnapshot,
}

/// Paths of a freshly written version.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedVersion {
    pub version: String,
    pub model_path: PathBuf,
    pub metadata_path: PathBuf,
    pub sha256: String,
}

/// Sortable version id derived from the attempt start time.
pub fn version_id(started_at: DateTime<Utc>) -> String {
    started_at.format("%Y%m%d_%H%M%S_%6f").to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn looks_like_version(s: &str) -> bool {
    // YYYYMMDD_HHMMSS_ffffff
    s.len() == 22
        && s.bytes().enumerate().all(|(i, b)| match i {
            8 | 15 => b == b'_',
            _ => b.is_ascii_digit(),
        })
}

/// Create `path` exclusively and write `bytes` durably.
fn write_new_file(path: &Path, bytes: &[u8], version: &str) -> ForecastResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => ForecastError::VersionCollision {
                version: version.to_string(),
            },
            _ => ForecastError::io(format!("creating {}", path.display()), e),
        })?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| ForecastError::io(format!("writing {}", path.display()), e))
}

fn sync_dir(dir: &Path) {
    // Directory fsync is not available everywhere; the rename itself is atomic.
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            debug!(dir = %dir.display(), error = %e, "directory fsync skipped");
        }
    }
}

/// Filesystem-backed store of model versions and current pointers.
#[derive(Debug, Clone)]
pub struct VersionStore {
    versions_dir: PathBuf,
    pointer_path: PathBuf,
    scope: PointerScope,
}

impl VersionStore {
    pub fn new(cfg: &StorageConfig) -> ForecastResult<Self> {
        Self::open(&cfg.versions_dir, &cfg.current_pointer, cfg.pointer_scope)
    }

    pub fn open(versions_dir: &Path, pointer_path: &Path, scope: PointerScope) -> ForecastResult<Self> {
        fs::create_dir_all(versions_dir)
            .map_err(|e| ForecastError::io(format!("creating {}", versions_dir.display()), e))?;
        if let Some(parent) = pointer_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ForecastError::io(format!("creating {}", parent.display()), e))?;
        }
        Ok(Self {
            versions_dir: versions_dir.to_path_buf(),
            pointer_path: pointer_path.to_path_buf(),
            scope,
        })
    }

    pub fn versions_dir(&self) -> &Path {
        &self.versions_dir
    }

    pub fn model_path(&self, device_id: &str, version: &str) -> PathBuf {
        self.versions_dir.join(format!("{device_id}_{version}{MODEL_SUFFIX}"))
    }

    pub fn metadata_path(&self, device_id: &str, version: &str) -> PathBuf {
        self.versions_dir.join(format!("{device_id}_{version}{META_SUFFIX}"))
    }

    /// Lease key guarding the pointer `device_id` resolves to. Every device
    /// shares one key under [`PointerScope::Global`].
    pub fn lease_key(&self, device_id: &str) -> String {
        match self.scope {
            PointerScope::Global => GLOBAL_LEASE_KEY.to_string(),
            PointerScope::PerDevice => device_id.to_string(),
        }
    }

    /// Pointer file consulted for `device_id` under the configured scope.
    pub fn pointer_path(&self, device_id: &str) -> PathBuf {
        match self.scope {
            PointerScope::Global => self.pointer_path.clone(),
            PointerScope::PerDevice => {
                let name = self
                    .pointer_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "current.json".to_string());
                self.pointer_path.with_file_name(format!("{device_id}_{name}"))
            }
        }
    }

    fn pointer_dir(&self) -> PathBuf {
        match self.pointer_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Write the artifact and its metadata under `metadata.version`.
    ///
    /// Neither file may already exist. The metadata file is written last, so
    /// a version only becomes listable once its artifact is complete.
    pub fn save_version(&self, model: &FittedModel, mut metadata: ModelMetadata) -> ForecastResult<SavedVersion> {
        validate_device_id(&metadata.device_id)?;
        let version = metadata.version.clone();
        let model_path = self.model_path(&metadata.device_id, &version);
        let metadata_path = self.metadata_path(&metadata.device_id, &version);

        if metadata_path.exists() {
            return Err(ForecastError::VersionCollision { version });
        }

        let artifact = serde_json::to_vec(model)
            .map_err(|e| ForecastError::serialization("model artifact", e))?;
        let sha256 = sha256_hex(&artifact);
        write_new_file(&model_path, &artifact, &version)?;

        metadata.artifact_sha256 = sha256.clone();
        let meta_bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| ForecastError::serialization("model metadata", e))?;
        write_new_file(&metadata_path, &meta_bytes, &version)?;
        sync_dir(&self.versions_dir);

        info!(
            device_id = %metadata.device_id,
            version = %version,
            sha256 = %sha256,
            "model version saved"
        );
        Ok(SavedVersion {
            version,
            model_path,
            metadata_path,
            sha256,
        })
    }

    /// Current pointer for `device_id`, or `None` if nothing was ever promoted.
    ///
    /// A pointer that exists but does not parse is an error, never `None`.
    pub fn get_current_pointer(&self, device_id: &str) -> ForecastResult<Option<CurrentPointer>> {
        let path = self.pointer_path(device_id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ForecastError::io(format!("reading {}", path.display()), e)),
        };
        let pointer = serde_json::from_slice(&bytes).map_err(|e| {
            ForecastError::serialization(format!("current pointer {}", path.display()), e)
        })?;
        Ok(Some(pointer))
    }

    /// Atomically repoint `device_id` at `saved`.
    ///
    /// The document goes to a uniquely named temp file in the pointer's
    /// directory, is fsynced, and is then renamed over the pointer. Readers
    /// see the old pointer or the new one, whole.
    pub fn update_current_pointer(
        &self,
        device_id: &str,
        saved: &SavedVersion,
        metrics: MetricsSnapshot,
    ) -> ForecastResult<CurrentPointer> {
        let pointer = CurrentPointer {
            model_path: saved.model_path.clone(),
            metadata_path: saved.metadata_path.clone(),
            version: saved.version.clone(),
            device_id: device_id.to_string(),
            updated_at: Utc::now(),
            metrics,
        };
        let bytes = serde_json::to_vec_pretty(&pointer)
            .map_err(|e| ForecastError::serialization("current pointer", e))?;

        let target = self.pointer_path(device_id);
        let temp = self.temp_path_for(&target);
        write_new_file(&temp, &bytes, &saved.version)?;

        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(ForecastError::io(format!("replacing {}", target.display()), e));
        }
        sync_dir(&self.pointer_dir());

        info!(device_id = %device_id, version = %pointer.version, "current pointer updated");
        Ok(pointer)
    }

    fn temp_path_for(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.pointer_dir()
            .join(format!(".{name}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple()))
    }

    pub fn read_metadata(&self, device_id: &str, version: &str) -> ForecastResult<ModelMetadata> {
        let path = self.metadata_path(device_id, version);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ForecastError::not_found("model_version", format!("{device_id}/{version}")),
            _ => ForecastError::io(format!("reading {}", path.display()), e),
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ForecastError::serialization(format!("metadata {}", path.display()), e))
    }

    /// Load a saved model, verifying its checksum against the metadata.
    pub fn load_version(&self, device_id: &str, version: &str) -> ForecastResult<(FittedModel, ModelMetadata)> {
        let metadata = self.read_metadata(device_id, version)?;
        let path = self.model_path(device_id, version);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ForecastError::not_found("model_artifact", path.display().to_string()),
            _ => ForecastError::io(format!("reading {}", path.display()), e),
        })?;

        let actual = sha256_hex(&bytes);
        if !metadata.artifact_sha256.is_empty() && actual != metadata.artifact_sha256 {
            return Err(ForecastError::validation(
                "artifact_sha256",
                format!("{} does not match its recorded checksum", path.display()),
            ));
        }
        let model = serde_json::from_slice(&bytes)
            .map_err(|e| ForecastError::serialization(format!("model {}", path.display()), e))?;
        Ok((model, metadata))
    }

    /// Saved versions of `device_id`, oldest first.
    pub fn list_versions(&self, device_id: &str) -> ForecastResult<Vec<ModelMetadata>> {
        validate_device_id(device_id)?;
        let prefix = format!("{device_id}_");
        let entries = fs::read_dir(&self.versions_dir)
            .map_err(|e| ForecastError::io(format!("listing {}", self.versions_dir.display()), e))?;

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ForecastError::io("reading directory entry", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(META_SUFFIX))
            else {
                continue;
            };
            if !looks_like_version(version) {
                continue;
            }
            match self.read_metadata(device_id, version) {
                Ok(meta) if meta.device_id == device_id => versions.push(meta),
                Ok(_) => {}
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable metadata"),
            }
        }
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(versions)
    }

    /// Point `device_id` back at a previously saved version.
    pub fn activate_version(&self, device_id: &str, version: &str) -> ForecastResult<CurrentPointer> {
        validate_device_id(device_id)?;
        let (_, metadata) = self.load_version(device_id, version)?;
        let saved = SavedVersion {
            version: metadata.version.clone(),
            model_path: self.model_path(device_id, version),
            metadata_path: self.metadata_path(device_id, version),
            sha256: metadata.artifact_sha256.clone(),
        };
        self.update_current_pointer(device_id, &saved, MetricsSnapshot::from(&metadata.metrics))
    }

    /// Remove pointer temp files orphaned by an interrupted update.
    ///
    /// Returns how many were removed. Pointer files themselves are never touched.
    pub fn sweep_stale_temp_files(&self) -> ForecastResult<usize> {
        let dir = self.pointer_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ForecastError::io(format!("listing {}", dir.display()), e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| ForecastError::io("reading directory entry", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
                fs::remove_file(entry.path())
                    .map_err(|e| ForecastError::io(format!("removing {name}"), e))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, dir = %dir.display(), "stale pointer temp files removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regressor::LinearModel;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn tiny_model() -> FittedModel {
        FittedModel::Linear(LinearModel {
            means: vec![0.0],
            scales: vec![1.0],
            coefficients: vec![2.0],
            intercept: 1.0,
        })
    }

    fn metadata(device: &str, version: &str, mae: f64) -> ModelMetadata {
        ModelMetadata {
            version: version.to_string(),
            device_id: device.to_string(),
            model_kind: ModelKind::Linear,
            features: vec!["x".into()],
            metrics: Metrics {
                mae,
                rmse: mae * 1.2,
                r2: 0.8,
                train_samples: 80,
                test_samples: 20,
            },
            trained_at: Utc::now(),
            rows_used: 100,
            days_used: 7,
            horizon_minutes: 15,
            run_id: "run".into(),
            artifact_sha256: String::new(),
        }
    }

    fn store(dir: &Path, scope: PointerScope) -> VersionStore {
        VersionStore::open(&dir.join("versions"), &dir.join("current.json"), scope).unwrap()
    }

    #[test]
    fn version_ids_sort_by_time() {
        let a = version_id(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
        let b = version_id(Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap());
        assert_eq!(a, "20250102_030405_000000");
        assert!(looks_like_version(&a));
        assert!(a < b);
    }

    #[test]
    fn save_never_overwrites() {
        let dir = tempdir().unwrap();
        let vs = store(dir.path(), PointerScope::PerDevice);
        vs.save_version(&tiny_model(), metadata("tracker01", "20250102_030405_000000", 1.0))
            .unwrap();
        let err = vs
            .save_version(&tiny_model(), metadata("tracker01", "20250102_030405_000000", 2.0))
            .unwrap_err();
        assert_eq!(err.kind(), "version_collision");
    }

    #[test]
    fn pointer_absent_until_promoted() {
        let dir = tempdir().unwrap();
        let vs = store(dir.path(), PointerScope::PerDevice);
        assert!(vs.get_current_pointer("tracker01").unwrap().is_none());

        let saved = vs
            .save_version(&tiny_model(), metadata("tracker01", "20250102_030405_000000", 1.5))
            .unwrap();
        let meta = vs.read_metadata("tracker01", &saved.version).unwrap();
        vs.update_current_pointer("tracker01", &saved, MetricsSnapshot::from(&meta.metrics))
            .unwrap();

        let pointer = vs.get_current_pointer("tracker01").unwrap().unwrap();
        assert_eq!(pointer.version, saved.version);
        assert_eq!(pointer.metrics.mae, Some(1.5));
        assert!(vs.get_current_pointer("tracker02").unwrap().is_none());
    }

    #[test]
    fn global_scope_shares_one_pointer() {
        let dir = tempdir().unwrap();
        let vs = store(dir.path(), PointerScope::Global);
        let saved = vs
            .save_version(&tiny_model(), metadata("tracker01", "20250102_030405_000000", 1.0))
            .unwrap();
        vs.update_current_pointer("tracker01", &saved, MetricsSnapshot::default())
            .unwrap();
        assert!(vs.get_current_pointer("tracker02").unwrap().is_some());
        assert_eq!(vs.pointer_path("x"), dir.path().join("current.json"));
    }

    #[test]
    fn lease_key_follows_pointer_scope() {
        let dir = tempdir().unwrap();
        let per_device = store(dir.path(), PointerScope::PerDevice);
        assert_ne!(per_device.lease_key("tracker01"), per_device.lease_key("tracker02"));
        assert_eq!(per_device.lease_key("tracker01"), "tracker01");

        let global = store(dir.path(), PointerScope::Global);
        assert_eq!(global.lease_key("tracker01"), global.lease_key("tracker02"));
        assert!(validate_device_id(&global.lease_key("tracker01")).is_err());
    }

    #[test]
    fn pointer_without_device_id_is_rejected() {
        let dir = tempdir().unwrap();
        let vs = store(dir.path(), PointerScope::PerDevice);
        let doc = serde_json::json!({
            "model_path": "/data/models/tracker01_20250102_030405_000000.model.json",
            "metadata_path": "/data/models/tracker01_20250102_030405_000000.meta.json",
            "version": "20250102_030405_000000",
            "updated_at": "2025-01-02T03:04:05Z",
            "metrics": { "mae": 1.0 }
        });
        fs::write(vs.pointer_path("tracker01"), doc.to_string()).unwrap();
        let err = vs.get_current_pointer("tracker01").unwrap_err();
        assert_eq!(err.kind(), "serialization");

        // metrics alone may be missing
        let mut doc = doc;
        doc["device_id"] = "tracker01".into();
        doc.as_object_mut().unwrap().remove("metrics");
        fs::write(vs.pointer_path("tracker01"), doc.to_string()).unwrap();
        let pointer = vs.get_current_pointer("tracker01").unwrap().unwrap();
        assert_eq!(pointer.metrics, MetricsSnapshot::default());
    }

    #[test]
    fn corrupt_pointer_is_an_error() {
        let dir = tempdir().unwrap();
        let vs = store(dir.path(), PointerScope::PerDevice);
        fs::write(vs.pointer_path("tracker01"), b"{\"model_path\":").unwrap();
        let err = vs.get_current_pointer("tracker01").unwrap_err();
        assert_eq!(err.kind(), "serialization");
    }

    #[test]
    fn load_detects_tampered_artifact() {
        let dir = tempdir().unwrap();
        let vs = store(dir.path(), PointerScope::PerDevice);
        let saved = vs
            .save_version(&tiny_model(), metadata("tracker01", "20250102_030405_000000", 1.0))
            .unwrap();
        let (model, meta) = vs.load_version("tracker01", &saved.version).unwrap();
        assert_eq!(model, tiny_model());
        assert_eq!(meta.artifact_sha256, saved.sha256);

        fs::write(&saved.model_path, b"{\"kind\":\"linear\"}").unwrap();
        assert!(vs.load_version("tracker01", &saved.version).is_err());
    }

    #[test]
    fn list_and_activate_previous_version() {
        let dir = tempdir().unwrap();
        let vs = store(dir.path(), PointerScope::PerDevice);
        for (v, mae) in [("20250101_000000_000000", 3.0), ("20250102_000000_000000", 2.0)] {
            let saved = vs.save_version(&tiny_model(), metadata("tracker1", v, mae)).unwrap();
            vs.update_current_pointer("tracker1", &saved, MetricsSnapshot::default())
                .unwrap();
        }
        vs.save_version(&tiny_model(), metadata("tracker10", "20250103_000000_000000", 1.0))
            .unwrap();

        let listed = vs.list_versions("tracker1").unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(ids, vec!["20250101_000000_000000", "20250102_000000_000000"]);

        let pointer = vs.activate_version("tracker1", "20250101_000000_000000").unwrap();
        assert_eq!(pointer.metrics.mae, Some(3.0));
        assert_eq!(
            vs.get_current_pointer("tracker1").unwrap().unwrap().version,
            "20250101_000000_000000"
        );
        assert!(vs.activate_version("tracker1", "20990101_000000_000000").is_err());
    }
}
