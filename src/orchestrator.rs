//! End-to-end retraining of one device.
//!
//! A run walks `Fetching → FeatureEngineering → Labeling → Training →
//! Evaluating → Versioning → PromotionDecision → PointerUpdate → Logged`.
//! A failure at any stage short-circuits to the failed terminal state, which
//! still appends a ledger record carrying whatever was known at that point.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ForecastConfig;
use crate::data_cleaning::{clean_samples, CleaningStats};
use crate::device_lease::DeviceLeases;
use crate::errors::{ForecastError, ForecastResult};
use crate::feature_pipeline::{build_features, feature_names};
use crate::label_matcher::{match_labels, LabelConfig};
use crate::promotion::{PromotionDecision, PromotionPolicy};
use crate::run_ledger::{RunLedger, RunStatus, TrainingRun};
use crate::sample::validate_device_id;
use crate::sample_store::{no_data, SampleStore};
use crate::trainer::{fit_model, score_model, split_index, Metrics};
use crate::version_store::{version_id, MetricsSnapshot, ModelMetadata, VersionStore};

pub const MAX_DAYS: u32 = 90;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrainRequest {
    pub device_id: String,
    pub days: u32,
    pub horizon_minutes: u32,
}

impl RetrainRequest {
    pub fn new(device_id: impl Into<String>, days: u32, horizon_minutes: u32) -> Self {
        Self {
            device_id: device_id.into(),
            days,
            horizon_minutes,
        }
    }

    pub fn validate(&self) -> ForecastResult<()> {
        validate_device_id(&self.device_id)?;
        if self.days == 0 || self.days > MAX_DAYS {
            return Err(ForecastError::validation(
                "days",
                format!("must be between 1 and {MAX_DAYS}"),
            ));
        }
        if self.horizon_minutes == 0 {
            return Err(ForecastError::validation("horizon_minutes", "must be positive"));
        }
        Ok(())
    }
}

/// Identity of a run, allocated before any work starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTicket {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainStage {
    Fetching,
    FeatureEngineering,
    Labeling,
    Training,
    Evaluating,
    Versioning,
    PromotionDecision,
    PointerUpdate,
    Logged,
}

impl RetrainStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrainStage::Fetching => "fetching",
            RetrainStage::FeatureEngineering => "feature_engineering",
            RetrainStage::Labeling => "labeling",
            RetrainStage::Training => "training",
            RetrainStage::Evaluating => "evaluating",
            RetrainStage::Versioning => "versioning",
            RetrainStage::PromotionDecision => "promotion_decision",
            RetrainStage::PointerUpdate => "pointer_update",
            RetrainStage::Logged => "logged",
        }
    }
}

impl fmt::Display for RetrainStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome handed back to every caller. Only `success` and `run_id` are
/// guaranteed on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainResult {
    pub success: bool,
    pub run_id: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_used: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl RetrainResult {
    /// Failed result for a run that never reached the orchestrator.
    pub fn aborted(run_id: &str, device_id: &str, err: &ForecastError) -> Self {
        Self {
            success: false,
            run_id: run_id.to_string(),
            device_id: device_id.to_string(),
            version: None,
            metrics: None,
            promoted: None,
            promotion_reason: None,
            model_path: None,
            rows_used: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
        }
    }
}

/// What a dry run would train on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub device_id: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub cleaning: CleaningStats,
    pub labeled: usize,
    pub match_failures: usize,
    pub train_samples: usize,
    pub test_samples: usize,
}

/// Facts gathered as the run advances; copied into the ledger record.
#[derive(Default)]
struct Progress {
    rows_used: usize,
    cleaning: Option<CleaningStats>,
    match_failures: Option<usize>,
    metrics: Option<Metrics>,
    version: Option<String>,
    model_path: Option<PathBuf>,
    decision: Option<PromotionDecision>,
    promoted: bool,
}

pub struct RetrainOrchestrator {
    samples: Arc<dyn SampleStore>,
    versions: VersionStore,
    ledger: Arc<dyn RunLedger>,
    leases: DeviceLeases,
    config: ForecastConfig,
}

impl RetrainOrchestrator {
    pub fn new(
        samples: Arc<dyn SampleStore>,
        versions: VersionStore,
        ledger: Arc<dyn RunLedger>,
        leases: DeviceLeases,
        config: ForecastConfig,
    ) -> Self {
        Self {
            samples,
            versions,
            ledger,
            leases,
            config,
        }
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    /// Allocate the run identity.
    pub fn begin(&self) -> RunTicket {
        RunTicket {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
        }
    }

    /// Synchronous retrain without cancellation.
    pub fn retrain(&self, request: &RetrainRequest) -> RetrainResult {
        self.retrain_ticket(self.begin(), request, &CancellationToken::new())
    }

    /// Run the full state machine under an already allocated ticket.
    ///
    /// Never returns an error: every failure becomes a failed result, and a
    /// ledger record is attempted either way.
    pub fn retrain_ticket(
        &self,
        ticket: RunTicket,
        request: &RetrainRequest,
        cancel: &CancellationToken,
    ) -> RetrainResult {
        info!(
            run_id = %ticket.run_id,
            device_id = %request.device_id,
            days = request.days,
            horizon_minutes = request.horizon_minutes,
            "retrain started"
        );

        let mut progress = Progress::default();
        let outcome = self.execute(&ticket, request, cancel, &mut progress);

        let run = self.build_run(&ticket, request, &progress, outcome.as_ref().err());
        if let Err(e) = self.ledger.append(&run) {
            error!(
                run_id = %ticket.run_id,
                device_id = %request.device_id,
                error = %e,
                "failed to record training run; continuing"
            );
        }

        match outcome {
            Ok(()) => {
                info!(
                    run_id = %ticket.run_id,
                    device_id = %request.device_id,
                    version = progress.version.as_deref().unwrap_or(""),
                    promoted = progress.promoted,
                    stage = RetrainStage::Logged.as_str(),
                    "retrain finished"
                );
                RetrainResult {
                    success: true,
                    run_id: ticket.run_id,
                    device_id: request.device_id.clone(),
                    version: progress.version,
                    metrics: progress.metrics,
                    promoted: Some(progress.promoted),
                    promotion_reason: progress.decision.map(|d| d.reason),
                    model_path: progress.model_path,
                    rows_used: Some(progress.rows_used),
                    error: None,
                    error_kind: None,
                }
            }
            Err(e) => {
                warn!(
                    run_id = %ticket.run_id,
                    device_id = %request.device_id,
                    error_kind = e.kind(),
                    error = %e,
                    "retrain failed"
                );
                RetrainResult {
                    success: false,
                    run_id: ticket.run_id,
                    device_id: request.device_id.clone(),
                    version: progress.version,
                    metrics: progress.metrics,
                    promoted: Some(false),
                    promotion_reason: progress.decision.map(|d| d.reason),
                    model_path: progress.model_path,
                    rows_used: (progress.rows_used > 0).then_some(progress.rows_used),
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind().to_string()),
                }
            }
        }
    }

    fn checkpoint(&self, cancel: &CancellationToken, ticket: &RunTicket, stage: RetrainStage) -> ForecastResult<()> {
        if cancel.is_cancelled() {
            return Err(ForecastError::cancelled(stage.as_str()));
        }
        tracing::debug!(run_id = %ticket.run_id, stage = stage.as_str(), "entering stage");
        Ok(())
    }

    fn label_config(&self, request: &RetrainRequest) -> ForecastResult<LabelConfig> {
        let cfg = LabelConfig::from_pipeline(&self.config.pipeline, request.horizon_minutes);
        cfg.validate()?;
        Ok(cfg)
    }

    fn window(&self, request: &RetrainRequest, until: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (until - Duration::days(i64::from(request.days)), until)
    }

    fn execute(
        &self,
        ticket: &RunTicket,
        request: &RetrainRequest,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> ForecastResult<()> {
        request.validate()?;
        let label_cfg = self.label_config(request)?;

        self.checkpoint(cancel, ticket, RetrainStage::Fetching)?;
        let _lease = self
            .leases
            .acquire(
                &self.versions.lease_key(&request.device_id),
                self.config.retrain.lease_timeout(),
            )
            .map_err(|e| match e {
                ForecastError::RetrainInProgress { waited_ms, .. } => ForecastError::RetrainInProgress {
                    device_id: request.device_id.clone(),
                    waited_ms,
                },
                other => other,
            })?;

        let (since, until) = self.window(request, ticket.started_at);
        let fetched = self.samples.fetch(&request.device_id, since, until)?;
        let (cleaned, stats) = clean_samples(fetched, &self.config.cleaning);
        progress.cleaning = Some(stats);
        if cleaned.is_empty() {
            return Err(no_data(&request.device_id, since, until));
        }

        self.checkpoint(cancel, ticket, RetrainStage::FeatureEngineering)?;
        let features = build_features(&cleaned, self.config.pipeline.rolling_window)?;

        self.checkpoint(cancel, ticket, RetrainStage::Labeling)?;
        let dataset = match_labels(&features, &label_cfg).inspect_err(|e| {
            if let ForecastError::InsufficientLabeledSamples { match_failures, .. } = e {
                progress.match_failures = Some(*match_failures);
            }
        })?;
        progress.match_failures = Some(dataset.match_failures);
        progress.rows_used = dataset.len();

        self.checkpoint(cancel, ticket, RetrainStage::Training)?;
        let split = split_index(dataset.len(), self.config.training.train_fraction)?;
        let (train, test) = dataset.samples.split_at(split);
        let model = fit_model(train, &self.config.training)?;

        self.checkpoint(cancel, ticket, RetrainStage::Evaluating)?;
        let metrics = score_model(&model, test, train.len())?;
        progress.metrics = Some(metrics.clone());

        self.checkpoint(cancel, ticket, RetrainStage::Versioning)?;
        let metadata = ModelMetadata {
            version: version_id(ticket.started_at),
            device_id: request.device_id.clone(),
            model_kind: model.kind(),
            features: feature_names(),
            metrics: metrics.clone(),
            trained_at: Utc::now(),
            rows_used: dataset.len(),
            days_used: request.days,
            horizon_minutes: request.horizon_minutes,
            run_id: ticket.run_id.clone(),
            artifact_sha256: String::new(),
        };
        let saved = self.versions.save_version(&model, metadata)?;
        progress.version = Some(saved.version.clone());
        progress.model_path = Some(saved.model_path.clone());

        self.checkpoint(cancel, ticket, RetrainStage::PromotionDecision)?;
        let current = self.versions.get_current_pointer(&request.device_id)?;
        let decision = PromotionPolicy::from(&self.config.promotion).decide(&metrics, current.as_ref());
        info!(
            run_id = %ticket.run_id,
            device_id = %request.device_id,
            version = %saved.version,
            promote = decision.promote,
            reason = %decision.reason,
            "promotion decided"
        );
        let promote = decision.promote;
        progress.decision = Some(decision);

        if promote {
            self.checkpoint(cancel, ticket, RetrainStage::PointerUpdate)?;
            self.versions
                .update_current_pointer(&request.device_id, &saved, MetricsSnapshot::from(&metrics))?;
            progress.promoted = true;
        }
        Ok(())
    }

    fn build_run(
        &self,
        ticket: &RunTicket,
        request: &RetrainRequest,
        progress: &Progress,
        failure: Option<&ForecastError>,
    ) -> TrainingRun {
        TrainingRun {
            run_id: ticket.run_id.clone(),
            device_id: request.device_id.clone(),
            days_requested: request.days,
            horizon_minutes: request.horizon_minutes,
            rows_used: progress.rows_used,
            metrics: progress.metrics.clone(),
            features: feature_names(),
            status: if failure.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Success
            },
            error: failure.map(|e| e.to_string()),
            error_kind: failure.map(|e| e.kind().to_string()),
            promoted: progress.promoted,
            promotion_reason: progress.decision.as_ref().map(|d| d.reason.clone()),
            version: progress.version.clone(),
            model_path: progress.model_path.clone(),
            cleaning: progress.cleaning.clone(),
            match_failures: progress.match_failures,
            trained_at: Utc::now(),
        }
    }

    /// Validate and inspect the data a run would use, without training,
    /// taking a lease or writing anything.
    pub fn dry_run(&self, request: &RetrainRequest) -> ForecastResult<DryRunReport> {
        request.validate()?;
        self.config.validate()?;
        let label_cfg = self.label_config(request)?;

        let (since, until) = self.window(request, Utc::now());
        let fetched = self.samples.fetch(&request.device_id, since, until)?;
        let (cleaned, cleaning) = clean_samples(fetched, &self.config.cleaning);
        if cleaned.is_empty() {
            return Err(no_data(&request.device_id, since, until));
        }
        let features = build_features(&cleaned, self.config.pipeline.rolling_window)?;
        let dataset = match_labels(&features, &label_cfg)?;
        let split = split_index(dataset.len(), self.config.training.train_fraction)?;

        Ok(DryRunReport {
            device_id: request.device_id.clone(),
            since,
            until,
            cleaning,
            labeled: dataset.len(),
            match_failures: dataset.match_failures,
            train_samples: split,
            test_samples: dataset.len() - split,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bounds() {
        assert!(RetrainRequest::new("tracker01", 7, 15).validate().is_ok());
        assert!(RetrainRequest::new("tracker01", 0, 15).validate().is_err());
        assert!(RetrainRequest::new("tracker01", 91, 15).validate().is_err());
        assert!(RetrainRequest::new("tracker01", 7, 0).validate().is_err());
        assert!(RetrainRequest::new("", 7, 15).validate().is_err());
    }

    #[test]
    fn failed_result_serializes_without_empty_fields() {
        let err = ForecastError::cancelled("training");
        let result = RetrainResult::aborted("run-1", "tracker01", &err);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "cancelled");
        assert!(json.get("version").is_none());
        assert!(json.get("metrics").is_none());
    }
}
