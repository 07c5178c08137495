use serde::{Deserialize, Serialize};

use crate::config::{GateMetric, PromotionConfig};
use crate::trainer::Metrics;
use crate::version_store::CurrentPointer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub promote: bool,
    pub reason: String,
}

impl PromotionDecision {
    fn accept(reason: impl Into<String>) -> Self {
        Self {
            promote: true,
            reason: reason.into(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            promote: false,
            reason: reason.into(),
        }
    }
}

/// Compares a candidate against the active model's recorded error.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionPolicy {
    /// Largest tolerated relative increase of the gate metric, in percent.
    pub threshold_percent: f64,
    pub gate_metric: GateMetric,
    pub min_r2: Option<f64>,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self::from(&PromotionConfig::default())
    }
}

impl From<&PromotionConfig> for PromotionPolicy {
    fn from(cfg: &PromotionConfig) -> Self {
        Self {
            threshold_percent: cfg.mae_threshold_percent,
            gate_metric: cfg.gate_metric,
            min_r2: cfg.min_r2,
        }
    }
}

fn metric_name(metric: GateMetric) -> &'static str {
    match metric {
        GateMetric::Mae => "mae",
        GateMetric::Rmse => "rmse",
    }
}

impl PromotionPolicy {
    /// Decide whether `candidate` replaces the model behind `current`.
    ///
    /// Pure and infallible; the reason is always populated.
    pub fn decide(&self, candidate: &Metrics, current: Option<&CurrentPointer>) -> PromotionDecision {
        if let Some(min_r2) = self.min_r2 {
            if candidate.r2 < min_r2 {
                return PromotionDecision::reject(format!(
                    "new model r2 {:.4} below minimum {min_r2}",
                    candidate.r2
                ));
            }
        }

        let name = metric_name(self.gate_metric);
        let Some(pointer) = current else {
            return PromotionDecision::accept("no baseline: no current model exists");
        };

        let baseline = match pointer.metrics.get(self.gate_metric) {
            Some(v) if v.is_finite() && v > 0.0 => v,
            _ => {
                return PromotionDecision::accept(format!(
                    "baseline lacks metric: current model has no valid {name}"
                ))
            }
        };

        let new_value = candidate.get(self.gate_metric);
        let pct_increase = (new_value - baseline) / baseline * 100.0;
        let threshold = self.threshold_percent;

        if pct_increase > threshold {
            return PromotionDecision::reject(if pct_increase < 0.0 {
                format!(
                    "new model is not better enough ({name} improved by {:.2}%, short of {threshold}% threshold)",
                    -pct_increase
                )
            } else {
                format!(
                    "new model is worse ({name} increased by {pct_increase:.2}%, exceeds {threshold}% threshold)"
                )
            });
        }

        if pct_increase < 0.0 {
            PromotionDecision::accept(format!(
                "new model is better ({name} improved by {:.2}%)",
                -pct_increase
            ))
        } else {
            PromotionDecision::accept(format!(
                "new model is acceptable ({name} increased by {pct_increase:.2}%, within {threshold}% threshold)"
            ))
        }
    }
}
