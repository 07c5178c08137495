//! Chronological train/test split, fitting and held-out evaluation.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{GateMetric, TrainingConfig};
use crate::errors::{ForecastError, ForecastResult};
use crate::label_matcher::SupervisedSample;
use crate::regressor::{regressor_for, FittedModel};

/// Accuracy of a model on its held-out split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    pub train_samples: usize,
    pub test_samples: usize,
}

impl Metrics {
    pub fn get(&self, metric: GateMetric) -> f64 {
        match metric {
            GateMetric::Mae => self.mae,
            GateMetric::Rmse => self.rmse,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub model: FittedModel,
    pub metrics: Metrics,
}

/// Index of the first test row: the earliest `floor(n * fraction)` rows train.
pub fn split_index(n: usize, train_fraction: f64) -> ForecastResult<usize> {
    if !(train_fraction > 0.0 && train_fraction < 1.0) {
        return Err(ForecastError::training(format!(
            "train fraction {train_fraction} must be strictly between 0 and 1"
        )));
    }
    let split = (n as f64 * train_fraction).floor() as usize;
    if split == 0 || split >= n {
        return Err(ForecastError::training(format!(
            "{n} rows cannot be split at fraction {train_fraction} into non-empty train and test sets"
        )));
    }
    Ok(split)
}

pub fn evaluate(actual: &[f64], predicted: &[f64], train_samples: usize) -> Metrics {
    let n = actual.len() as f64;
    let residuals: Vec<f64> = actual.iter().zip(predicted).map(|(a, p)| a - p).collect();
    let mae = residuals.iter().map(|r| r.abs()).sum::<f64>() / n;
    let ss_res: f64 = residuals.iter().map(|r| r * r).sum();
    let rmse = (ss_res / n).sqrt();

    let mean = actual.iter().sum::<f64>() / n;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    Metrics {
        mae,
        rmse,
        r2,
        train_samples,
        test_samples: actual.len(),
    }
}

/// Fit on the earliest rows and score on the latest ones.
///
/// Row order is never shuffled: the test split always lies after the train
/// split in time.
pub fn train_and_evaluate(
    samples: &[SupervisedSample],
    cfg: &TrainingConfig,
) -> ForecastResult<TrainOutcome> {
    let split = split_index(samples.len(), cfg.train_fraction)?;
    let (train, test) = samples.split_at(split);
    let model = fit_model(train, cfg)?;
    let metrics = score_model(&model, test, train.len())?;
    Ok(TrainOutcome { model, metrics })
}

/// Fit the configured regressor on `train`.
pub fn fit_model(train: &[SupervisedSample], cfg: &TrainingConfig) -> ForecastResult<FittedModel> {
    let x: Vec<Vec<f64>> = train.iter().map(|s| s.features.values()).collect();
    let y: Vec<f64> = train.iter().map(|s| s.target).collect();
    regressor_for(cfg).fit(&x, &y)
}

/// Held-out metrics of `model` on `test`.
pub fn score_model(
    model: &FittedModel,
    test: &[SupervisedSample],
    train_samples: usize,
) -> ForecastResult<Metrics> {
    if test.is_empty() {
        return Err(ForecastError::training("empty test split"));
    }
    let x: Vec<Vec<f64>> = test.iter().map(|s| s.features.values()).collect();
    let y: Vec<f64> = test.iter().map(|s| s.target).collect();
    let predicted = model
        .predict_batch(&x)
        .map_err(|e| ForecastError::training(format!("evaluation failed: {e}")))?;

    let metrics = evaluate(&y, &predicted, train_samples);
    if !(metrics.mae.is_finite() && metrics.rmse.is_finite() && metrics.r2.is_finite()) {
        return Err(ForecastError::training("model produced non-finite metrics"));
    }

    info!(
        model_kind = model.kind().as_str(),
        train_samples = metrics.train_samples,
        test_samples = metrics.test_samples,
        mae = metrics.mae,
        rmse = metrics.rmse,
        r2 = metrics.r2,
        "model evaluated"
    );
    Ok(metrics)
}
