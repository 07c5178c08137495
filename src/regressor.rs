// regressor.rs
// Purpose: Trainable regression models behind a common fit/predict seam

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{ForestParams, ModelKind, TrainingConfig};
use crate::errors::{ForecastError, ForecastResult};

const PIVOT_EPSILON: f64 = 1e-12;

/// A learning algorithm. Fitting never mutates the regressor, so one
/// instance can train any number of models.
pub trait Regressor: Send + Sync {
    fn kind(&self) -> ModelKind;
    fn fit(&self, features: &[Vec<f64>], target: &[f64]) -> ForecastResult<FittedModel>;
}

/// Select the regressor configured for training.
pub fn regressor_for(cfg: &TrainingConfig) -> Box<dyn Regressor> {
    match cfg.model_kind {
        ModelKind::Linear => Box::new(LinearRegressor { ridge: cfg.ridge }),
        ModelKind::Forest => Box::new(ForestRegressor {
            params: cfg.forest.clone(),
        }),
    }
}

/// Serialized model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedModel {
    Linear(LinearModel),
    Forest(ForestModel),
}

impl FittedModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            FittedModel::Linear(_) => ModelKind::Linear,
            FittedModel::Forest(_) => ModelKind::Forest,
        }
    }

    pub fn n_features(&self) -> usize {
        match self {
            FittedModel::Linear(m) => m.coefficients.len(),
            FittedModel::Forest(m) => m.n_features,
        }
    }

    pub fn predict(&self, row: &[f64]) -> ForecastResult<f64> {
        if row.len() != self.n_features() {
            return Err(ForecastError::validation(
                "features",
                format!("expected {} values, got {}", self.n_features(), row.len()),
            ));
        }
        Ok(match self {
            FittedModel::Linear(m) => m.predict_row(row),
            FittedModel::Forest(m) => m.predict_row(row),
        })
    }

    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> ForecastResult<Vec<f64>> {
        rows.iter().map(|row| self.predict(row)).collect()
    }
}

fn check_training_input(features: &[Vec<f64>], target: &[f64]) -> ForecastResult<usize> {
    if features.is_empty() {
        return Err(ForecastError::training("empty training set"));
    }
    if features.len() != target.len() {
        return Err(ForecastError::training(format!(
            "{} feature rows but {} targets",
            features.len(),
            target.len()
        )));
    }
    let width = features[0].len();
    if width == 0 {
        return Err(ForecastError::training("feature rows have no columns"));
    }
    for (i, row) in features.iter().enumerate() {
        if row.len() != width {
            return Err(ForecastError::training(format!(
                "row {i} has {} columns, expected {width}",
                row.len()
            )));
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::training(format!("row {i} contains a non-finite value")));
        }
    }
    if target.iter().any(|v| !v.is_finite()) {
        return Err(ForecastError::training("target contains a non-finite value"));
    }
    Ok(width)
}

// ---------------------------------------------------------------------------
// Linear
// ---------------------------------------------------------------------------

/// Ridge-regularised least squares on standardised columns.
#[derive(Debug, Clone)]
pub struct LinearRegressor {
    pub ridge: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LinearModel {
    fn predict_row(&self, row: &[f64]) -> f64 {
        self.intercept
            + row
                .iter()
                .zip(&self.means)
                .zip(&self.scales)
                .zip(&self.coefficients)
                .map(|(((x, mean), scale), coef)| (x - mean) / scale * coef)
                .sum::<f64>()
    }
}

impl Regressor for LinearRegressor {
    fn kind(&self) -> ModelKind {
        ModelKind::Linear
    }

    fn fit(&self, features: &[Vec<f64>], target: &[f64]) -> ForecastResult<FittedModel> {
        let p = check_training_input(features, target)?;
        let n = features.len() as f64;

        let mut means = vec![0.0; p];
        for row in features {
            for (m, x) in means.iter_mut().zip(row) {
                *m += x / n;
            }
        }
        let mut scales = vec![0.0; p];
        for row in features {
            for ((s, x), m) in scales.iter_mut().zip(row).zip(&means) {
                *s += (x - m).powi(2) / n;
            }
        }
        for s in scales.iter_mut() {
            *s = if *s > 0.0 { s.sqrt() } else { 1.0 };
        }

        let y_mean = target.iter().sum::<f64>() / n;

        // Normal equations (ZᵀZ + λI) β = Zᵀ(y - ȳ)
        let mut gram = vec![vec![0.0; p]; p];
        let mut rhs = vec![0.0; p];
        for (row, y) in features.iter().zip(target) {
            let z: Vec<f64> = row
                .iter()
                .zip(&means)
                .zip(&scales)
                .map(|((x, m), s)| (x - m) / s)
                .collect();
            for i in 0..p {
                rhs[i] += z[i] * (y - y_mean);
                for j in 0..p {
                    gram[i][j] += z[i] * z[j];
                }
            }
        }
        for (i, row) in gram.iter_mut().enumerate() {
            row[i] += self.ridge;
        }

        let coefficients = solve(gram, rhs)?;
        Ok(FittedModel::Linear(LinearModel {
            means,
            scales,
            coefficients,
            intercept: y_mean,
        }))
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> ForecastResult<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return Err(ForecastError::training(
                "singular feature matrix; add ridge regularisation or drop constant columns",
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

// ---------------------------------------------------------------------------
// Forest
// ---------------------------------------------------------------------------

/// Bagged CART regression trees.
#[derive(Debug, Clone)]
pub struct ForestRegressor {
    pub params: ForestParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestModel {
    pub n_features: usize,
    pub trees: Vec<RegressionTree>,
}

impl ForestModel {
    fn predict_row(&self, row: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.predict_row(row)).sum();
        total / self.trees.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Flat node arena; index 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    fn predict_row(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    score: f64,
}

struct TreeBuilder<'a> {
    features: &'a [Vec<f64>],
    target: &'a [f64],
    params: &'a ForestParams,
    max_features: usize,
    nodes: Vec<TreeNode>,
}

impl<'a> TreeBuilder<'a> {
    fn build(&mut self, rows: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let mean = rows.iter().map(|&r| self.target[r]).sum::<f64>() / rows.len() as f64;
        let slot = self.nodes.len();
        self.nodes.push(TreeNode::Leaf { value: mean });

        let pure = rows.iter().all(|&r| self.target[r] == self.target[rows[0]]);
        if depth >= self.params.max_depth || rows.len() < self.params.min_samples_split || pure {
            return slot;
        }

        let Some(split) = self.best_split(&rows, rng) else {
            return slot;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| self.features[r][split.feature] <= split.threshold);

        let left = self.build(left_rows, depth + 1, rng);
        let right = self.build(right_rows, depth + 1, rng);
        self.nodes[slot] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        slot
    }

    /// Best variance-reducing split over a random subset of columns.
    fn best_split(&self, rows: &[usize], rng: &mut StdRng) -> Option<SplitCandidate> {
        let n_columns = self.features[0].len();
        let columns = rand::seq::index::sample(rng, n_columns, self.max_features).into_vec();
        let min_leaf = self.params.min_samples_leaf;
        let n = rows.len();

        let total_sum: f64 = rows.iter().map(|&r| self.target[r]).sum();
        let mut best: Option<SplitCandidate> = None;

        for feature in columns {
            let mut ordered: Vec<usize> = rows.to_vec();
            ordered.sort_by(|&a, &b| self.features[a][feature].total_cmp(&self.features[b][feature]));

            let mut left_sum = 0.0;
            for i in 0..n - 1 {
                left_sum += self.target[ordered[i]];
                let left_n = i + 1;
                let right_n = n - left_n;
                if left_n < min_leaf || right_n < min_leaf {
                    continue;
                }
                let here = self.features[ordered[i]][feature];
                let next = self.features[ordered[i + 1]][feature];
                if here == next {
                    continue;
                }
                // maximising this is equivalent to minimising the summed child SSE
                let right_sum = total_sum - left_sum;
                let score = left_sum * left_sum / left_n as f64 + right_sum * right_sum / right_n as f64;
                if best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (here + next) / 2.0,
                        score,
                    });
                }
            }
        }

        let parent_score = total_sum * total_sum / n as f64;
        best.filter(|b| b.score > parent_score + PIVOT_EPSILON)
    }
}

impl Regressor for ForestRegressor {
    fn kind(&self) -> ModelKind {
        ModelKind::Forest
    }

    fn fit(&self, features: &[Vec<f64>], target: &[f64]) -> ForecastResult<FittedModel> {
        let p = check_training_input(features, target)?;
        if self.params.n_trees == 0 {
            return Err(ForecastError::training("forest needs at least one tree"));
        }

        let max_features = ((p as f64).sqrt().floor() as usize).clamp(1, p);
        let n = features.len();
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let mut trees = Vec::with_capacity(self.params.n_trees);

        for _ in 0..self.params.n_trees {
            let bootstrap: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
            let mut builder = TreeBuilder {
                features,
                target,
                params: &self.params,
                max_features,
                nodes: Vec::new(),
            };
            builder.build(bootstrap, 0, &mut rng);
            trees.push(RegressionTree {
                nodes: builder.nodes,
            });
        }

        Ok(FittedModel::Forest(ForestModel {
            n_features: p,
            trees,
        }))
    }
}
