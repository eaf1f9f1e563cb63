//! Trainable per-service outlier model.
//!
//! The orchestrator only depends on [`OutlierModel`]; the concrete
//! [`IsolationForestModel`] standardizes the four features and fits an
//! isolation forest, persisting every fit through a [`ModelStore`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detect::{DetectError, Feature, MetricSample};
use crate::storage::models::ModelStore;

const N_ESTIMATORS: usize = 100;
const MAX_SAMPLES: usize = 256;
const SEED: u64 = 42;
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Version and training metadata of a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub version: String,
    pub trained_at: DateTime<Utc>,
    pub training_samples: usize,
}

/// Per-sample output of [`OutlierModel::score`]. Lower `raw_score` means more
/// isolated; the caller rescales it onto [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredSample {
    pub index: usize,
    pub is_outlier: bool,
    pub raw_score: f64,
}

pub trait OutlierModel: Send + Sync {
    fn train(&self, service: &str, samples: &[MetricSample]) -> Result<ModelInfo, DetectError>;
    fn score(&self, service: &str, samples: &[MetricSample]) -> Result<Vec<ScoredSample>, DetectError>;
    fn is_trained(&self, service: &str) -> bool;
    fn trained_services(&self) -> Vec<String>;
    fn model_info(&self, service: &str) -> Option<ModelInfo>;
}

// ---------------------------------------------------------------------------
// Standardization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[[f64; 4]]) -> Self {
        let n = rows.len().max(1) as f64;
        let mut means = vec![0.0; 4];
        let mut scales = vec![1.0; 4];
        for j in 0..4 {
            let mean = rows.iter().map(|r| r[j]).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / n;
            means[j] = mean;
            // constant columns pass through unscaled
            scales[j] = if var > 0.0 { var.sqrt() } else { 1.0 };
        }
        Self { means, scales }
    }

    pub fn transform(&self, row: &[f64; 4]) -> [f64; 4] {
        let mut out = [0.0; 4];
        for j in 0..4 {
            out[j] = (row[j] - self.means[j]) / self.scales[j];
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Isolation forest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf { size: usize },
    Split { feature: usize, threshold: f64, left: usize, right: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(points: &[[f64; 4]], max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let idx: Vec<usize> = (0..points.len()).collect();
        tree.grow(points, &idx, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        points: &[[f64; 4]],
        idx: &[usize],
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let slot = self.nodes.len();
        self.nodes.push(Node::Leaf { size: idx.len() });
        if depth >= max_depth || idx.len() <= 1 {
            return slot;
        }

        let splittable: Vec<(usize, f64, f64)> = (0..4)
            .filter_map(|j| {
                let lo = idx.iter().map(|&i| points[i][j]).fold(f64::INFINITY, f64::min);
                let hi = idx.iter().map(|&i| points[i][j]).fold(f64::NEG_INFINITY, f64::max);
                (hi > lo).then_some((j, lo, hi))
            })
            .collect();
        if splittable.is_empty() {
            return slot;
        }

        let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
        let threshold = rng.gen_range(lo..hi);
        let (l, r): (Vec<usize>, Vec<usize>) = idx.iter().copied().partition(|&i| points[i][feature] < threshold);

        let left = self.grow(points, &l, depth + 1, max_depth, rng);
        let right = self.grow(points, &r, depth + 1, max_depth, rng);
        self.nodes[slot] = Node::Split { feature, threshold, left, right };
        slot
    }

    fn path_length(&self, x: &[f64; 4]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split { feature, threshold, left, right } => {
                    node = if x[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    subsample: usize,
    /// Decision boundary derived from the contamination fraction.
    offset: f64,
}

impl IsolationForest {
    pub fn fit(points: &[[f64; 4]], contamination: f64) -> Self {
        if points.is_empty() {
            return Self { trees: Vec::new(), subsample: 0, offset: 0.0 };
        }
        let mut rng = StdRng::seed_from_u64(SEED);
        let subsample = points.len().min(MAX_SAMPLES);
        let max_depth = (subsample as f64).log2().ceil().max(1.0) as usize;

        let trees = (0..N_ESTIMATORS)
            .map(|_| {
                let picked: Vec<[f64; 4]> = rand::seq::index::sample(&mut rng, points.len(), subsample)
                    .iter()
                    .map(|i| points[i])
                    .collect();
                IsolationTree::build(&picked, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self { trees, subsample, offset: 0.0 };
        let mut train_scores: Vec<f64> = points.iter().map(|p| forest.score_sample(p)).collect();
        train_scores.sort_by(|a, b| a.total_cmp(b));
        forest.offset = percentile(&train_scores, contamination * 100.0);
        forest
    }

    /// Negated anomaly score: values near -1 are isolated quickly.
    fn score_sample(&self, x: &[f64; 4]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let mean_depth = self.trees.iter().map(|t| t.path_length(x)).sum::<f64>() / self.trees.len() as f64;
        let norm = average_path_length(self.subsample).max(f64::EPSILON);
        -(2f64.powf(-mean_depth / norm))
    }

    /// Negative values are outliers.
    pub fn decision_function(&self, x: &[f64; 4]) -> f64 {
        self.score_sample(x) - self.offset
    }
}

/// Linear-interpolated percentile over an ascending slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

// ---------------------------------------------------------------------------
// Per-service model registry
// ---------------------------------------------------------------------------

/// A fitted model as persisted by the model store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    pub service: String,
    pub info: ModelInfo,
    pub features: Vec<String>,
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
}

pub struct IsolationForestModel {
    models: RwLock<HashMap<String, SavedModel>>,
    store: Arc<dyn ModelStore>,
    contamination: f64,
    min_samples: usize,
}

impl IsolationForestModel {
    pub fn new(store: Arc<dyn ModelStore>, contamination: f64, min_samples: usize) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            store,
            contamination,
            min_samples,
        }
    }

    /// Load every persisted model into memory. Returns how many were loaded.
    pub fn load_saved(&self) -> usize {
        let saved = match self.store.load_all() {
            Ok(saved) => saved,
            Err(e) => {
                warn!(error = %e, "failed to load saved models");
                return 0;
            }
        };
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        for m in saved {
            info!(service = %m.service, version = %m.info.version, "loaded saved model");
            models.insert(m.service.clone(), m);
        }
        models.len()
    }
}

impl OutlierModel for IsolationForestModel {
    fn train(&self, service: &str, samples: &[MetricSample]) -> Result<ModelInfo, DetectError> {
        if samples.len() < self.min_samples {
            return Err(DetectError::InsufficientTrainingData {
                needed: self.min_samples,
                have: samples.len(),
            });
        }

        let rows: Vec<[f64; 4]> = samples.iter().map(MetricSample::feature_vector).collect();
        let scaler = StandardScaler::fit(&rows);
        let scaled: Vec<[f64; 4]> = rows.iter().map(|r| scaler.transform(r)).collect();
        let forest = IsolationForest::fit(&scaled, self.contamination);

        let trained_at = Utc::now();
        let info = ModelInfo {
            version: format!("v_{}", trained_at.format("%Y%m%d_%H%M%S")),
            trained_at,
            training_samples: samples.len(),
        };
        let saved = SavedModel {
            service: service.to_string(),
            info: info.clone(),
            features: Feature::ALL.iter().map(|f| f.name().to_string()).collect(),
            scaler,
            forest,
        };

        self.store
            .save(&saved)
            .map_err(|e| DetectError::ModelFailure(format!("persisting model for {service}: {e}")))?;

        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), saved);

        info!(%service, samples = samples.len(), version = %info.version, "trained model");
        Ok(info)
    }

    fn score(&self, service: &str, samples: &[MetricSample]) -> Result<Vec<ScoredSample>, DetectError> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let model = models
            .get(service)
            .ok_or_else(|| DetectError::ScoringUnavailable(service.to_string()))?;

        Ok(samples
            .iter()
            .enumerate()
            .map(|(index, s)| {
                let x = model.scaler.transform(&s.feature_vector());
                let raw_score = model.forest.decision_function(&x);
                ScoredSample {
                    index,
                    is_outlier: raw_score < 0.0,
                    raw_score,
                }
            })
            .collect())
    }

    fn is_trained(&self, service: &str) -> bool {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

    fn trained_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        services.sort();
        services
    }

    fn model_info(&self, service: &str) -> Option<ModelInfo> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|m| m.info.clone())
    }
}
