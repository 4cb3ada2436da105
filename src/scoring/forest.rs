//! Isolation forest anomaly oracle
//!
//! The default model is trained on a seeded standard-normal sample, so two
//! workers started with the same config score identically. A model saved
//! with [`IsolationForest::save`] can be loaded instead.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::AnomalyOracle;
use crate::error::{AuditError, Result};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;
const FEATURES: usize = 2;

/// Forest training parameters
#[derive(Debug, Clone)]
pub struct ForestConfig {
    pub n_estimators: usize,
    /// Points drawn (without replacement) to grow each tree
    pub max_samples: usize,
    /// Size of the synthetic training set
    pub training_size: usize,
    pub seed: u64,
    /// Saved model to load instead of training
    pub model_path: Option<PathBuf>,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            training_size: 1000,
            seed: 42,
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(points: &[[f64; FEATURES]], max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow_node(points, 0, max_depth, rng);
        tree
    }

    fn grow_node(
        &mut self,
        points: &[[f64; FEATURES]],
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf { size: points.len() });

        if depth >= max_depth || points.len() <= 1 {
            return index;
        }

        let feature = rng.gen_range(0..FEATURES);
        let (min, max) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p[feature]), hi.max(p[feature]))
        });
        if max <= min {
            return index;
        }

        let threshold = rng.gen_range(min..max);
        let (left_points, right_points): (Vec<_>, Vec<_>) =
            points.iter().copied().partition(|p| p[feature] < threshold);

        let left = self.grow_node(&left_points, depth + 1, max_depth, rng);
        let right = self.grow_node(&right_points, depth + 1, max_depth, rng);
        self.nodes[index] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        index
    }

    /// Structural checks for a deserialized tree.
    ///
    /// Children must point forward (trees are stored in pre-order), which
    /// also rules out cycles.
    fn check(&self) -> std::result::Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= FEATURES {
                    return Err(format!("node {index} splits on feature {feature}"));
                }
                for child in [*left, *right] {
                    if child <= index || child >= self.nodes.len() {
                        return Err(format!("node {index} has child {child} out of range"));
                    }
                }
            }
        }
        Ok(())
    }

    fn path_length(&self, sample: &[f64; FEATURES]) -> f64 {
        let mut index = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if sample[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points
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

/// Isolation forest over two features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    max_samples: usize,
    #[serde(skip, default = "default_source")]
    source: String,
}

fn default_source() -> String {
    "file".to_string()
}

impl IsolationForest {
    /// Fit a forest on `points`
    pub fn fit(points: &[[f64; FEATURES]], n_estimators: usize, max_samples: usize, seed: u64) -> Result<Self> {
        if points.is_empty() || n_estimators == 0 {
            return Err(AuditError::Scorer(
                "isolation forest needs training points and at least one tree".to_string(),
            ));
        }

        let max_samples = max_samples.clamp(1, points.len());
        let max_depth = (max_samples as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let trees = (0..n_estimators)
            .map(|_| {
                let subsample: Vec<[f64; FEATURES]> =
                    rand::seq::index::sample(&mut rng, points.len(), max_samples)
                        .into_iter()
                        .map(|i| points[i])
                        .collect();
                IsolationTree::grow(&subsample, max_depth, &mut rng)
            })
            .collect();

        Ok(Self {
            trees,
            max_samples,
            source: "default".to_string(),
        })
    }

    /// Train the default model on seeded N(0, 1) data
    pub fn train_default(config: &ForestConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let points: Vec<[f64; FEATURES]> = (0..config.training_size)
            .map(|_| [standard_normal(&mut rng), standard_normal(&mut rng)])
            .collect();
        Self::fit(&points, config.n_estimators, config.max_samples, config.seed)
    }

    /// Load the configured model file, or train the default model.
    ///
    /// A configured path that does not exist falls back to training.
    pub fn load_or_train(config: &ForestConfig) -> Result<Self> {
        if let Some(path) = config.model_path.as_deref() {
            if path.exists() {
                return Self::load(path);
            }
            warn!(path = %path.display(), "Model file not found, training default model");
        }

        let forest = Self::train_default(config)?;
        info!(
            trees = forest.trees.len(),
            max_samples = forest.max_samples,
            "Trained default isolation forest"
        );
        Ok(forest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut forest: Self = serde_json::from_str(&text)
            .map_err(|e| AuditError::Scorer(format!("invalid model file {}: {e}", path.display())))?;
        if forest.trees.is_empty() {
            return Err(AuditError::Scorer(format!(
                "model file {} has no trees",
                path.display()
            )));
        }
        for (i, tree) in forest.trees.iter().enumerate() {
            tree.check().map_err(|reason| {
                AuditError::Scorer(format!("model file {} tree {i}: {reason}", path.display()))
            })?;
        }
        forest.source = "file".to_string();
        info!(path = %path.display(), trees = forest.trees.len(), "Loaded isolation forest");
        Ok(forest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

impl AnomalyOracle for IsolationForest {
    /// Negated anomaly score: `-(2^(-E[h(x)] / c(max_samples)))`
    fn score_samples(&self, sample: [f64; 2]) -> Result<f64> {
        if sample.iter().any(|v| !v.is_finite()) {
            return Err(AuditError::Scorer(format!("non-finite input {sample:?}")));
        }
        let mean_path = self
            .trees
            .iter()
            .map(|tree| tree.path_length(&sample))
            .sum::<f64>()
            / self.trees.len() as f64;
        let normalizer = average_path_length(self.max_samples).max(f64::MIN_POSITIVE);
        Ok(-(2f64.powf(-mean_path / normalizer)))
    }

    fn model_name(&self) -> &str {
        "IsolationForest"
    }

    fn source(&self) -> &str {
        &self.source
    }
}

/// Box-Muller transform
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
