// Isolation-forest outlier scorer
//
// Ensemble of randomized partition trees: each tree splits the feature space
// at random feature/threshold pairs until points are isolated or a depth
// limit is reached. Points that isolate at shallow depth get high anomaly
// scores. Refit from scratch on every call; there is no incremental state.

use crate::config::DetectorConfig;
use crate::window::{DataShapeError, FeatureMatrix};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Error, PartialEq)]
pub enum ScoreError {
    #[error(transparent)]
    Shape(#[from] DataShapeError),
    #[error("non-finite value at row {row}, column {col} of the scoring matrix")]
    NonFinite { row: usize, col: usize },
}

enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// Seeded isolation forest. Construction is cheap; all the work happens in
/// `fit_predict`, which builds the whole ensemble against the matrix it is
/// given and throws it away afterwards.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    tree_count: usize,
    subsample_size: usize,
    contamination: f64,
    seed: u64,
}

impl IsolationForest {
    pub fn new(tree_count: usize, subsample_size: usize, contamination: f64, seed: u64) -> Self {
        IsolationForest { tree_count, subsample_size, contamination, seed }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        IsolationForest::new(
            config.tree_count,
            config.subsample_size,
            config.contamination_fraction,
            config.random_seed,
        )
    }

    /// Scores every row of the (normalized) matrix and labels the top
    /// `contamination` fraction as anomalous. Scores lie in (0, 1); higher
    /// means easier to isolate, i.e. more anomalous. Given an identical
    /// matrix and seed the output is bit-for-bit reproducible.
    pub fn fit_predict(&self, matrix: &FeatureMatrix) -> Result<(Vec<f64>, Vec<bool>), ScoreError> {
        let n = matrix.rows();
        if n < 2 {
            return Err(DataShapeError::InsufficientData(n).into());
        }
        for row in 0..n {
            for col in 0..matrix.cols() {
                if !matrix.get(row, col).is_finite() {
                    return Err(ScoreError::NonFinite { row, col });
                }
            }
        }

        let subsample = self.subsample_size.min(n);
        let depth_limit = (subsample as f64).log2().ceil() as usize;
        let mut master = StdRng::seed_from_u64(self.seed);

        let mut total_path = vec![0.0f64; n];
        for _ in 0..self.tree_count {
            // Each tree draws its own deterministic stream from the master rng
            // so the ensemble stays reproducible regardless of tree count.
            let mut rng = StdRng::seed_from_u64(master.gen());
            let points: Vec<usize> = if subsample == n {
                (0..n).collect()
            } else {
                rand::seq::index::sample(&mut rng, n, subsample).into_vec()
            };
            let tree = grow_tree(matrix, &points, 0, depth_limit, &mut rng);
            for row in 0..n {
                total_path[row] += path_length(&tree, matrix.row(row), 0);
            }
        }

        let norm = average_path_length(subsample);
        let scores: Vec<f64> = total_path
            .iter()
            .map(|sum| {
                let mean_depth = sum / self.tree_count as f64;
                2.0f64.powf(-mean_depth / norm)
            })
            .collect();

        let labels = label_top_fraction(&scores, self.contamination);
        Ok((scores, labels))
    }
}

/// Recursively partitions `points` at random feature/threshold pairs. Stops
/// when a point is isolated, the depth limit is hit, or no feature has any
/// spread left among the remaining points.
fn grow_tree(
    matrix: &FeatureMatrix,
    points: &[usize],
    depth: usize,
    depth_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if points.len() <= 1 || depth >= depth_limit {
        return Node::Leaf { size: points.len() };
    }

    // Features that still have spread among these points.
    let mut candidates: Vec<(usize, f64, f64)> = Vec::new();
    for col in 0..matrix.cols() {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &p in points {
            let v = matrix.get(p, col);
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
        if min < max {
            candidates.push((col, min, max));
        }
    }
    if candidates.is_empty() {
        // All remaining points coincide; they cannot be separated.
        return Node::Leaf { size: points.len() };
    }

    let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(min..max);

    let (left, right): (Vec<usize>, Vec<usize>) =
        points.iter().partition(|&&p| matrix.get(p, feature) < threshold);
    if left.is_empty() || right.is_empty() {
        // Degenerate draw at the column minimum; treat as unsplittable here.
        return Node::Leaf { size: points.len() };
    }

    Node::Split {
        feature,
        threshold,
        left: Box::new(grow_tree(matrix, &left, depth + 1, depth_limit, rng)),
        right: Box::new(grow_tree(matrix, &right, depth + 1, depth_limit, rng)),
    }
}

fn path_length(node: &Node, row: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split { feature, threshold, left, right } => {
            if row[*feature] < *threshold {
                path_length(left, row, depth + 1)
            } else {
                path_length(right, row, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points:
/// `c(n) = 2 * (ln(n - 1) + gamma) - 2 * (n - 1) / n`.
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

/// Marks the `ceil(contamination * n)` highest-scoring rows anomalous. Using
/// a ceiling keeps the labeled count monotone in the contamination fraction.
fn label_top_fraction(scores: &[f64], contamination: f64) -> Vec<bool> {
    let n = scores.len();
    let k = ((contamination * n as f64).ceil() as usize).min(n);

    let mut order: Vec<usize> = (0..n).collect();
    // Descending by score; ties broken by row index so labeling is stable.
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut labels = vec![false; n];
    for &idx in order.iter().take(k) {
        labels[idx] = true;
    }
    labels
}
