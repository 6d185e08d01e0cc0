// Feature normalization over the current window

use crate::config::NormalizationStrategy;
use crate::window::FeatureMatrix;

/// Rescales a feature matrix column by column. Statistics are recomputed from
/// the matrix passed to every `fit_transform` call — nothing carries over
/// between passes, so the baseline tracks whatever regime the window holds.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    strategy: NormalizationStrategy,
}

impl Normalizer {
    pub fn new(strategy: NormalizationStrategy) -> Self {
        Normalizer { strategy }
    }

    pub fn strategy(&self) -> NormalizationStrategy {
        self.strategy
    }

    pub fn fit_transform(&self, matrix: &FeatureMatrix) -> FeatureMatrix {
        let rows = matrix.rows();
        let cols = matrix.cols();
        let mut values = vec![0.0; rows * cols];

        for c in 0..cols {
            match self.strategy {
                NormalizationStrategy::Standard => {
                    let (mean, stddev) = column_mean_stddev(matrix, c);
                    for r in 0..rows {
                        // A zero-variance column maps to all zeros instead of
                        // dividing by zero.
                        values[r * cols + c] = if stddev > 0.0 {
                            (matrix.get(r, c) - mean) / stddev
                        } else {
                            0.0
                        };
                    }
                }
                NormalizationStrategy::MinMax => {
                    let (min, max) = column_min_max(matrix, c);
                    let range = max - min;
                    for r in 0..rows {
                        values[r * cols + c] = if range > 0.0 {
                            (matrix.get(r, c) - min) / range
                        } else {
                            0.0
                        };
                    }
                }
            }
        }

        FeatureMatrix::from_rows(rows, cols, values)
    }
}

fn column_mean_stddev(matrix: &FeatureMatrix, col: usize) -> (f64, f64) {
    let n = matrix.rows() as f64;
    let mean = matrix.column(col).sum::<f64>() / n;
    // Population variance, matching the reference scaler.
    let variance = matrix.column(col).map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn column_min_max(matrix: &FeatureMatrix, col: usize) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in matrix.column(col) {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize, values: &[f64]) -> FeatureMatrix {
        FeatureMatrix::from_rows(rows, cols, values.to_vec())
    }

    #[test]
    fn test_standardization_centers_and_scales() {
        let m = matrix(3, 1, &[1.0, 2.0, 3.0]);
        let out = Normalizer::new(NormalizationStrategy::Standard).fit_transform(&m);
        // mean 2, population stddev sqrt(2/3)
        let stddev = (2.0f64 / 3.0).sqrt();
        assert!((out.get(0, 0) - (-1.0 / stddev)).abs() < 1e-12);
        assert!((out.get(1, 0)).abs() < 1e-12);
        assert!((out.get(2, 0) - (1.0 / stddev)).abs() < 1e-12);
    }

    #[test]
    fn test_zero_variance_feature_maps_to_zero() {
        let m = matrix(4, 2, &[5.0, 1.0, 5.0, 2.0, 5.0, 3.0, 5.0, 4.0]);
        for strategy in [NormalizationStrategy::Standard, NormalizationStrategy::MinMax] {
            let out = Normalizer::new(strategy).fit_transform(&m);
            for r in 0..4 {
                let v = out.get(r, 0);
                assert_eq!(v, 0.0, "constant column must map to 0, got {} via {:?}", v, strategy);
                assert!(out.get(r, 1).is_finite());
            }
        }
    }

    #[test]
    fn test_min_max_maps_to_unit_interval() {
        let m = matrix(3, 1, &[10.0, 20.0, 30.0]);
        let out = Normalizer::new(NormalizationStrategy::MinMax).fit_transform(&m);
        assert_eq!(out.get(0, 0), 0.0);
        assert_eq!(out.get(1, 0), 0.5);
        assert_eq!(out.get(2, 0), 1.0);
    }

    #[test]
    fn test_statistics_do_not_carry_over_between_calls() {
        let normalizer = Normalizer::new(NormalizationStrategy::Standard);
        let first = matrix(2, 1, &[0.0, 10.0]);
        let _ = normalizer.fit_transform(&first);

        // A later window with a different distribution is normalized against
        // its own statistics only.
        let second = matrix(2, 1, &[100.0, 300.0]);
        let out = normalizer.fit_transform(&second);
        assert!((out.get(0, 0) + 1.0).abs() < 1e-12);
        assert!((out.get(1, 0) - 1.0).abs() < 1e-12);
    }
}
