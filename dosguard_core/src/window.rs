// Bounded observation window and feature matrix projection

use crate::observation::{Observation, KNOWN_FEATURES};
use std::collections::VecDeque;
use thiserror::Error;

/// Shape failures shared by the window projection and the scorer.
#[derive(Debug, Error, PartialEq)]
pub enum DataShapeError {
    #[error("window is empty")]
    EmptyWindow,
    #[error("feature `{0}` is missing from every observation in the window")]
    MissingFeature(String),
    #[error("scoring needs at least 2 rows, got {0}")]
    InsufficientData(usize),
}

/// Row-major numeric matrix projected from the window. Row order matches the
/// window's arrival order; column order matches the configured feature set.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

impl FeatureMatrix {
    pub fn from_rows(rows: usize, cols: usize, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), rows * cols);
        FeatureMatrix { rows, cols, values }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.cols..(row + 1) * self.cols]
    }

    pub fn column(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        (0..self.rows).map(move |r| self.get(r, col))
    }
}

/// Bounded, ordered buffer of recent observations. Insertion order is arrival
/// order; once `len` would exceed the capacity the oldest entries are evicted
/// first. Only the orchestrator mutates the window; readers get snapshots.
#[derive(Debug)]
pub struct ObservationWindow {
    capacity: usize,
    entries: VecDeque<Observation>,
}

impl ObservationWindow {
    pub fn new(capacity: usize) -> Self {
        ObservationWindow {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently appended observation, if any. Ingestion uses this to seed
    /// the forward-fill of derived rates across batch boundaries.
    pub fn last(&self) -> Option<&Observation> {
        self.entries.back()
    }

    /// O(1) amortized append; evicts from the front once over capacity.
    pub fn append(&mut self, observation: Observation) {
        self.entries.push_back(observation);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn extend<I: IntoIterator<Item = Observation>>(&mut self, batch: I) {
        for obs in batch {
            self.append(obs);
        }
    }

    /// Immutable ordered copy of the current contents, safe to hand to a
    /// reader while the next cycle mutates the window.
    pub fn snapshot(&self) -> Vec<Observation> {
        self.entries.iter().cloned().collect()
    }

    /// Projects the window onto the named features in order.
    pub fn as_feature_matrix(&self, feature_set: &[String]) -> Result<FeatureMatrix, DataShapeError> {
        feature_matrix_from(self.entries.iter(), self.entries.len(), feature_set)
    }
}

/// Shared projection used by the window and by the manual-prediction path
/// (which scores a snapshot plus one candidate row without touching the
/// window itself).
pub fn feature_matrix_from<'a, I>(
    observations: I,
    row_count: usize,
    feature_set: &[String],
) -> Result<FeatureMatrix, DataShapeError>
where
    I: IntoIterator<Item = &'a Observation>,
{
    if row_count == 0 {
        return Err(DataShapeError::EmptyWindow);
    }
    for name in feature_set {
        if !KNOWN_FEATURES.contains(&name.as_str()) {
            return Err(DataShapeError::MissingFeature(name.clone()));
        }
    }

    let cols = feature_set.len();
    let mut values = Vec::with_capacity(row_count * cols);
    // Tracks whether each column held at least one finite value.
    let mut column_seen = vec![false; cols];

    for obs in observations {
        for (c, name) in feature_set.iter().enumerate() {
            // Name validity was checked above, so the lookup cannot fail.
            let v = obs.feature(name).unwrap_or(f64::NAN);
            if v.is_finite() {
                column_seen[c] = true;
            }
            values.push(v);
        }
    }

    for (c, seen) in column_seen.iter().enumerate() {
        if !seen {
            return Err(DataShapeError::MissingFeature(feature_set[c].clone()));
        }
    }

    Ok(FeatureMatrix::from_rows(row_count, cols, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation;
    use std::time::{Duration, SystemTime};

    fn obs(packet_length: f64, inter_arrival_time: f64, dns_rate: f64) -> Observation {
        Observation::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1), packet_length, inter_arrival_time, dns_rate)
    }

    fn features(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_append_respects_capacity() {
        let mut window = ObservationWindow::new(3);
        for i in 0..10 {
            window.append(obs(i as f64, 0.5, 1.0));
        }
        assert_eq!(window.len(), 3);
        // Retained entries are exactly the most recent three, in arrival order.
        let kept: Vec<f64> = window.snapshot().iter().map(|o| o.packet_length).collect();
        assert_eq!(kept, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut window = ObservationWindow::new(10);
        window.append(obs(100.0, 0.5, 1.0));
        let snap = window.snapshot();
        window.append(obs(200.0, 0.5, 1.0));
        assert_eq!(snap.len(), 1);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_feature_matrix_projection_order() {
        let mut window = ObservationWindow::new(10);
        window.append(obs(100.0, 0.5, 7.0));
        window.append(obs(200.0, 0.25, 9.0));

        let matrix = window
            .as_feature_matrix(&features(&[observation::PACKET_LENGTH, observation::REQUEST_RATE]))
            .unwrap();
        assert_eq!(matrix.rows(), 2);
        assert_eq!(matrix.cols(), 2);
        assert_eq!(matrix.row(0), &[100.0, 2.0]);
        assert_eq!(matrix.row(1), &[200.0, 4.0]);
        let col: Vec<f64> = matrix.column(1).collect();
        assert_eq!(col, vec![2.0, 4.0]);
    }

    #[test]
    fn test_empty_window_is_an_error() {
        let window = ObservationWindow::new(10);
        let err = window.as_feature_matrix(&features(&[observation::DNS_RATE])).unwrap_err();
        assert_eq!(err, DataShapeError::EmptyWindow);
    }

    #[test]
    fn test_unknown_feature_is_missing() {
        let mut window = ObservationWindow::new(10);
        window.append(obs(100.0, 0.5, 1.0));
        let err = window.as_feature_matrix(&features(&["query_rate"])).unwrap_err();
        assert_eq!(err, DataShapeError::MissingFeature("query_rate".to_string()));
    }

    #[test]
    fn test_feature_absent_from_every_row_is_missing() {
        let mut window = ObservationWindow::new(10);
        // dns_rate never reported by this probe: NaN in every row.
        window.append(Observation::new(SystemTime::now(), 100.0, 0.5, f64::NAN));
        window.append(Observation::new(SystemTime::now(), 120.0, 0.4, f64::NAN));
        let err = window.as_feature_matrix(&features(&[observation::DNS_RATE])).unwrap_err();
        assert_eq!(err, DataShapeError::MissingFeature("dns_rate".to_string()));
        // The other columns still project fine.
        assert!(window.as_feature_matrix(&features(&[observation::PACKET_LENGTH])).is_ok());
    }
}
