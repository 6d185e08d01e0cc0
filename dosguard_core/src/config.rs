// Detector configuration structures

use crate::observation::{self, KNOWN_FEATURES};
use serde::{Serialize, Deserialize};
use std::time::Duration;
use thiserror::Error;

/// How the feature matrix is rescaled before scoring. Both strategies recompute
/// their statistics from the current window on every pass, so the baseline
/// drifts with the traffic regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizationStrategy {
    /// Per-feature `(x - mean) / stddev`.
    Standard,
    /// Per-feature `(x - min) / (max - min)`.
    MinMax,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("window capacity must be positive")]
    NonPositiveCapacity,
    #[error("refresh interval must be positive")]
    NonPositiveInterval,
    #[error("fetch range must be positive")]
    NonPositiveFetchRange,
    #[error("fetch timeout must be positive")]
    NonPositiveFetchTimeout,
    #[error("contamination fraction {0} outside (0, 0.5]")]
    ContaminationOutOfRange(f64),
    #[error("feature set must not be empty")]
    EmptyFeatureSet,
    #[error("unrecognized feature name `{0}`")]
    UnknownFeature(String),
    #[error("ensemble needs at least one tree")]
    NoTrees,
    #[error("subsample size must be at least 2")]
    SubsampleTooSmall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Maximum number of observations retained in the window (`N_max`).
    pub window_capacity: usize,
    /// Seconds between detection cycles when the timer loop drives the engine.
    pub refresh_interval_secs: u64,
    /// How far back each fetch reaches into the telemetry store.
    pub fetch_range_secs: u64,
    /// Upper bound on a single fetch; past it the cycle fails instead of hanging.
    pub fetch_timeout_secs: u64,
    /// Measurement name the source filters on.
    pub measurement: String,
    /// Expected anomaly proportion; sets the decision threshold on the ranked
    /// score distribution.
    pub contamination_fraction: f64,
    /// Ordered feature names projected into the scoring matrix.
    pub feature_set: Vec<String>,
    pub normalization: NormalizationStrategy,
    /// Number of isolation trees in the ensemble.
    pub tree_count: usize,
    /// Rows sampled per tree (clamped to the window size at fit time).
    pub subsample_size: usize,
    /// Seed for the ensemble's random splits; same matrix + same seed must
    /// reproduce scores bit for bit.
    pub random_seed: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            window_capacity: 10_000,
            refresh_interval_secs: 3,
            fetch_range_secs: 600, // last 10 minutes
            fetch_timeout_secs: 30,
            measurement: "dns".to_string(),
            contamination_fraction: 0.05,
            feature_set: vec![
                observation::DNS_RATE.to_string(),
                observation::INTER_ARRIVAL_TIME.to_string(),
            ],
            normalization: NormalizationStrategy::Standard,
            tree_count: 100,
            subsample_size: 256,
            random_seed: 42,
        }
    }
}

impl DetectorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn fetch_range(&self) -> Duration {
        Duration::from_secs(self.fetch_range_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Raw fields the source must deliver for this feature set: the derived
    /// `request_rate` is computed from `inter_arrival_time`, everything else
    /// is fetched as-is.
    pub fn raw_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for name in &self.feature_set {
            let raw = if name == observation::REQUEST_RATE {
                observation::INTER_ARRIVAL_TIME
            } else {
                name.as_str()
            };
            if !fields.iter().any(|f| f == raw) {
                fields.push(raw.to_string());
            }
        }
        // inter_arrival_time is always needed to derive the request rate.
        if !fields.iter().any(|f| f == observation::INTER_ARRIVAL_TIME) {
            fields.push(observation::INTER_ARRIVAL_TIME.to_string());
        }
        fields
    }

    /// Load-time validation. Rejects non-positive capacity/interval/timeout,
    /// out-of-range contamination, and unrecognized feature names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 {
            return Err(ConfigError::NonPositiveCapacity);
        }
        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::NonPositiveInterval);
        }
        if self.fetch_range_secs == 0 {
            return Err(ConfigError::NonPositiveFetchRange);
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::NonPositiveFetchTimeout);
        }
        if !(self.contamination_fraction > 0.0 && self.contamination_fraction <= 0.5) {
            return Err(ConfigError::ContaminationOutOfRange(self.contamination_fraction));
        }
        if self.feature_set.is_empty() {
            return Err(ConfigError::EmptyFeatureSet);
        }
        for name in &self.feature_set {
            if !KNOWN_FEATURES.contains(&name.as_str()) {
                return Err(ConfigError::UnknownFeature(name.clone()));
            }
        }
        if self.tree_count == 0 {
            return Err(ConfigError::NoTrees);
        }
        if self.subsample_size < 2 {
            return Err(ConfigError::SubsampleTooSmall);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DetectorConfig::default();
        assert_eq!(config.window_capacity, 10_000);
        assert_eq!(config.refresh_interval_secs, 3);
        assert_eq!(config.fetch_range_secs, 600);
        assert_eq!(config.measurement, "dns");
        assert_eq!(config.contamination_fraction, 0.05);
        assert_eq!(config.feature_set, vec!["dns_rate", "inter_arrival_time"]);
        assert_eq!(config.normalization, NormalizationStrategy::Standard);
        assert_eq!(config.tree_count, 100);
        assert_eq!(config.subsample_size, 256);
        assert_eq!(config.random_seed, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_helpers() {
        let config = DetectorConfig { refresh_interval_secs: 3, fetch_timeout_secs: 30, ..Default::default() };
        assert_eq!(config.refresh_interval(), Duration::from_secs(3));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
        assert_eq!(config.fetch_range(), Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_non_positive_bounds() {
        let config = DetectorConfig { window_capacity: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveCapacity));

        let config = DetectorConfig { refresh_interval_secs: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveInterval));

        let config = DetectorConfig { fetch_range_secs: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveFetchRange));

        let config = DetectorConfig { fetch_timeout_secs: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveFetchTimeout));
    }

    #[test]
    fn test_validate_rejects_bad_contamination() {
        for bad in [0.0, -0.1, 0.51, f64::NAN] {
            let config = DetectorConfig { contamination_fraction: bad, ..Default::default() };
            assert!(config.validate().is_err(), "contamination {} should be rejected", bad);
        }
        let config = DetectorConfig { contamination_fraction: 0.5, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_features() {
        let config = DetectorConfig { feature_set: vec![], ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::EmptyFeatureSet));

        let config = DetectorConfig {
            feature_set: vec!["query_rate".to_string()], // alias, not canonical
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::UnknownFeature("query_rate".to_string())));
    }

    #[test]
    fn test_raw_fields_substitutes_derived_rate() {
        let config = DetectorConfig {
            feature_set: vec!["request_rate".to_string(), "packet_length".to_string()],
            ..Default::default()
        };
        // request_rate is derived, so the raw fetch needs inter_arrival_time.
        assert_eq!(config.raw_fields(), vec!["inter_arrival_time", "packet_length"]);

        let config = DetectorConfig::default();
        assert_eq!(config.raw_fields(), vec!["dns_rate", "inter_arrival_time"]);
    }
}
