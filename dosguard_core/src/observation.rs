// Observation, verdict and report definitions
use serde::{Serialize, Deserialize};
use std::time::SystemTime;

/// Canonical feature names recognized by the engine. Ingestion maps the
/// alternate probe vocabulary (`query_rate`, `inter_request_time`) onto these
/// before an `Observation` is ever constructed; the scorer only sees the
/// canonical names.
pub const PACKET_LENGTH: &str = "packet_length";
pub const INTER_ARRIVAL_TIME: &str = "inter_arrival_time";
pub const DNS_RATE: &str = "dns_rate";
pub const REQUEST_RATE: &str = "request_rate";

/// All feature names the window can project into a matrix column.
pub const KNOWN_FEATURES: [&str; 4] = [PACKET_LENGTH, INTER_ARRIVAL_TIME, DNS_RATE, REQUEST_RATE];

/// One traffic sample. Immutable once created; owned by the window after
/// ingestion. `request_rate` is derived from `inter_arrival_time` at
/// construction and may be non-finite until ingestion sanitization has
/// forward-filled it (see `ingest::sanitize_batch`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Observation {
    pub timestamp: SystemTime,
    pub packet_length: f64,
    pub inter_arrival_time: f64,
    pub dns_rate: f64,
    pub request_rate: f64,
}

impl Observation {
    /// Builds an observation, deriving `request_rate = 1 / inter_arrival_time`.
    /// A zero inter-arrival time yields an infinite rate here; the ingestion
    /// boundary replaces it before the observation reaches the window.
    pub fn new(timestamp: SystemTime, packet_length: f64, inter_arrival_time: f64, dns_rate: f64) -> Self {
        Observation {
            timestamp,
            packet_length,
            inter_arrival_time,
            dns_rate,
            request_rate: 1.0 / inter_arrival_time,
        }
    }

    /// Same as `new` but with an explicit `request_rate` (used by the
    /// forward-fill path, which substitutes the nearest preceding valid rate).
    pub fn with_request_rate(
        timestamp: SystemTime,
        packet_length: f64,
        inter_arrival_time: f64,
        dns_rate: f64,
        request_rate: f64,
    ) -> Self {
        Observation { timestamp, packet_length, inter_arrival_time, dns_rate, request_rate }
    }

    /// Looks a feature up by canonical name. Returns `None` for names outside
    /// `KNOWN_FEATURES`; an absent field is represented as `NaN`, not `None`.
    pub fn feature(&self, name: &str) -> Option<f64> {
        match name {
            PACKET_LENGTH => Some(self.packet_length),
            INTER_ARRIVAL_TIME => Some(self.inter_arrival_time),
            DNS_RATE => Some(self.dns_rate),
            REQUEST_RATE => Some(self.request_rate),
            _ => None,
        }
    }
}

/// Per-observation outcome of one scoring pass. Recomputed for the entire
/// window every pass; a verdict never survives into the next pass.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub anomaly_score: f64,
    pub is_anomaly: bool,
}

/// What the orchestrator hands to the presentation collaborator once per
/// completed cycle: the window snapshot, the aligned verdicts, and the
/// wall-clock cost of the scoring pass.
#[derive(Serialize, Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub observations: Vec<Observation>,
    pub verdicts: Vec<Verdict>,
    pub latency_seconds: f64,
}

impl CycleReport {
    pub fn anomaly_count(&self) -> usize {
        self.verdicts.iter().filter(|v| v.is_anomaly).count()
    }

    /// JSON rendering for collaborators that want a serialized payload.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Outcome of a manual single-point prediction, kept in the bounded
/// prediction history ring.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PredictionRecord {
    pub timestamp: SystemTime,
    pub inter_arrival_time: f64,
    pub dns_rate: f64,
    pub request_rate: f64,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_rate_is_derived() {
        let obs = Observation::new(SystemTime::now(), 512.0, 0.25, 4.0);
        assert_eq!(obs.request_rate, 4.0);
    }

    #[test]
    fn test_zero_inter_arrival_time_yields_infinite_rate() {
        // The raw constructor does not sanitize; that is ingestion's job.
        let obs = Observation::new(SystemTime::now(), 512.0, 0.0, 4.0);
        assert!(obs.request_rate.is_infinite());
    }

    #[test]
    fn test_feature_lookup_by_name() {
        let obs = Observation::new(SystemTime::now(), 128.0, 0.5, 10.0);
        assert_eq!(obs.feature(PACKET_LENGTH), Some(128.0));
        assert_eq!(obs.feature(INTER_ARRIVAL_TIME), Some(0.5));
        assert_eq!(obs.feature(DNS_RATE), Some(10.0));
        assert_eq!(obs.feature(REQUEST_RATE), Some(2.0));
        assert_eq!(obs.feature("no_such_feature"), None);
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = CycleReport {
            cycle: 3,
            observations: vec![Observation::new(SystemTime::now(), 512.0, 0.1, 2.0)],
            verdicts: vec![Verdict { anomaly_score: 0.41, is_anomaly: false }],
            latency_seconds: 0.0042,
        };
        let json = report.to_json_string();
        assert!(json.contains("\"cycle\":3"));
        assert!(json.contains("anomaly_score"));
        assert_eq!(report.anomaly_count(), 0);
    }
}
